//! Analyzer configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! { "root_class_name": "com.example.app.MainApplication" }
//! ```

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, AnalysisErrorKind};

/// Settings for the loader, the helper rule and the bitmap hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    /// Instances of this class (subclasses excluded) are the traversal
    /// roots.
    pub root_class_name: String,

    /// References to objects of exactly these types are not followed.
    pub skipped_reference_types: Vec<String>,

    /// References to objects whose type name contains any of these are not
    /// followed.
    pub skipped_reference_substrings: Vec<String>,

    /// Types starting with any of these are always treated as helpers.
    pub infrastructure_prefixes: Vec<String>,

    pub bitmap: BitmapConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            root_class_name: "com.google.android.clockwork.home.HomeApplication"
                .to_owned(),
            skipped_reference_types: vec![
                "java.lang.ref.WeakReference".to_owned(),
                "java.lang.ref.FinalizerReference".to_owned(),
                "java.lang.reflect.ArtMethod".to_owned(),
            ],
            skipped_reference_substrings: vec!["ClassLoader".to_owned()],
            infrastructure_prefixes: vec![
                "java.".to_owned(),
                "android.".to_owned(),
            ],
            bitmap: BitmapConfig::default(),
        }
    }
}

impl AnalyzerConfig {
    /// Reads a JSON config.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError`] if the input is not a valid config
    /// ([`AnalysisError::is_config`]).
    pub fn from_reader(input: impl Read) -> Result<Self, AnalysisError> {
        serde_json::from_reader(input)
            .map_err(|e| AnalysisError::new(AnalysisErrorKind::Config(e)))
    }

    /// Reads a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError`] if the file cannot be opened
    /// ([`AnalysisError::is_io`]) or does not parse
    /// ([`AnalysisError::is_config`]).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// True if references to objects of this type are dropped at load
    /// time.
    pub fn is_skipped_type(&self, type_name: &str) -> bool {
        self.skipped_reference_types.iter().any(|t| t == type_name)
            || self
                .skipped_reference_substrings
                .iter()
                .any(|s| type_name.contains(s.as_str()))
    }

    /// True if the type belongs to the runtime or the platform.
    pub fn is_infrastructure(&self, type_name: &str) -> bool {
        self.infrastructure_prefixes
            .iter()
            .any(|p| type_name.starts_with(p.as_str()))
    }
}

/// Where Android keeps bitmap pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BitmapConfig {
    pub class_name: String,
    /// Field of the bitmap holding the `byte[]` pixel buffer.
    pub buffer_field: String,
    pub width_field: String,
    pub height_field: String,
}

impl Default for BitmapConfig {
    fn default() -> Self {
        Self {
            class_name: "android.graphics.Bitmap".to_owned(),
            buffer_field: "mBuffer".to_owned(),
            width_field: "mWidth".to_owned(),
            height_field: "mHeight".to_owned(),
        }
    }
}
