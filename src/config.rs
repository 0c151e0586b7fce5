use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "TriCare Imaging";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upload ceiling carried over from the upload route (10 MB).
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Heatmap policy: below this confidence a result counts as uncertain.
pub const DEFAULT_UNCERTAINTY_THRESHOLD: f32 = 0.6;

/// Heatmap opacity when blended over the original image.
pub const DEFAULT_HEATMAP_OPACITY: f32 = 0.4;

/// Upper bound for a single fallback vision call. Never retried.
pub const DEFAULT_FALLBACK_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_FALLBACK_URL: &str = "http://localhost:11434";
pub const DEFAULT_FALLBACK_MODEL: &str = "medgemma:4b";

/// Get the application data directory.
/// Falls back to the home directory, then the working directory, when the
/// platform has no data dir.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tricare")
}

/// Get the models directory
pub fn models_dir() -> PathBuf {
    app_data_dir().join("models")
}

/// Default location of the chest X-ray classifier artifact (`model.json` + weights).
pub fn default_model_dir() -> PathBuf {
    models_dir().join("xray-classifier")
}

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "tricare_imaging=info,warn"
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("{key} out of range: {value}")]
    OutOfRange { key: &'static str, value: f64 },
}

/// Runtime settings for the imaging pipeline.
///
/// Built from defaults, then overridden by `TRICARE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingSettings {
    /// Directory holding `model.json` and the backbone weights.
    pub model_dir: PathBuf,
    pub fallback_url: String,
    pub fallback_model: String,
    pub fallback_timeout_secs: u64,
    pub uncertainty_threshold: f32,
    pub heatmap_opacity: f32,
    /// Generate Grad-CAM for every classified image, not just abnormal/uncertain ones.
    pub always_generate_heatmap: bool,
    pub max_image_bytes: usize,
    /// Per-request diagnostic dumps. Disabled when `None`.
    pub dump_dir: Option<PathBuf>,
}

impl Default for ImagingSettings {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            fallback_url: DEFAULT_FALLBACK_URL.to_string(),
            fallback_model: DEFAULT_FALLBACK_MODEL.to_string(),
            fallback_timeout_secs: DEFAULT_FALLBACK_TIMEOUT_SECS,
            uncertainty_threshold: DEFAULT_UNCERTAINTY_THRESHOLD,
            heatmap_opacity: DEFAULT_HEATMAP_OPACITY,
            always_generate_heatmap: false,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            dump_dir: None,
        }
    }
}

impl ImagingSettings {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TRICARE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("TRICARE_FALLBACK_URL") {
            self.fallback_url = url;
        }
        if let Some(model) = lookup("TRICARE_FALLBACK_MODEL") {
            self.fallback_model = model;
        }
        if let Some(raw) = lookup("TRICARE_FALLBACK_TIMEOUT_SECS") {
            self.fallback_timeout_secs = parse_value("TRICARE_FALLBACK_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("TRICARE_UNCERTAINTY_THRESHOLD") {
            self.uncertainty_threshold = parse_value("TRICARE_UNCERTAINTY_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("TRICARE_HEATMAP_OPACITY") {
            self.heatmap_opacity = parse_value("TRICARE_HEATMAP_OPACITY", &raw)?;
        }
        if let Some(raw) = lookup("TRICARE_ALWAYS_HEATMAP") {
            self.always_generate_heatmap = parse_flag("TRICARE_ALWAYS_HEATMAP", &raw)?;
        }
        if let Some(raw) = lookup("TRICARE_MAX_IMAGE_BYTES") {
            self.max_image_bytes = parse_value("TRICARE_MAX_IMAGE_BYTES", &raw)?;
        }
        if let Some(dir) = lookup("TRICARE_DUMP_DIR") {
            self.dump_dir = Some(PathBuf::from(dir));
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // A threshold below 0.5 can never fire: confidence is always >= 0.5.
        if !(0.5..=1.0).contains(&self.uncertainty_threshold) {
            return Err(ConfigError::OutOfRange {
                key: "uncertainty_threshold",
                value: self.uncertainty_threshold as f64,
            });
        }
        if !(0.0..=1.0).contains(&self.heatmap_opacity) {
            return Err(ConfigError::OutOfRange {
                key: "heatmap_opacity",
                value: self.heatmap_opacity as f64,
            });
        }
        if self.fallback_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange {
                key: "fallback_timeout_secs",
                value: 0.0,
            });
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::OutOfRange {
                key: "max_image_bytes",
                value: 0.0,
            });
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn model_dir_under_app_data() {
        let models = default_model_dir();
        assert!(models.starts_with(app_data_dir()));
        assert!(models.ends_with("xray-classifier"));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn defaults_are_valid() {
        let settings = ImagingSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.fallback_timeout_secs, 30);
        assert!((settings.uncertainty_threshold - 0.6).abs() < f32::EPSILON);
        assert!((settings.heatmap_opacity - 0.4).abs() < f32::EPSILON);
        assert!(settings.dump_dir.is_none());
    }

    #[test]
    fn overrides_apply() {
        let settings = ImagingSettings::default()
            .with_overrides(lookup_from(&[
                ("TRICARE_MODEL_DIR", "/opt/models/xray"),
                ("TRICARE_FALLBACK_TIMEOUT_SECS", "12"),
                ("TRICARE_UNCERTAINTY_THRESHOLD", "0.75"),
                ("TRICARE_ALWAYS_HEATMAP", "yes"),
                ("TRICARE_DUMP_DIR", "/tmp/dumps"),
            ]))
            .unwrap();
        assert_eq!(settings.model_dir, PathBuf::from("/opt/models/xray"));
        assert_eq!(settings.fallback_timeout_secs, 12);
        assert!((settings.uncertainty_threshold - 0.75).abs() < f32::EPSILON);
        assert!(settings.always_generate_heatmap);
        assert_eq!(settings.dump_dir, Some(PathBuf::from("/tmp/dumps")));
    }

    #[test]
    fn unparsable_override_is_rejected() {
        let err = ImagingSettings::default()
            .with_overrides(lookup_from(&[("TRICARE_HEATMAP_OPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "TRICARE_HEATMAP_OPACITY", .. }));
    }

    #[test]
    fn threshold_below_half_is_out_of_range() {
        let err = ImagingSettings::default()
            .with_overrides(lookup_from(&[("TRICARE_UNCERTAINTY_THRESHOLD", "0.3")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "uncertainty_threshold", .. }));
    }

    #[test]
    fn zero_timeout_is_out_of_range() {
        let err = ImagingSettings::default()
            .with_overrides(lookup_from(&[("TRICARE_FALLBACK_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "fallback_timeout_secs", .. }));
    }

    #[test]
    fn bad_flag_is_rejected() {
        let err = ImagingSettings::default()
            .with_overrides(lookup_from(&[("TRICARE_ALWAYS_HEATMAP", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
