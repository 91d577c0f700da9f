use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use facegate_core::{Metric, Purpose, VerificationOptions};
use serde::Deserialize;
use thiserror::Error;

/// Default descriptor dimension (dlib / face-api family).
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid verification options: {0}")]
    Options(#[from] facegate_core::ConfigError),
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Length every enrolled and observed descriptor must have.
    pub descriptor_dim: usize,
    /// Engine tunables shared by every session.
    pub verification: VerificationOptions,
    /// Call sites that skip the blink challenge.
    pub liveness_exempt: HashSet<Purpose>,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

/// Shape of the optional TOML file named by `FACEGATE_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    db_path: Option<PathBuf>,
    descriptor_dim: Option<usize>,
    liveness_exempt: Option<Vec<Purpose>>,
    verification: Option<VerificationOptions>,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with
    /// defaults, then overlay the TOML file named by `FACEGATE_CONFIG`.
    pub fn from_env() -> Result<Self, LoadError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        if let Ok(path) = std::env::var("FACEGATE_CONFIG") {
            let path = PathBuf::from(path);
            let text = std::fs::read_to_string(&path).map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            })?;
            config.overlay_toml(&text)?;
            tracing::info!(path = %path.display(), "config file applied");
        }
        config.verification.validate()?;
        Ok(config)
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let parse_f32 = |key: &str, default: f32| get(key).and_then(|v| v.parse().ok()).unwrap_or(default);
        let parse_u32 = |key: &str, default: u32| get(key).and_then(|v| v.parse().ok()).unwrap_or(default);
        let parse_u64 = |key: &str, default: u64| get(key).and_then(|v| v.parse().ok()).unwrap_or(default);
        let flag = |key: &str, default: bool| get(key).map(|v| v != "0").unwrap_or(default);

        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let db_path = get("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("facegate.db"));

        let preset = match get("FACEGATE_METRIC").as_deref() {
            Some("cosine") => VerificationOptions::cosine(),
            _ => VerificationOptions::euclidean(),
        };
        let verification = VerificationOptions {
            match_threshold: parse_f32("FACEGATE_MATCH_THRESHOLD", preset.match_threshold),
            reject_threshold: parse_f32("FACEGATE_REJECT_THRESHOLD", preset.reject_threshold),
            required_blink_count: parse_u32("FACEGATE_REQUIRED_BLINKS", preset.required_blink_count),
            max_attempts: parse_u32("FACEGATE_MAX_ATTEMPTS", preset.max_attempts),
            lockout_duration: Duration::from_secs(parse_u64(
                "FACEGATE_LOCKOUT_SECS",
                preset.lockout_duration.as_secs(),
            )),
            session_timeout: Duration::from_secs(parse_u64(
                "FACEGATE_SESSION_TIMEOUT_SECS",
                preset.session_timeout.as_secs(),
            )),
            sample_every_n_frames: parse_u32("FACEGATE_SAMPLE_EVERY", preset.sample_every_n_frames),
            min_detection_confidence: parse_f32("FACEGATE_MIN_CONFIDENCE", preset.min_detection_confidence),
            fallback_enabled: flag("FACEGATE_FALLBACK_ENABLED", preset.fallback_enabled),
            max_fallback_attempts: parse_u32("FACEGATE_MAX_FALLBACK_ATTEMPTS", preset.max_fallback_attempts),
            ..preset
        };

        let liveness_exempt = get("FACEGATE_LIVENESS_EXEMPT")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| match s.parse::<Purpose>() {
                        Ok(p) => Some(p),
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring FACEGATE_LIVENESS_EXEMPT entry");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            db_path,
            descriptor_dim: get("FACEGATE_DESCRIPTOR_DIM")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DESCRIPTOR_DIM),
            verification,
            liveness_exempt,
            session_bus: get("FACEGATE_SESSION_BUS").is_some(),
        }
    }

    /// Apply a TOML document. A `[verification]` table replaces the engine
    /// options wholesale; missing keys take the engine defaults.
    fn overlay_toml(&mut self, text: &str) -> Result<(), LoadError> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(path) = file.db_path {
            self.db_path = path;
        }
        if let Some(dim) = file.descriptor_dim {
            self.descriptor_dim = dim;
        }
        if let Some(exempt) = file.liveness_exempt {
            self.liveness_exempt = exempt.into_iter().collect();
        }
        if let Some(verification) = file.verification {
            self.verification = verification;
        }
        Ok(())
    }

    /// Options for one session, with liveness decided by the call site.
    pub fn options_for(&self, purpose: Purpose) -> VerificationOptions {
        if self.liveness_exempt.contains(&purpose) {
            self.verification.clone().with_required_blinks(0)
        } else {
            self.verification.clone()
        }
    }

    pub fn metric(&self) -> Metric {
        self.verification.metric
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("HOME", "/home/alice")]));
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/alice/.local/share/facegate/facegate.db")
        );
        assert_eq!(config.descriptor_dim, 128);
        assert_eq!(config.verification, VerificationOptions::euclidean());
        assert!(config.liveness_exempt.is_empty());
        assert!(!config.session_bus);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("FACEGATE_METRIC", "cosine"),
            ("FACEGATE_MAX_ATTEMPTS", "5"),
            ("FACEGATE_LOCKOUT_SECS", "60"),
            ("FACEGATE_FALLBACK_ENABLED", "0"),
            ("FACEGATE_LIVENESS_EXEMPT", "check_out, bogus"),
            ("FACEGATE_SESSION_BUS", "1"),
        ]));
        assert_eq!(config.metric(), Metric::Cosine);
        assert_eq!(config.verification.max_attempts, 5);
        assert_eq!(config.verification.lockout_duration, Duration::from_secs(60));
        assert!(!config.verification.fallback_enabled);
        assert!((config.verification.match_threshold - 0.40).abs() < 1e-6);
        assert_eq!(config.liveness_exempt, HashSet::from([Purpose::CheckOut]));
        assert!(config.session_bus);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = Config::from_lookup(lookup(&[("FACEGATE_MAX_ATTEMPTS", "three")]));
        assert_eq!(config.verification.max_attempts, 3);
    }

    #[test]
    fn test_toml_overlay() {
        let mut config = Config::from_lookup(lookup(&[]));
        config
            .overlay_toml(
                r#"
                db_path = "/var/lib/facegate/facegate.db"
                descriptor_dim = 512
                liveness_exempt = ["check_out"]

                [verification]
                metric = "cosine"
                match_threshold = 0.45
                reject_threshold = 0.2
                required_blink_count = 1
                "#,
            )
            .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facegate/facegate.db"));
        assert_eq!(config.descriptor_dim, 512);
        assert_eq!(config.metric(), Metric::Cosine);
        assert_eq!(config.verification.required_blink_count, 1);
        assert_eq!(config.verification.max_attempts, 3);
        assert!(config.verification.validate().is_ok());
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let mut config = Config::from_lookup(lookup(&[]));
        assert!(matches!(
            config.overlay_toml("verification = 3"),
            Err(LoadError::Toml(_))
        ));
    }

    #[test]
    fn test_liveness_per_call_site() {
        let mut config = Config::from_lookup(lookup(&[]));
        config.liveness_exempt.insert(Purpose::CheckOut);
        assert_eq!(config.options_for(Purpose::CheckOut).required_blink_count, 0);
        assert_eq!(config.options_for(Purpose::CheckIn).required_blink_count, 2);
    }
}
