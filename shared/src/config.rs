use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_PRIMARY_ORIGIN: &str = "https://admin-api.homefinder.app";
pub const DEFAULT_SECONDARY_ORIGIN: &str = "https://api.homefinder.app";
pub const DEFAULT_PLACEHOLDER_URI: &str =
    "https://placehold.co/600x400/e2e8f0/64748b?text=No+Image";
pub const DEFAULT_MOCK_PLACEHOLDER_BASE: &str = "https://placehold.co";
pub const DEFAULT_BASE64_MIN_LEN: usize = 100;
pub const DEFAULT_RESOLVER_CACHE_SIZE: usize = 256;
pub const DEFAULT_MAX_PENDING_SUBMISSIONS: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid origin '{origin}': {reason}")]
    InvalidOrigin { origin: String, reason: String },

    #[error("primary and secondary origins must differ ({0})")]
    SameOrigins(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("malformed config: {0}")]
    Parse(String),
}

/// What to do when a listing arrives without its authored-by flag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingOriginPolicy {
    /// Route to the secondary origin, which owns most listings.
    #[default]
    DefaultSecondary,
    /// Show the placeholder so the missing flag is visible.
    Placeholder,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Origin A: upload service used for listings authored on the primary side.
    pub primary: String,
    /// Origin B: upload service for everything else.
    pub secondary: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_ORIGIN.to_string(),
            secondary: DEFAULT_SECONDARY_ORIGIN.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_PENDING_SUBMISSIONS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub origins: OriginConfig,
    pub placeholder_uri: String,
    pub relative_prefixes: Vec<String>,
    pub base64_min_len: usize,
    pub mock_placeholder_base: String,
    pub missing_origin_policy: MissingOriginPolicy,
    pub resolver_cache_size: usize,
    pub queue: QueueConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            origins: OriginConfig::default(),
            placeholder_uri: DEFAULT_PLACEHOLDER_URI.to_string(),
            relative_prefixes: vec!["uploads/".to_string()],
            base64_min_len: DEFAULT_BASE64_MIN_LEN,
            mock_placeholder_base: DEFAULT_MOCK_PLACEHOLDER_BASE.to_string(),
            missing_origin_policy: MissingOriginPolicy::default(),
            resolver_cache_size: DEFAULT_RESOLVER_CACHE_SIZE,
            queue: QueueConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Parses and validates a JSON config handed over by the shell.
    /// Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn with_origins(mut self, primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        self.origins = OriginConfig {
            primary: primary.into(),
            secondary: secondary.into(),
        };
        self.normalize();
        self
    }

    fn normalize(&mut self) {
        self.origins.primary = self.origins.primary.trim().trim_end_matches('/').to_string();
        self.origins.secondary = self.origins.secondary.trim().trim_end_matches('/').to_string();
        self.mock_placeholder_base = self.mock_placeholder_base.trim_end_matches('/').to_string();
        for prefix in &mut self.relative_prefixes {
            let trimmed = prefix.replace('\\', "/").trim_start_matches('/').to_string();
            *prefix = if trimmed.ends_with('/') {
                trimmed
            } else {
                format!("{trimmed}/")
            };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_origin(&self.origins.primary)?;
        validate_origin(&self.origins.secondary)?;
        if self.origins.primary.eq_ignore_ascii_case(&self.origins.secondary) {
            return Err(ConfigError::SameOrigins(self.origins.primary.clone()));
        }
        if self.placeholder_uri.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "placeholder_uri",
                reason: "must not be empty".into(),
            });
        }
        if self.relative_prefixes.iter().any(|p| p.trim_matches('/').is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "relative_prefixes",
                reason: "prefixes must not be empty".into(),
            });
        }
        if self.base64_min_len == 0 {
            return Err(ConfigError::InvalidValue {
                field: "base64_min_len",
                reason: "must be > 0".into(),
            });
        }
        validate_origin(&self.mock_placeholder_base)?;
        if self.resolver_cache_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolver_cache_size",
                reason: "must be > 0".into(),
            });
        }
        if self.queue.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_entries",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

fn validate_origin(origin: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(origin).map_err(|e| ConfigError::InvalidOrigin {
        origin: origin.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ConfigError::InvalidOrigin {
            origin: origin.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidOrigin {
            origin: origin.to_string(),
            reason: "missing host".into(),
        });
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(ConfigError::InvalidOrigin {
            origin: origin.to_string(),
            reason: "origin cannot carry a query or fragment".into(),
        });
    }
    Ok(())
}
