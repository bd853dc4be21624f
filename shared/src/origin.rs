//! Two-origin routing for backend-relative upload paths.
//!
//! Listings come from two upload services that do not share storage. Which one
//! owns a listing's files is carried by [`OriginContext`]; routing a path to the
//! wrong origin produces a broken image, so every call site that renders a
//! listing's media must pass the listing's context through.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CoreConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginContext {
    #[serde(alias = "authoredByPrimaryOrigin")]
    pub authored_by_primary_origin: bool,
}

impl OriginContext {
    pub const PRIMARY: Self = Self {
        authored_by_primary_origin: true,
    };
    pub const SECONDARY: Self = Self {
        authored_by_primary_origin: false,
    };

    pub fn new(authored_by_primary_origin: bool) -> Self {
        Self {
            authored_by_primary_origin,
        }
    }

    /// Reads the authored-by flag off a listing JSON object.
    /// Returns `None` when the flag is missing or not a boolean-like value.
    pub fn from_listing(listing: &Value) -> Option<Self> {
        let flag = listing
            .get("authoredByPrimaryOrigin")
            .or_else(|| listing.get("authored_by_primary_origin"))?;
        match flag {
            Value::Bool(b) => Some(Self::new(*b)),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(Self::PRIMARY),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(Self::SECONDARY),
            _ => None,
        }
    }
}

/// Picks the upload origin for a listing and builds absolute URLs.
/// Pure string construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginRouter {
    primary: String,
    secondary: String,
}

impl OriginRouter {
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into().trim_end_matches('/').to_string(),
            secondary: secondary.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.origins.primary.clone(), config.origins.secondary.clone())
    }

    /// Origin A when the listing was authored on the primary side, origin B
    /// otherwise. A missing context selects origin B.
    pub fn origin_for(&self, origin: Option<OriginContext>) -> &str {
        match origin {
            Some(ctx) if ctx.authored_by_primary_origin => &self.primary,
            _ => &self.secondary,
        }
    }

    pub fn route(&self, relative_path: &str, origin: Option<OriginContext>) -> String {
        let normalized = relative_path.replace('\\', "/");
        let path = normalized.trim_start_matches('/');
        format!("{}/{}", self.origin_for(origin), path)
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn secondary(&self) -> &str {
        &self.secondary
    }
}

impl Default for OriginRouter {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}
