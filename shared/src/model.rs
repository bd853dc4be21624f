use serde::{Deserialize, Serialize};
use std::fmt;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(PropertyId);
typed_id!(UserId);
typed_id!(SubmissionId);

impl SubmissionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(crate::get_current_time_ms())
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListingType {
    #[default]
    Sale,
    Rent,
}

/// A local file picked for upload. Never holds the bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MediaAttachment {
    pub uri: String,
    pub mime_type: String,
    pub file_name: String,
}

impl MediaAttachment {
    pub fn is_video(&self) -> bool {
        self.mime_type.to_ascii_lowercase().starts_with("video/")
    }
}

/// Property-creation payload handed to the network layer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PropertySubmission {
    pub title: String,
    pub description: Option<String>,
    pub price: f64,
    pub listing_type: ListingType,
    pub address: String,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
}

impl PropertySubmission {
    pub const MAX_TITLE_LENGTH: usize = 200;
    pub const MAX_DESCRIPTION_LENGTH: usize = 4096;
    pub const MAX_MEDIA: usize = 30;

    pub fn validate(&self) -> Result<(), crate::AppError> {
        use crate::{AppError, ErrorKind};

        if self.title.trim().is_empty() {
            return Err(AppError::new(ErrorKind::Validation, "Title is required"));
        }
        if self.title.len() > Self::MAX_TITLE_LENGTH {
            return Err(AppError::new(
                ErrorKind::Validation,
                format!("Title exceeds {} characters", Self::MAX_TITLE_LENGTH),
            ));
        }
        if let Some(desc) = &self.description {
            if desc.len() > Self::MAX_DESCRIPTION_LENGTH {
                return Err(AppError::new(
                    ErrorKind::Validation,
                    format!("Description exceeds {} characters", Self::MAX_DESCRIPTION_LENGTH),
                ));
            }
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(AppError::new(ErrorKind::Validation, "Price must be a positive number"));
        }
        if self.address.trim().is_empty() {
            return Err(AppError::new(ErrorKind::Validation, "Address is required"));
        }
        if self.media.len() > Self::MAX_MEDIA {
            return Err(AppError::new(
                ErrorKind::Validation,
                format!("At most {} photos and videos per listing", Self::MAX_MEDIA),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    PendingSync,
}

/// A creation payload waiting for connectivity. Removed once synced.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PendingSubmission {
    pub id: SubmissionId,
    pub payload: PropertySubmission,
    pub status: SyncStatus,
    pub queued_at: UnixTimeMs,
}

impl PendingSubmission {
    pub fn new(payload: PropertySubmission, now: UnixTimeMs) -> Self {
        Self {
            id: SubmissionId::generate(),
            payload,
            status: SyncStatus::PendingSync,
            queued_at: now,
        }
    }
}
