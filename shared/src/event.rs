use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::PropertyId;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SaveAction {
    Added,
    Removed,
}

impl SaveAction {
    pub fn from_saved(saved: bool) -> Self {
        if saved {
            SaveAction::Added
        } else {
            SaveAction::Removed
        }
    }

    pub fn is_saved(self) -> bool {
        matches!(self, SaveAction::Added)
    }
}

/// A settled save-state change. Subscribers treat it as a refetch trigger.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SaveEvent {
    pub property_id: PropertyId,
    pub action: SaveAction,
}

impl SaveEvent {
    pub fn added(property_id: PropertyId) -> Self {
        Self {
            property_id,
            action: SaveAction::Added,
        }
    }

    pub fn removed(property_id: PropertyId) -> Self {
        Self {
            property_id,
            action: SaveAction::Removed,
        }
    }
}

impl fmt::Display for SaveEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.action {
            SaveAction::Added => "added",
            SaveAction::Removed => "removed",
        };
        write!(f, "{} {}", self.property_id, verb)
    }
}
