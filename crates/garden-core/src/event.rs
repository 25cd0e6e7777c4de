//! # Garden Events
//!
//! Notifications a garden publishes about its own state changes.
//!
//! Each event kind carries its own typed payload, so handlers match on the
//! variant instead of digging through a loose metadata map.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SyncedUser;

/// Emitted whenever a local user is saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdated {
    /// Garden that owns the user record.
    pub garden: String,
    pub user: SyncedUser,
    pub timestamp: DateTime<Utc>,
}

/// Typed payload, discriminated by event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    UserUpdated(UserUpdated),
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::UserUpdated(_) => "USER_UPDATED",
        }
    }
}

/// An event plus the garden it originated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GardenEvent {
    pub garden: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl GardenEvent {
    /// Builds a USER_UPDATED event stamped with the current time.
    pub fn user_updated(garden: impl Into<String>, user: SyncedUser) -> Self {
        let garden = garden.into();
        let timestamp = Utc::now();
        GardenEvent {
            garden: garden.clone(),
            timestamp,
            payload: EventPayload::UserUpdated(UserUpdated {
                garden,
                user,
                timestamp,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

impl fmt::Display for GardenEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.name(), self.garden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::User;
    use serde_json::json;

    #[test]
    fn test_user_updated_wire_shape() {
        let event = GardenEvent::user_updated("parent", User::new("ada").to_synced());
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["garden"], json!("parent"));
        assert_eq!(value["payload"]["name"], json!("USER_UPDATED"));
        assert_eq!(value["payload"]["payload"]["user"]["username"], json!("ada"));
        assert_eq!(event.to_string(), "USER_UPDATED from parent");
    }

    #[test]
    fn test_missing_user_key_is_rejected() {
        let value = json!({
            "garden": "child",
            "timestamp": "2024-01-01T00:00:00Z",
            "payload": {
                "name": "USER_UPDATED",
                "payload": {"garden": "child", "timestamp": "2024-01-01T00:00:00Z"}
            }
        });
        assert!(serde_json::from_value::<GardenEvent>(value).is_err());
    }
}
