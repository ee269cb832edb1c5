use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncErrorCategory};

/// Status of the remote sync loop as reported by the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum SyncStatus {
    /// No sync loop is running.
    #[default]
    Stopped,
    /// First sync for a session without a stored token.
    InitialSync,
    /// Resuming from a stored token, or recovering after an error.
    CatchupSync,
    /// Loop is caught up and long-polling.
    Syncing,
    /// Loop hit an error; it may recover back to `CatchupSync`.
    Error,
}

impl SyncStatus {
    /// Stable status string used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::InitialSync => "InitialSync",
            Self::CatchupSync => "CatchupSync",
            Self::Syncing => "Syncing",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Stopped" => Ok(Self::Stopped),
            "InitialSync" => Ok(Self::InitialSync),
            "CatchupSync" => Ok(Self::CatchupSync),
            "Syncing" => Ok(Self::Syncing),
            "Error" => Ok(Self::Error),
            other => Err(SyncError::new(
                SyncErrorCategory::Serialization,
                "unknown_sync_status",
                format!("unknown sync status '{other}'"),
            )),
        }
    }
}

/// Continuation cursor of the sync loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    /// `next_batch` token of the last applied sync response.
    pub token: String,
    /// Server-side filter used for sync requests.
    pub filter_id: String,
}

/// Result of decrypting one to-device message.
///
/// Decryption itself happens elsewhere; only the outcome crosses the worker
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionResult {
    /// Decrypted cleartext event.
    pub event: Value,
    /// Curve25519 key of the sending device.
    pub sender_curve25519_key: Option<String>,
    /// Ed25519 key the sender claims to own.
    pub claimed_ed25519_key: Option<String>,
}

impl DecryptionResult {
    /// Event `type` of the decrypted payload, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.event.get("type").and_then(Value::as_str)
    }

    /// Whether the decrypted payload shares a room key.
    pub fn is_room_key(&self) -> bool {
        matches!(
            self.event_type(),
            Some("m.room_key") | Some("m.forwarded_room_key")
        )
    }
}

/// One increment of server state to apply to the local session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionChanges {
    /// New cursor; must be persisted before the next cycle.
    pub sync_info: SyncInfo,
    /// Whether room keys arrived in this increment.
    pub has_new_room_keys: bool,
    /// Account-data change count reported by the e2ee account, if any.
    pub e2ee_account_changes: Option<u64>,
    /// Decryption outcomes in arrival order.
    pub device_message_decryption_results: Option<Vec<DecryptionResult>>,
}

/// Serializable payload of a locally queued outgoing event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingEventData {
    /// Target room.
    pub room_id: String,
    /// Client transaction id, used for idempotent delivery and echo matching.
    pub txn_id: String,
    /// Matrix event type, for example `m.room.message`.
    pub event_type: String,
    /// Event content.
    pub content: Value,
}

impl PendingEventData {
    /// Reject payloads the homeserver could never accept.
    pub fn validate(&self) -> Result<(), SyncError> {
        let missing = [
            ("room_id", self.room_id.trim().is_empty()),
            ("txn_id", self.txn_id.trim().is_empty()),
            ("event_type", self.event_type.trim().is_empty()),
        ]
        .into_iter()
        .find_map(|(field, empty)| empty.then_some(field));

        if let Some(field) = missing {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "invalid_pending_event",
                format!("pending event is missing '{field}'"),
            ));
        }
        if !self.content.is_object() {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "invalid_pending_event",
                "pending event content must be a JSON object",
            ));
        }
        Ok(())
    }
}

/// Identity and credentials the worker needs to run a sync loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncParams {
    pub session_id: String,
    pub device_id: String,
    pub user_id: String,
    /// Homeserver base URL, for example `https://matrix.example.org`.
    pub homeserver: String,
    pub access_token: String,
    /// Stored cursor to resume from instead of an initial sync.
    #[serde(default)]
    pub resume: Option<SyncInfo>,
}

impl StartSyncParams {
    /// Check that every identity field is present.
    pub fn validate(&self) -> Result<(), SyncError> {
        let fields = [
            ("session_id", &self.session_id),
            ("device_id", &self.device_id),
            ("user_id", &self.user_id),
            ("homeserver", &self.homeserver),
            ("access_token", &self.access_token),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(SyncError::new(
                    SyncErrorCategory::Config,
                    "invalid_start_params",
                    format!("start parameter '{field}' is empty"),
                ));
            }
        }
        Ok(())
    }
}
