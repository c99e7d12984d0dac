use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// State needed to continue a connection from another process
///
/// Encoded as JSON and handed to the application by `Connection::recovery_key`; accepted back
/// through `ClientConfig::recover`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryKey {
    pub connection_key: String,
    /// Next serial to assign on the recovered connection
    pub msg_serial: u64,
    /// Channel name to last known channel serial
    #[serde(default)]
    pub channel_serials: BTreeMap<String, String>,
}

impl RecoveryKey {
    /// Serialize to the textual form
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and integers into a String cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse the textual form, `None` if malformed
    pub fn decode(key: &str) -> Option<Self> {
        let key = serde_json::from_str::<Self>(key).ok()?;
        (!key.connection_key.is_empty()).then_some(key)
    }
}
