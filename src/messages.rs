//! Wire shapes for the signaling protocol.
//!
//! Every frame is `{type, data, timestamp}`. Legacy clients JSON-encode the
//! `data` field as a string; ingress accepts both the nested-object and the
//! string-encoded form, egress emits nested objects.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::SfuError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Builds an outbound frame with a nested-object `data` payload.
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Self {
        Envelope {
            kind: kind.to_string(),
            data: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Frame with no payload (`ping`/`pong`).
    pub fn bare(kind: &str) -> Self {
        Envelope {
            kind: kind.to_string(),
            data: serde_json::Value::Null,
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, SfuError> {
        serde_json::from_str(raw).map_err(|e| SfuError::Validation(format!("bad frame: {}", e)))
    }

    /// Decodes `data` into a typed payload, accepting either a nested object
    /// or a JSON string that re-parses to one.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, SfuError> {
        let value = match &self.data {
            serde_json::Value::String(inner) => serde_json::from_str(inner)
                .map_err(|e| SfuError::Validation(format!("bad data payload: {}", e)))?,
            other => other.clone(),
        };
        serde_json::from_value(value)
            .map_err(|e| SfuError::Validation(format!("bad data payload: {}", e)))
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Mic/camera/screen enable bits carried on the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaState {
    #[serde(default)]
    pub mic: bool,
    #[serde(default)]
    pub camera: bool,
    #[serde(default)]
    pub screen: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, alias = "sessionToken")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub success: bool,
    pub peer_id: String,
    pub session_id: String,
    pub token: String,
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub media_state: MediaState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub peer_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sdp {
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, alias = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Renegotiate {
    pub reason: String,
    pub track_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllowRenegotiation {
    pub allowed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetBandwidthLimit {
    pub bps: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSwitch {
    pub track_id: String,
    #[serde(alias = "targetRid")]
    pub rid: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerAvailable {
    pub track_id: String,
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DominantSpeaker {
    pub new_peer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityStats {
    pub peer_id: String,
    pub level: String,
    pub packet_loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

impl ErrorMessage {
    pub fn from_error(err: &SfuError) -> Envelope {
        Envelope::new(
            "error",
            &ErrorMessage {
                code: err.code(),
                message: err.to_string(),
            },
        )
    }
}
