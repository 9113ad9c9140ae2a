//! Wire protocol: the JSON message envelope and the message types of
//! spec.md §6.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lsn::Lsn;
use crate::model::Change;

/// Position of one chunk within a catch-up replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub chunk: u32,
    pub total: u32,
}

/// Server-to-client messages (`srv_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "srv_catchup_changes")]
    CatchupChanges {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        changes: Vec<Change>,
        sequence: Sequence,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },
    #[serde(rename = "srv_catchup_completed")]
    CatchupCompleted {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },
    #[serde(rename = "srv_live_changes")]
    LiveChanges {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId")]
        message_id: String,
        timestamp: DateTime<Utc>,
        changes: Vec<Change>,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },
    #[serde(rename = "srv_error")]
    Error {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        code: String,
        message: String,
    },
    #[serde(rename = "srv_submit_ack")]
    SubmitAck {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        #[serde(rename = "batchId")]
        batch_id: String,
        #[serde(rename = "resultingLSN")]
        resulting_lsn: Lsn,
    },
    #[serde(rename = "srv_submit_nack")]
    SubmitNack {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        #[serde(rename = "batchId")]
        batch_id: String,
        reason: String,
        #[serde(default)]
        rejected: Vec<RejectedRow>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRow {
    pub id: String,
    pub reason: String,
}

/// Client-to-server messages (`clt_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "clt_catchup_request")]
    CatchupRequest {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        #[serde(rename = "fromLSN", skip_serializing_if = "Option::is_none")]
        from_lsn: Option<Lsn>,
    },
    #[serde(rename = "clt_catchup_received")]
    CatchupReceived {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        chunk: u32,
        lsn: Lsn,
    },
    #[serde(rename = "clt_changes_received")]
    ChangesReceived {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        #[serde(rename = "changeIds", default)]
        change_ids: Vec<String>,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },
    #[serde(rename = "clt_submit")]
    Submit {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
        #[serde(rename = "batchId")]
        batch_id: String,
        changes: Vec<Change>,
    },
    #[serde(rename = "clt_heartbeat")]
    Heartbeat {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "clt_disconnect")]
    Disconnect {
        #[serde(rename = "clientId")]
        client_id: Uuid,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// WebSocket close codes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal = 1000,
    AuthFailed = 4001,
    ProtocolError = 4002,
    SlowConsumer = 4003,
    Superseded = 4004,
    HeartbeatLost = 4005,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseCode::Normal => "normal",
            CloseCode::AuthFailed => "AuthFailed",
            CloseCode::ProtocolError => "ProtocolError",
            CloseCode::SlowConsumer => "SlowConsumer",
            CloseCode::Superseded => "Superseded",
            CloseCode::HeartbeatLost => "HeartbeatLost",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_submit_round_trips_through_json() {
        let msg = ClientMessage::Submit {
            client_id: Uuid::nil(),
            message_id: Some("m1".into()),
            timestamp: Utc::now(),
            batch_id: "b1".into(),
            changes: vec![],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"clt_submit\""));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        matches!(parsed, ClientMessage::Submit { .. });
    }

    #[test]
    fn server_catchup_changes_round_trips() {
        let msg = ServerMessage::CatchupChanges {
            client_id: Uuid::nil(),
            message_id: None,
            timestamp: Utc::now(),
            changes: vec![],
            sequence: Sequence { chunk: 1, total: 3 },
            last_lsn: Lsn::parse("0/A").unwrap(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let _: ServerMessage = serde_json::from_str(&json).unwrap();
    }
}
