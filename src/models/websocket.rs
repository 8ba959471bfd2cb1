use serde::{ Serialize, Deserialize };
use serde_json::Value;

use crate::capture::session::EmbedProfile;
use crate::capture::transport::TransportMode;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WidgetStatus {
    Loaded,
    LoadFailed,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "mount")] Mount {
        #[serde(default)]
        profile: Option<EmbedProfile>,
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "widget_message")] WidgetMessage {
        #[serde(default)]
        origin: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename = "widget_status")] WidgetStatus {
        status: WidgetStatus,
    },
    #[serde(rename = "retry_transport")]
    RetryTransport,
    #[serde(rename = "unmount")]
    Unmount,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "mounted")] Mounted {
        session_id: String,
        transport: TransportMode,
    },
    #[serde(rename = "probe")] Probe {
        target_origin: String,
        payload: Value,
    },
    #[serde(rename = "transport")] Transport {
        mode: TransportMode,
    },
    #[serde(rename = "widget_unavailable")] WidgetUnavailable {
        message: String,
    },
    #[serde(rename = "notice")] Notice {
        level: NoticeLevel,
        title: String,
        description: String,
    },
    #[serde(rename = "record_saved")] RecordSaved {
        id: String,
        session_id: String,
        message_count: u64,
        saved_count: u64,
    },
    #[serde(rename = "summary")] Summary {
        summary: Value,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widget_message_accepts_bare_string_data() {
        let json = r#"{"type":"widget_message","origin":"https://labs.heygen.com","data":"hi"}"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::WidgetMessage { origin, data } => {
                assert_eq!(origin, "https://labs.heygen.com");
                assert_eq!(data, Value::String("hi".into()));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn mount_defaults_profile() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"mount"}"#).unwrap();
        match msg {
            ClientMessage::Mount { profile, response_id } => {
                assert!(profile.is_none());
                assert!(response_id.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn status_uses_snake_case() {
        let msg: ClientMessage = serde_json
            ::from_str(r#"{"type":"widget_status","status":"load_failed"}"#)
            .unwrap();
        assert!(matches!(msg, ClientMessage::WidgetStatus { status: WidgetStatus::LoadFailed }));
    }

    #[test]
    fn record_saved_wire_shape() {
        let msg = ServerMessage::RecordSaved {
            id: "42".into(),
            session_id: "session_1_abc".into(),
            message_count: 3,
            saved_count: 2,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"record_saved""#));
        assert!(json.contains(r#""saved_count":2"#));
    }
}
