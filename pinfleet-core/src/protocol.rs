//! Provider coordination wire protocol. Every message on the link is a
//! JSON object of the form `{ "type": <string>, "data": <object> }`.

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};

/// WebSocket close code sent when a link violates protocol or presents an
/// invalid credential.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    #[serde(default)]
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacityPayload {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterPayload {
    pub provider_id: String,
    /// Identity of the provider's storage node in the content network.
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<CapacityPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WelcomePayload {
    pub provider_id: String,
    /// Heartbeat cadence the backend expects from this link.
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageJobPayload {
    pub contract_id: String,
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PinRequestPayload {
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PinAckPayload {
    pub cid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PinFailedPayload {
    pub cid: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractAckPayload {
    pub contract_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractFailedPayload {
    pub contract_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CapacityRequestPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentReceivedPayload {
    pub contract_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GoingOfflinePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WireMessage {
    Register(RegisterPayload),
    Welcome(WelcomePayload),
    Ping(Heartbeat),
    Pong(Heartbeat),
    StorageJob(StorageJobPayload),
    PinRequest(PinRequestPayload),
    PinConfirmed(PinAckPayload),
    PinFailed(PinFailedPayload),
    UnpinRequest(PinRequestPayload),
    UnpinConfirmed(PinAckPayload),
    ContractAccepted(ContractAckPayload),
    ContractFailed(ContractFailedPayload),
    CapacityUpdate(CapacityPayload),
    CapacityRequest(CapacityRequestPayload),
    PaymentReceived(PaymentReceivedPayload),
    GoingOffline(GoingOfflinePayload),
}

impl WireMessage {
    /// Parse one wire frame. Malformed frames are a protocol violation:
    /// the link carrying them gets closed, not ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|error| FleetError::Protocol(format!("malformed message: {}", error)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_type_plus_data() {
        let message = WireMessage::PinRequest(PinRequestPayload {
            cid: "bafy-1".to_string(),
            replicas: Some(3),
        });

        let value: serde_json::Value =
            serde_json::from_str(&message.to_json().unwrap()).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), 2);
        assert_eq!(object["type"], "pin_request");
        assert_eq!(object["data"]["cid"], "bafy-1");
        assert_eq!(object["data"]["replicas"], 3);
    }

    #[test]
    fn test_type_names_are_snake_case() {
        let cases = vec![
            (
                WireMessage::Register(RegisterPayload {
                    provider_id: "p-1".to_string(),
                    node_id: "n-1".to_string(),
                    capacity: None,
                }),
                "register",
            ),
            (WireMessage::Ping(Heartbeat { seq: 1 }), "ping"),
            (WireMessage::Pong(Heartbeat { seq: 1 }), "pong"),
            (
                WireMessage::PinConfirmed(PinAckPayload {
                    cid: "bafy-1".to_string(),
                }),
                "pin_confirmed",
            ),
            (
                WireMessage::CapacityUpdate(CapacityPayload {
                    used_bytes: 1,
                    total_bytes: 2,
                }),
                "capacity_update",
            ),
            (
                WireMessage::GoingOffline(GoingOfflinePayload::default()),
                "going_offline",
            ),
        ];

        for (message, expected) in cases {
            let value: serde_json::Value =
                serde_json::from_str(&message.to_json().unwrap()).unwrap();
            assert_eq!(value["type"], expected);
        }
    }

    #[test]
    fn test_parse_round_trip() {
        let raw = r#"{"type":"storage_job","data":{"contract_id":"c-1","cid":"bafy-9","size_bytes":1024}}"#;
        let message = WireMessage::parse(raw).unwrap();

        assert_eq!(
            message,
            WireMessage::StorageJob(StorageJobPayload {
                contract_id: "c-1".to_string(),
                cid: "bafy-9".to_string(),
                size_bytes: Some(1024),
            })
        );
    }

    #[test]
    fn test_malformed_message_is_protocol_error() {
        assert!(matches!(
            WireMessage::parse("{\"kind\":\"nope\"}"),
            Err(FleetError::Protocol(_))
        ));
        assert!(matches!(
            WireMessage::parse("not json"),
            Err(FleetError::Protocol(_))
        ));
    }
}
