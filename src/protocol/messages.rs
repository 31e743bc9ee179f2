use serde::{Deserialize, Serialize};

/// Messages carried as JSON text frames on the bridge `ctrl` channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CtrlMessage {
    /// Client -> relay: dial this connection string
    Connect {
        #[serde(rename = "connStr")]
        conn_str: String,
    },
    /// Relay -> client: the remote tunnel is up
    Connected,
}

impl CtrlMessage {
    pub fn connect(conn_str: &str) -> Self {
        CtrlMessage::Connect {
            conn_str: conn_str.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_wire_format() {
        let msg = CtrlMessage::connect("ws://127.0.0.1:7800/tunnel?target=127.0.0.1%3A22");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "connect",
                "data": { "connStr": "ws://127.0.0.1:7800/tunnel?target=127.0.0.1%3A22" }
            })
        );
    }

    #[test]
    fn test_connected_wire_format() {
        assert_eq!(CtrlMessage::Connected.to_json().unwrap(), r#"{"type":"connected"}"#);
        assert_eq!(
            CtrlMessage::from_json(r#"{"type":"connected"}"#).unwrap(),
            CtrlMessage::Connected
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(CtrlMessage::from_json(r#"{"type":"disconnect"}"#).is_err());
        assert!(CtrlMessage::from_json("not json").is_err());
    }
}
