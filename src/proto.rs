//! Wire protocol.
//!
//! Every datagram carries exactly one JSON object with a `type` tag, e.g.
//!
//! ```json
//! {"type":"connect_request","from_peer":"aaaa1111","to_peer":"bbbb2222"}
//! ```
//!
//! Relay payloads (`relay_data`) use the same encoding, but the relay itself
//! never decodes them: it forwards the raw bytes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Hard ceiling for a single control message, in bytes.
///
/// Receive buffers are this large; `encode` refuses anything bigger instead
/// of letting the receiver truncate it.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Error text for requests from a peer the server does not know (any more).
/// An agent that gets it without a session id registers again.
pub const ERR_NOT_REGISTERED: &str = "Peer not registered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
}

/// Control action carried by a `relay_data` datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayAction {
    /// Opens the NAT pinhole towards the relay, carries no data.
    Init,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Register {
        peer_id: String,
        #[serde(default, alias = "is_relay_capable")]
        is_relay: bool,
    },
    RegisterResponse {
        status: Status,
    },
    Keepalive {
        peer_id: String,
    },
    Bye {
        peer_id: String,
    },
    ConnectRequest {
        from_peer: String,
        to_peer: String,
    },
    IncomingConnection {
        from_peer: String,
        /// Lets the acceptor tell errors about this handshake from errors
        /// about its own requests.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    AcceptConnection {
        from_peer: String,
    },
    RelaySetup {
        session_id: String,
        peer_a: String,
        peer_b: String,
    },
    RelayReady {
        session_id: String,
        ports: HashMap<String, u16>,
    },
    RelayInfo {
        session_id: String,
        relay_addr: IpAddr,
        port: u16,
        remote_peer: String,
    },
    RelayData {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<RelayAction>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    SessionClose {
        session_id: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl Message {
    pub fn error<S: Into<String>>(message: S) -> Self {
        Message::Error {
            message: message.into(),
            session_id: None,
        }
    }

    pub fn session_error<S: Into<String>>(message: S, session_id: &str) -> Self {
        Message::Error {
            message: message.into(),
            session_id: Some(session_id.to_string()),
        }
    }

    pub fn relay_init(session_id: &str) -> Self {
        Message::RelayData {
            session_id: session_id.to_string(),
            action: Some(RelayAction::Init),
            data: None,
        }
    }

    pub fn relay_text<S: Into<String>>(session_id: &str, data: S) -> Self {
        Message::RelayData {
            session_id: session_id.to_string(),
            action: None,
            data: Some(data.into()),
        }
    }

    /// The `type` tag as it appears on the wire, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::RegisterResponse { .. } => "register_response",
            Message::Keepalive { .. } => "keepalive",
            Message::Bye { .. } => "bye",
            Message::ConnectRequest { .. } => "connect_request",
            Message::IncomingConnection { .. } => "incoming_connection",
            Message::AcceptConnection { .. } => "accept_connection",
            Message::RelaySetup { .. } => "relay_setup",
            Message::RelayReady { .. } => "relay_ready",
            Message::RelayInfo { .. } => "relay_info",
            Message::RelayData { .. } => "relay_data",
            Message::SessionClose { .. } => "session_close",
            Message::Error { .. } => "error",
        }
    }
}

pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let buf = serde_json::to_vec(msg)?;
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(Error::Oversized(buf.len()));
    }
    Ok(buf)
}

pub fn decode(buf: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(buf)?)
}

/// Random v4 uuid in its hyphenated form.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short random peer identity, 8 hex chars.
pub fn new_peer_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tags() {
        let msg = Message::ConnectRequest {
            from_peer: "aaaa1111".into(),
            to_peer: "bbbb2222".into(),
        };
        let v: serde_json::Value = serde_json::from_slice(&encode(&msg).unwrap()).unwrap();
        assert_eq!(v["type"], "connect_request");
        assert_eq!(v["from_peer"], "aaaa1111");
        assert_eq!(v["to_peer"], "bbbb2222");

        let v: serde_json::Value =
            serde_json::from_slice(&encode(&Message::relay_init("s1")).unwrap()).unwrap();
        assert_eq!(v["type"], "relay_data");
        assert_eq!(v["action"], "init");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn test_register_defaults() {
        let msg = decode(br#"{"type":"register","peer_id":"p1"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Register {
                peer_id: "p1".into(),
                is_relay: false
            }
        );

        let msg = decode(br#"{"type":"register","peer_id":"p1","is_relay_capable":true}"#).unwrap();
        assert_eq!(
            msg,
            Message::Register {
                peer_id: "p1".into(),
                is_relay: true
            }
        );
    }

    #[test]
    fn test_reject_bad_input() {
        assert!(decode(br#"{"type":"teleport","peer_id":"p1"}"#).is_err());
        assert!(decode(br#"{"type":"connect_request","from_peer":"a"}"#).is_err());
        assert!(decode(br#"{"peer_id":"p1"}"#).is_err());
        assert!(decode(b"\xff\xfe").is_err());
    }

    #[test]
    fn test_relay_ready_ports() {
        let msg = decode(
            br#"{"type":"relay_ready","session_id":"s","ports":{"aaaa1111":41001,"bbbb2222":41002}}"#,
        )
        .unwrap();
        match msg {
            Message::RelayReady { ports, .. } => {
                assert_eq!(ports["aaaa1111"], 41001);
                assert_eq!(ports["bbbb2222"], 41002);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_incoming_connection_session_id() {
        let msg = decode(br#"{"type":"incoming_connection","from_peer":"a"}"#).unwrap();
        assert_eq!(
            msg,
            Message::IncomingConnection {
                from_peer: "a".into(),
                session_id: None
            }
        );

        let msg = Message::IncomingConnection {
            from_peer: "a".into(),
            session_id: Some("s1".into()),
        };
        let v: serde_json::Value = serde_json::from_slice(&encode(&msg).unwrap()).unwrap();
        assert_eq!(v["session_id"], "s1");
    }

    #[test]
    fn test_oversized() {
        let msg = Message::relay_text("s", "x".repeat(MAX_DATAGRAM_SIZE));
        assert!(matches!(encode(&msg), Err(Error::Oversized(_))));
    }

    #[test]
    fn test_ids() {
        let id = new_session_id();
        assert_eq!(id.len(), 36);
        assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);
        assert_ne!(id, new_session_id());
        assert_eq!(new_peer_id().len(), 8);
    }
}
