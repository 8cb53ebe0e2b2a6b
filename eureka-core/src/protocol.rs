//! Wire messages for registration and interest sessions, framed as newline-delimited JSON.

use serde::{Deserialize, Serialize};

use crate::instance::InstanceInfo;
use crate::interest::Interest;
use crate::notification::ChangeNotification;
use crate::DiscoveryError;

/// Client to server. Registration sessions use Register/Update/Unregister; interest sessions use Subscribe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ClientMessage {
    Register(InstanceInfo),
    /// Full replacement of the registered record, not a delta.
    Update(InstanceInfo),
    Unregister,
    Subscribe(Interest),
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Register(_) => "register",
            ClientMessage::Update(_) => "update",
            ClientMessage::Unregister => "unregister",
            ClientMessage::Subscribe(_) => "subscribe",
        }
    }
}

/// Server to client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack,
    Notification(ChangeNotification<InstanceInfo>),
    Error { message: String },
}

/// One JSON object followed by '\n'.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, DiscoveryError> {
    let mut out = serde_json::to_vec(msg)?;
    out.push(b'\n');
    Ok(out)
}

/// Decode one line (trailing "\r\n" or "\n" tolerated). Blank lines are a codec error.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &[u8]) -> Result<T, DiscoveryError> {
    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(DiscoveryError::Codec("empty frame".into()));
    }
    serde_json::from_slice(trimmed).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Status;
    use crate::interest::Interests;

    #[test]
    fn lines_are_newline_terminated_json() {
        let info = InstanceInfo::builder().id("i1").app("A").status(Status::Up).build().unwrap();
        let bytes = encode_line(&ClientMessage::Register(info.clone())).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        let back: ClientMessage = decode_line(&bytes).unwrap();
        assert_eq!(back, ClientMessage::Register(info));
    }

    #[test]
    fn wire_shape_is_tagged() {
        let value = serde_json::to_value(ClientMessage::Subscribe(Interests::for_vips(["v"]))).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "subscribe", "body": {"type": "vip", "vip": "v"}})
        );
        let value = serde_json::to_value(ServerMessage::Notification(ChangeNotification::BufferSentinel)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "notification", "body": {"kind": "buffer_sentinel"}})
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode_line::<ServerMessage>(b"\n"), Err(DiscoveryError::Codec(_))));
        assert!(matches!(decode_line::<ServerMessage>(b"{nope}\r\n"), Err(DiscoveryError::Codec(_))));
        let ack: ServerMessage = decode_line(b"{\"type\":\"ack\"}\r\n").unwrap();
        assert_eq!(ack, ServerMessage::Ack);
    }
}
