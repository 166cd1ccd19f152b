//! Message envelope model: requests, responses and internal queue items.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::BridgeError;
use crate::peer::PeerInfos;

/// Raw local payload that ends the dispatch loop.
pub const STOP_SENTINEL: &str = "$$STOP$$";

/// Response timeout applied to requests that do not carry one, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT: f64 = 5.0;

// ---------------------------------------------------------------------------
// MessageRequest
// ---------------------------------------------------------------------------

/// A command or an event travelling between the local application and the
/// mesh.
///
/// A request is a command when `command` is set, otherwise an event when
/// `event` is set. Command wins when both are present. `peer_infos` is only
/// set for messages coming from or addressed to an external peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRequest {
    pub command: Option<String>,
    pub event: Option<String>,
    pub params: Map<String, Value>,
    /// Recipient module. `None` means broadcast.
    pub to: Option<String>,
    /// Event may be propagated out of the device.
    pub propagate: bool,
    pub sender: Option<String>,
    /// Internal virtual device identifier (events only).
    pub device_id: Option<String>,
    pub peer_infos: Option<PeerInfos>,
    pub command_uuid: Option<String>,
    /// Response timeout in seconds (commands only).
    pub timeout: Option<f64>,
}

impl MessageRequest {
    /// Create a command request.
    pub fn command(name: impl Into<String>, params: Map<String, Value>, to: Option<String>) -> Self {
        Self {
            command: Some(name.into()),
            params,
            to,
            ..Self::default()
        }
    }

    /// Create an event request.
    pub fn event(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            event: Some(name.into()),
            params,
            ..Self::default()
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    pub fn is_command(&self) -> bool {
        self.command.as_deref().is_some_and(|c| !c.is_empty())
    }

    fn is_event(&self) -> bool {
        self.event.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// True when the event comes from an external device.
    pub fn is_external_event(&self) -> bool {
        self.peer_infos.is_some()
    }

    /// Serialize to one of the four wire shapes: internal command, internal
    /// event, external command or external event.
    ///
    /// `external_sender` overrides `sender` for external shapes only.
    pub fn to_dict(&self, startup: bool, external_sender: Option<&str>) -> Result<Value, BridgeError> {
        let external_sender = || {
            external_sender
                .map(str::to_string)
                .or_else(|| self.sender.clone())
        };

        match (&self.peer_infos, self.is_command(), self.is_event()) {
            (None, true, _) => Ok(json!({
                "command": self.command,
                "params": self.params,
                "to": self.to,
                "sender": self.sender,
                "broadcast": self.is_broadcast(),
            })),
            (None, false, true) => Ok(json!({
                "event": self.event,
                "to": self.to,
                "params": self.params,
                "startup": startup,
                "device_id": self.device_id,
                "sender": self.sender,
            })),
            (Some(peer), true, _) => Ok(json!({
                "command": self.command,
                "params": self.params,
                "to": self.to,
                "sender": external_sender(),
                "broadcast": self.is_broadcast(),
                "peer_infos": peer.to_dict()?,
                "command_uuid": self.command_uuid,
                "timeout": self.timeout,
            })),
            (Some(peer), false, true) => Ok(json!({
                "event": self.event,
                "params": self.params,
                "sender": external_sender(),
                "peer_infos": peer.to_dict()?,
                "command_uuid": self.command_uuid,
            })),
            _ => Err(BridgeError::InvalidMessage(
                "request is neither a command nor an event".into(),
            )),
        }
    }

    /// Build a request from any of the wire shapes.
    pub fn from_dict(dict: &Value) -> Result<Self, BridgeError> {
        let mut request = Self::default();
        request.fill_from_dict(dict)?;
        Ok(request)
    }

    /// Overwrite every field from a wire dict.
    pub fn fill_from_dict(&mut self, dict: &Value) -> Result<(), BridgeError> {
        let obj = dict
            .as_object()
            .ok_or_else(|| BridgeError::InvalidMessage("message must be a dict".into()))?;

        let string_field =
            |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        // Routing keys must be strings or null, anything else is malformed
        let routing_field = |key: &str| match obj.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(BridgeError::InvalidMessage(format!(
                "\"{key}\" must be a string, got {other}"
            ))),
        };

        self.command = routing_field("command")?;
        self.event = routing_field("event")?;
        self.propagate = obj
            .get("propagate")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.params = obj
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        self.to = routing_field("to")?;
        self.sender = string_field("sender");
        self.device_id = string_field("device_id");
        self.command_uuid = string_field("command_uuid");
        self.timeout = Some(
            obj.get("timeout")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        );
        self.peer_infos = match obj.get("peer_infos") {
            Some(infos) if !infos.is_null() => Some(PeerInfos::from_dict(infos)?),
            _ => None,
        };

        Ok(())
    }

    /// Fail unless the request is a command or an event.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.is_command() || self.is_event() {
            Ok(())
        } else {
            Err(BridgeError::InvalidMessage(
                "request is neither a command nor an event".into(),
            ))
        }
    }
}

impl fmt::Display for MessageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peer = self
            .peer_infos
            .as_ref()
            .and_then(|p| p.uuid.as_deref())
            .unwrap_or("-");
        if let Some(command) = self.command.as_deref().filter(|c| !c.is_empty()) {
            write!(
                f,
                "MessageRequest(command:{command}, to:{:?}, sender:{:?}, peer:{peer}, command_uuid:{:?})",
                self.to, self.sender, self.command_uuid
            )
        } else if let Some(event) = self.event.as_deref().filter(|e| !e.is_empty()) {
            write!(
                f,
                "MessageRequest(event:{event}, propagate:{}, to:{:?}, device_id:{:?}, peer:{peer})",
                self.propagate, self.to, self.device_id
            )
        } else {
            write!(f, "MessageRequest(invalid)")
        }
    }
}

// ---------------------------------------------------------------------------
// MessageResponse
// ---------------------------------------------------------------------------

/// Result of a command, or a message received from a peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
    /// The response originates from a broadcast.
    #[serde(default)]
    pub broadcast: bool,
}

impl MessageResponse {
    pub fn to_dict(&self) -> Value {
        json!({
            "error": self.error,
            "message": self.message,
            "data": self.data,
            "broadcast": self.broadcast,
        })
    }

    /// Overwrite every field from a dict; missing keys take defaults.
    pub fn fill_from_dict(&mut self, dict: &Value) -> Result<(), BridgeError> {
        if !dict.is_object() {
            return Err(BridgeError::InvalidMessage("response must be a dict".into()));
        }
        *self = serde_json::from_value(dict.clone())?;
        Ok(())
    }

    pub fn from_dict(dict: &Value) -> Result<Self, BridgeError> {
        let mut response = Self::default();
        response.fill_from_dict(dict)?;
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// InternalMessage
// ---------------------------------------------------------------------------

/// Direction of an [`InternalMessage`] relative to the local application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ToLocal,
    FromLocal,
}

/// Kind of a typed [`InternalMessageContent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    PeerConnected,
    PeerDisconnected,
    MessageResponse,
}

impl ContentType {
    fn from_value(value: &Value) -> Result<Self, BridgeError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Peer lifecycle or message notification for the local application.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalMessageContent {
    pub content_type: ContentType,
    /// Absent for a disconnect of a peer that never registered.
    pub peer_infos: Option<PeerInfos>,
    pub data: Option<MessageResponse>,
}

impl InternalMessageContent {
    pub fn new(
        content_type: ContentType,
        peer_infos: Option<PeerInfos>,
        data: Option<MessageResponse>,
    ) -> Self {
        Self {
            content_type,
            peer_infos,
            data,
        }
    }

    pub fn to_dict(&self) -> Result<Value, BridgeError> {
        let mut out = Map::new();
        out.insert("content_type".into(), serde_json::to_value(self.content_type)?);
        let peer_infos = match &self.peer_infos {
            Some(infos) => infos.to_dict()?,
            None => Value::Null,
        };
        out.insert("peer_infos".into(), peer_infos);
        if let Some(data) = &self.data {
            out.insert("data".into(), data.to_dict());
        }
        Ok(Value::Object(out))
    }

    pub fn from_dict(dict: &Value) -> Result<Self, BridgeError> {
        let obj = dict
            .as_object()
            .ok_or_else(|| BridgeError::InvalidMessage("content must be a dict".into()))?;
        let content_type = obj
            .get("content_type")
            .ok_or_else(|| BridgeError::InvalidMessage("content_type is missing".into()))
            .and_then(ContentType::from_value)?;
        let peer_infos = match obj.get("peer_infos") {
            Some(infos) if !infos.is_null() => Some(PeerInfos::from_dict(infos)?),
            _ => None,
        };
        let data = match obj.get("data") {
            Some(data) if !data.is_null() => Some(MessageResponse::from_dict(data)?),
            _ => None,
        };
        Ok(Self::new(content_type, peer_infos, data))
    }
}

/// Payload of an [`InternalMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Opaque payload read from the local channel.
    Raw(String),
    Typed(InternalMessageContent),
}

/// Unit carried by the internal queue.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalMessage {
    pub message_type: MessageType,
    pub content: Content,
}

impl InternalMessage {
    /// Raw payload received from the local application.
    pub fn from_local(raw: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::FromLocal,
            content: Content::Raw(raw.into()),
        }
    }

    /// Typed notification addressed to the local application.
    pub fn to_local(content: InternalMessageContent) -> Self {
        Self {
            message_type: MessageType::ToLocal,
            content: Content::Typed(content),
        }
    }

    /// True for the raw local payload that ends the dispatch loop.
    pub fn is_stop(&self) -> bool {
        self.message_type == MessageType::FromLocal
            && matches!(&self.content, Content::Raw(raw) if raw == STOP_SENTINEL)
    }

    pub fn to_dict(&self) -> Result<Value, BridgeError> {
        let content = match &self.content {
            Content::Raw(raw) => Value::String(raw.clone()),
            Content::Typed(typed) => typed.to_dict()?,
        };
        Ok(json!({
            "message_type": serde_json::to_value(self.message_type)?,
            "content": content,
        }))
    }

    pub fn from_dict(dict: &Value) -> Result<Self, BridgeError> {
        let obj = dict
            .as_object()
            .ok_or_else(|| BridgeError::InvalidMessage("internal message must be a dict".into()))?;
        let message_type: MessageType = serde_json::from_value(
            obj.get("message_type").cloned().unwrap_or(Value::Null),
        )?;
        let content = match obj.get("content") {
            Some(Value::String(raw)) => Content::Raw(raw.clone()),
            Some(typed) => Content::Typed(InternalMessageContent::from_dict(typed)?),
            None => return Err(BridgeError::InvalidMessage("content is missing".into())),
        };
        Ok(Self {
            message_type,
            content,
        })
    }

    /// Serialize the full envelope to a JSON string for the local channel.
    pub fn to_json(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(&self.to_dict()?)?)
    }
}

impl fmt::Display for InternalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.content {
            Content::Raw(raw) => write!(f, "InternalMessage({:?}, raw:{raw})", self.message_type),
            Content::Typed(typed) => write!(
                f,
                "InternalMessage({:?}, {:?}, peer:{})",
                self.message_type,
                typed.content_type,
                typed
                    .peer_infos
                    .as_ref()
                    .and_then(|p| p.uuid.as_deref())
                    .unwrap_or("-")
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(value: &Value) -> Vec<&str> {
        let mut keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        keys
    }

    fn external_peer() -> PeerInfos {
        PeerInfos {
            uuid: Some("peer-uuid".into()),
            ident: Some("peer-ident".into()),
            hostname: Some("kitchen".into()),
            ..PeerInfos::default()
        }
    }

    fn params() -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("volume".into(), json!(42));
        params
    }

    #[test]
    fn test_internal_command_shape() {
        let mut request = MessageRequest::command("set_volume", params(), Some("audio".into()));
        request.sender = Some("desktop".into());

        let dict = request.to_dict(false, None).unwrap();
        assert_eq!(keys(&dict), vec!["broadcast", "command", "params", "sender", "to"]);
        assert_eq!(dict["broadcast"], json!(false));
        assert_eq!(dict["params"]["volume"], json!(42));
    }

    #[test]
    fn test_internal_event_shape() {
        let mut request = MessageRequest::event("system.device.online", params());
        request.device_id = Some("dev-1".into());
        request.propagate = true;

        let dict = request.to_dict(true, Some("ignored")).unwrap();
        assert_eq!(
            keys(&dict),
            vec!["device_id", "event", "params", "sender", "startup", "to"]
        );
        assert_eq!(dict["startup"], json!(true));
        assert_eq!(dict["sender"], Value::Null);
    }

    #[test]
    fn test_external_command_shape() {
        let mut request = MessageRequest::command("get_state", Map::new(), None);
        request.sender = Some("desktop".into());
        request.peer_infos = Some(external_peer());
        request.command_uuid = Some("cmd-1".into());
        request.timeout = Some(3.0);

        let dict = request.to_dict(false, Some("bus")).unwrap();
        assert_eq!(
            keys(&dict),
            vec![
                "broadcast",
                "command",
                "command_uuid",
                "params",
                "peer_infos",
                "sender",
                "timeout",
                "to"
            ]
        );
        assert_eq!(dict["sender"], json!("bus"));
        assert_eq!(dict["broadcast"], json!(true));
        assert_eq!(dict["peer_infos"]["uuid"], json!("peer-uuid"));
    }

    #[test]
    fn test_external_event_shape() {
        let mut request = MessageRequest::event("sensor.temperature", params());
        request.sender = Some("sensors".into());
        request.device_id = Some("dev-1".into());
        request.peer_infos = Some(external_peer());

        let dict = request.to_dict(true, None).unwrap();
        assert_eq!(
            keys(&dict),
            vec!["command_uuid", "event", "params", "peer_infos", "sender"]
        );
        assert_eq!(dict["sender"], json!("sensors"));
    }

    #[test]
    fn test_command_wins_over_event() {
        let mut request = MessageRequest::command("ping", Map::new(), None);
        request.event = Some("pong".into());

        let dict = request.to_dict(false, None).unwrap();
        assert!(dict.get("command").is_some());
        assert!(dict.get("event").is_none());
    }

    #[test]
    fn test_invalid_request_rejected() {
        let request = MessageRequest::default();
        assert!(matches!(
            request.to_dict(false, None),
            Err(BridgeError::InvalidMessage(_))
        ));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_request_from_dict_defaults() {
        let request = MessageRequest::from_dict(&json!({
            "command": "reboot",
            "to": "system",
        }))
        .unwrap();

        assert!(request.is_command());
        assert!(!request.is_broadcast());
        assert!(!request.is_external_event());
        assert_eq!(request.timeout, Some(DEFAULT_REQUEST_TIMEOUT));
        assert!(request.params.is_empty());
        assert!(request.peer_infos.is_none());
    }

    #[test]
    fn test_request_external_roundtrip() {
        let mut request = MessageRequest::command("get_state", params(), Some("audio".into()));
        request.sender = Some("desktop".into());
        request.peer_infos = Some(external_peer());
        request.command_uuid = Some("cmd-1".into());
        request.timeout = Some(2.5);

        let restored = MessageRequest::from_dict(&request.to_dict(false, None).unwrap()).unwrap();
        assert_eq!(restored, request);
    }

    #[test]
    fn test_request_from_non_dict_fails() {
        assert!(matches!(
            MessageRequest::from_dict(&json!("command")),
            Err(BridgeError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_request_non_string_routing_keys_rejected() {
        for dict in [
            json!({"command": "open", "to": 5}),
            json!({"command": "open", "to": {}}),
            json!({"command": ["open"], "to": "door"}),
            json!({"event": true}),
        ] {
            assert!(
                matches!(
                    MessageRequest::from_dict(&dict),
                    Err(BridgeError::InvalidMessage(_))
                ),
                "accepted {dict}"
            );
        }

        let broadcast = MessageRequest::from_dict(&json!({"command": "open", "to": null})).unwrap();
        assert!(broadcast.is_broadcast());
    }

    #[test]
    fn test_request_propagate_read_but_not_emitted() {
        let request =
            MessageRequest::from_dict(&json!({"event": "door.opened", "propagate": true})).unwrap();
        assert!(request.propagate);

        let dict = request.to_dict(false, None).unwrap();
        assert!(dict.get("propagate").is_none());
    }

    #[test]
    fn test_response_roundtrip_and_defaults() {
        let response = MessageResponse {
            error: true,
            message: "device busy".into(),
            data: json!({"retry": 3}),
            broadcast: true,
        };
        let restored = MessageResponse::from_dict(&response.to_dict()).unwrap();
        assert_eq!(restored, response);

        let sparse = MessageResponse::from_dict(&json!({})).unwrap();
        assert_eq!(sparse, MessageResponse::default());
        assert!(MessageResponse::from_dict(&json!([1])).is_err());
    }

    #[test]
    fn test_internal_message_wire_format() {
        let content = InternalMessageContent::new(
            ContentType::PeerConnected,
            Some(external_peer()),
            None,
        );
        let dict = InternalMessage::to_local(content).to_dict().unwrap();

        assert_eq!(dict["message_type"], json!("TO_LOCAL"));
        assert_eq!(dict["content"]["content_type"], json!("PEER_CONNECTED"));
        assert_eq!(dict["content"]["peer_infos"]["hostname"], json!("kitchen"));
        assert!(dict["content"].get("data").is_none());

        let raw = InternalMessage::from_local("{\"command\":\"x\"}").to_dict().unwrap();
        assert_eq!(raw["message_type"], json!("FROM_LOCAL"));
        assert_eq!(raw["content"], json!("{\"command\":\"x\"}"));
    }

    #[test]
    fn test_internal_message_roundtrip() {
        let content = InternalMessageContent::new(
            ContentType::MessageResponse,
            Some(external_peer()),
            Some(MessageResponse {
                message: "ok".into(),
                ..MessageResponse::default()
            }),
        );
        let message = InternalMessage::to_local(content);
        let restored = InternalMessage::from_dict(&message.to_dict().unwrap()).unwrap();
        assert_eq!(restored, message);

        let disconnected = InternalMessage::to_local(InternalMessageContent::new(
            ContentType::PeerDisconnected,
            None,
            None,
        ));
        let dict = disconnected.to_dict().unwrap();
        assert_eq!(dict["content"]["peer_infos"], Value::Null);
        assert_eq!(InternalMessage::from_dict(&dict).unwrap(), disconnected);
    }

    #[test]
    fn test_stop_sentinel() {
        assert!(InternalMessage::from_local(STOP_SENTINEL).is_stop());
        assert!(!InternalMessage::from_local("$$STOP").is_stop());
    }
}
