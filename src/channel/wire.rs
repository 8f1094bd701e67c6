//! JSON envelopes carried as the `data` of a posted message.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handshake {
    Ready,
}

/// `payload` of a request: `{method, origin, params}`.
///
/// `origin` is whatever the sender claims; receivers use the transport's
/// origin instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ResponseEnvelope {
    pub fn success(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: (!result.is_null()).then_some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: WireError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// A missing `result` means `null`.
    pub fn into_result(self) -> Result<serde_json::Value, WireError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Any message a channel understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelMessage {
    Handshake { handshake: Handshake },
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl ChannelMessage {
    pub fn ready() -> Self {
        Self::Handshake {
            handshake: Handshake::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ResponseCode;

    #[test]
    fn parses_each_message_shape() {
        let ready: ChannelMessage = serde_json::from_value(json!({ "handshake": "ready" })).unwrap();
        assert_eq!(ready, ChannelMessage::ready());

        let request: ChannelMessage = serde_json::from_value(json!({
            "id": "1",
            "payload": { "method": "probe", "origin": "https://game.example" }
        }))
        .unwrap();
        assert!(matches!(request, ChannelMessage::Request(ref r) if r.payload.method == "probe"));

        let response: ChannelMessage = serde_json::from_value(json!({
            "id": "1",
            "error": { "code": "CANCELED", "message": "User canceled" }
        }))
        .unwrap();
        let ChannelMessage::Response(response) = response else {
            panic!("expected response");
        };
        assert_eq!(response.into_result().unwrap_err().code, ResponseCode::Canceled);
    }

    #[test]
    fn null_result_round_trips_as_null() {
        let envelope = ResponseEnvelope::success("7", serde_json::Value::Null);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json, json!({ "id": "7" }));
        let parsed: ResponseEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.into_result().unwrap(), serde_json::Value::Null);
    }
}
