use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use skiffdb_core::error::{Error, Result};

/// Message profile names of the replication protocol.
pub mod profile {
    pub const GET_CHECKPOINT: &str = "getCheckpoint";
    pub const SET_CHECKPOINT: &str = "setCheckpoint";
    pub const SUB_CHANGES: &str = "subChanges";
    pub const CHANGES: &str = "changes";
    pub const PROPOSE_CHANGES: &str = "proposeChanges";
    pub const REV: &str = "rev";
    pub const NOREV: &str = "norev";
    pub const GET_ATTACHMENT: &str = "getAttachment";
    pub const PROVE_ATTACHMENT: &str = "proveAttachment";
}

/// WebSocket subprotocol negotiation: the replication protocol name plus a
/// version suffix. Both sides must land on a common version; the active
/// side offers newest-first and the passive side picks the highest it
/// knows.
pub mod protocol {
    pub const NAME: &str = "BLIP_3";
    /// Known versions, newest first.
    pub const VERSIONS: [&str; 2] = ["CBMobile_3", "CBMobile_2"];

    pub fn offer() -> String {
        VERSIONS
            .iter()
            .map(|v| format!("{NAME}+{v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Picks the best mutually supported token from a client's offer.
    pub fn select(client_offer: &str) -> Option<String> {
        let offered: Vec<&str> = client_offer.split(',').map(str::trim).collect();
        VERSIONS
            .iter()
            .map(|v| format!("{NAME}+{v}"))
            .find(|candidate| offered.contains(&candidate.as_str()))
    }
}

/// One request in the multiplexed framed protocol: a property dict plus an
/// optional body, correlated to its reply by a per-sender message number
/// that the transport assigns.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub number: u64,
    pub properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub no_reply: bool,
    pub urgent: bool,
    pub compressed: bool,
}

impl Message {
    pub fn new(profile: &str) -> Self {
        let mut m = Message::default();
        m.properties.insert("Profile".into(), profile.into());
        m
    }

    pub fn profile(&self) -> Option<&str> {
        self.property("Profile")
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn int_property(&self, name: &str) -> Option<i64> {
        self.property(name).and_then(|v| v.parse().ok())
    }

    pub fn bool_property(&self, name: &str) -> bool {
        matches!(self.property(name), Some("true") | Some("1"))
    }

    pub fn with_property(mut self, name: &str, value: impl ToString) -> Self {
        self.properties.insert(name.into(), value.to_string());
        self
    }

    /// Sets a property only when `value` is present.
    pub fn with_optional_property(self, name: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.with_property(name, v),
            None => self,
        }
    }

    pub fn with_no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    pub fn with_urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_json_body<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = serde_json::to_vec(value)?;
        Ok(self)
    }

    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A reply to a [`Message`]: either a property/body payload or a relayed
/// error triple.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub error: Option<(String, i32, String)>,
}

impl Response {
    pub fn ok() -> Self {
        Response::default()
    }

    pub fn with_property(mut self, name: &str, value: impl ToString) -> Self {
        self.properties.insert(name.into(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_json_body<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = serde_json::to_vec(value)?;
        Ok(self)
    }

    pub fn error(domain: &str, code: i32, message: impl Into<String>) -> Self {
        Response {
            error: Some((domain.to_string(), code, message.into())),
            ..Default::default()
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let (domain, code, message) = err.to_wire();
        Response {
            error: Some((domain, code, message)),
            ..Default::default()
        }
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The error's code when the domain is HTTP-ish, for 409/404 checks.
    pub fn error_code(&self) -> Option<i32> {
        self.error.as_ref().map(|(_, code, _)| *code)
    }

    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Converts a relayed error into `Error::Remote`.
    pub fn into_result(self) -> Result<Response> {
        match &self.error {
            Some((domain, code, message)) => Err(Error::Remote {
                domain: domain.clone(),
                code: *code,
                message: message.clone(),
            }),
            None => Ok(self),
        }
    }
}

/// An incoming request paired with its one-shot reply handle.
#[derive(Debug)]
pub struct IncomingRequest {
    pub message: Message,
    responder: Option<oneshot::Sender<Response>>,
}

impl IncomingRequest {
    pub fn new(message: Message, responder: Option<oneshot::Sender<Response>>) -> Self {
        IncomingRequest { message, responder }
    }

    /// Sends the reply. Replying to a no-reply message is a no-op.
    pub fn respond(mut self, response: Response) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(response);
        }
    }

    pub fn respond_ok(self) {
        self.respond(Response::ok());
    }

    pub fn respond_error(self, err: &Error) {
        self.respond(Response::from_error(err));
    }
}

/// A connected, framed, bidirectional message channel. Delivery is in send
/// order per sender; `send` applies outbound-window backpressure by
/// suspending when the channel is full.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and resolves with the peer's reply. No-reply
    /// messages resolve immediately with an empty response.
    async fn send(&self, message: Message) -> Result<Response>;

    /// Receives the next incoming request; `None` once the connection is
    /// closed and drained. Single consumer.
    async fn receive(&self) -> Option<IncomingRequest>;

    /// Closes the connection with a WebSocket-style code and reason.
    async fn close(&self, code: u16, reason: &str);

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builders() {
        let m = Message::new(profile::REV)
            .with_property("id", "doc1")
            .with_property("sequence", 7)
            .with_no_reply();
        assert_eq!(m.profile(), Some("rev"));
        assert_eq!(m.property("id"), Some("doc1"));
        assert_eq!(m.int_property("sequence"), Some(7));
        assert!(m.no_reply);
    }

    #[test]
    fn json_bodies_round_trip() {
        let m = Message::new(profile::CHANGES)
            .with_json_body(&serde_json::json!([[1, "doc", "1-aa"]]))
            .unwrap();
        let v: serde_json::Value = m.json_body().unwrap();
        assert_eq!(v[0][1], "doc");
    }

    #[test]
    fn response_errors_become_remote_errors() {
        let r = Response::error("HTTP", 409, "conflict");
        assert!(r.is_error());
        assert_eq!(r.error_code(), Some(409));
        let err = r.into_result().unwrap_err();
        match err {
            Error::Remote { code, .. } => assert_eq!(code, 409),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn protocol_negotiation() {
        let offer = protocol::offer();
        assert_eq!(offer, "BLIP_3+CBMobile_3,BLIP_3+CBMobile_2");
        // Passive side picks the newest common version.
        assert_eq!(
            protocol::select("BLIP_3+CBMobile_2,BLIP_3+CBMobile_3").as_deref(),
            Some("BLIP_3+CBMobile_3")
        );
        assert_eq!(
            protocol::select("BLIP_3+CBMobile_2").as_deref(),
            Some("BLIP_3+CBMobile_2")
        );
        assert_eq!(protocol::select("BLIP_9+Future"), None);
    }
}
