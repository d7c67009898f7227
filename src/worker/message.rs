use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// The page -> worker control protocol. Messages arrive as JSON shapes of
/// the form `{"type": "..."}` on the control channel; anything the worker
/// does not recognize is dropped without error so protocol skew between
/// page and worker versions never crashes either side.
#[derive(Debug)]
pub enum ControlMessage {
    SkipWaiting,
    ClearCache,
    GetVersion { reply: oneshot::Sender<VersionReply> },
}

impl ControlMessage {
    pub fn type_str(&self) -> &'static str {
        match self {
            ControlMessage::SkipWaiting => "SKIP_WAITING",
            ControlMessage::ClearCache => "CLEAR_CACHE",
            ControlMessage::GetVersion { .. } => "GET_VERSION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReply {
    pub version: String,
}

/// A wire command without its reply plumbing, as parsed off the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCommand {
    SkipWaiting,
    ClearCache,
    GetVersion,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
    #[serde(rename = "CLEAR_CACHE")]
    ClearCache,
    #[serde(rename = "GET_VERSION")]
    GetVersion,
}

/// Parses a raw control payload. `None` means "ignore silently": malformed
/// JSON, a missing tag, and unknown message types all land there.
pub fn parse_wire(payload: &[u8]) -> Option<WireCommand> {
    match serde_json::from_slice::<WireMessage>(payload) {
        Ok(WireMessage::SkipWaiting) => Some(WireCommand::SkipWaiting),
        Ok(WireMessage::ClearCache) => Some(WireCommand::ClearCache),
        Ok(WireMessage::GetVersion) => Some(WireCommand::GetVersion),
        Err(_) => None,
    }
}
