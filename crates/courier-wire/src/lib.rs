// Routing header parsed from inbound bus messages.
//
// Only the four known fields are inspected; producers are free to attach
// more. The broker therefore forwards the original payload bytes everywhere
// and this type never serializes back to JSON.
use serde::Deserialize;

/// Envelope type routed to the per-environment provisioner queue.
pub const UPDATE_ENVIRONMENT: &str = "updateenvironment";
/// Envelope type fanned out to registered proxy destination lists.
pub const PROXY_MESSAGE: &str = "proxymessage";

/// Routing summary of one bus message.
///
/// ```
/// use courier_wire::BusMessage;
///
/// let raw = br#"{"repo_name":"env321","branch_name":"main","message_type":"proxymessage","proxy_name":"web"}"#;
/// let message = BusMessage::parse(raw).expect("parse");
/// assert_eq!(message.environment_id(), "env321/main");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BusMessage {
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub proxy_name: String,
}

impl BusMessage {
    pub fn parse(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    pub fn environment_id(&self) -> String {
        courier_keys::environment_id(&self.repo_name, &self.branch_name)
    }

    /// Both routing fields the dispatcher requires before it will touch a
    /// derived key. Envelopes failing this go to the dead-letter queue.
    pub fn has_required_fields(&self) -> bool {
        !self.repo_name.is_empty() && !self.branch_name.is_empty()
    }
}
