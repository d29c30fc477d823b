//! Wire envelopes
//!
//! Every message is a JSON object with a `type` discriminator. Decoding goes
//! through [`Decoded`] so that well-formed messages of a type this controller
//! does not know about can be reported instead of failing the parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::types::{AtomRecord, ForceDelta, GridDescriptor, GridNode};

/// Errors raised while encoding or decoding an envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Envelope is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Envelope is not a JSON object with a string 'type' field")]
    MissingType,

    #[error("Invalid '{kind}' envelope: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A typed protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Peer announces itself
    Register,

    /// Controller acknowledges a registration
    Ack,

    /// Peer leaves
    Deregister,

    /// Controller is still working; peers skip these while awaiting a reply
    Waiting,

    /// Batch of atoms needing force corrections
    Request {
        atoms: Vec<AtomRecord>,
        #[serde(rename = "expectResponse", default, skip_serializing_if = "Option::is_none")]
        expect_response: Option<f64>,
    },

    /// Reply to either request kind
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        atoms: Option<Vec<ForceDelta>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nodes: Option<Vec<GridNode>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        every: Option<u64>,
    },

    /// Sample a whole lattice in one round trip
    GridRequest(GridDescriptor),
}

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Known(Envelope),
    Unknown { kind: String },
}

impl Envelope {
    /// Every `type` value this protocol defines
    pub const KINDS: [&'static str; 7] = [
        "register",
        "ack",
        "deregister",
        "waiting",
        "request",
        "response",
        "gridRequest",
    ];

    pub fn request(atoms: Vec<AtomRecord>) -> Self {
        Envelope::Request {
            atoms,
            expect_response: None,
        }
    }

    pub fn atom_response(atoms: Vec<ForceDelta>) -> Self {
        Envelope::Response {
            atoms: Some(atoms),
            nodes: None,
            every: None,
        }
    }

    pub fn grid_response(nodes: Vec<GridNode>) -> Self {
        Envelope::Response {
            atoms: None,
            nodes: Some(nodes),
            every: None,
        }
    }

    /// The wire `type` string
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register => "register",
            Envelope::Ack => "ack",
            Envelope::Deregister => "deregister",
            Envelope::Waiting => "waiting",
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
            Envelope::GridRequest(_) => "gridRequest",
        }
    }

    /// Serialize to a single line of JSON (no trailing newline)
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Parse a frame, separating unknown types from malformed input
    pub fn decode(bytes: &[u8]) -> Result<Decoded, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?
            .to_string();

        if !Self::KINDS.contains(&kind.as_str()) {
            return Ok(Decoded::Unknown { kind });
        }

        serde_json::from_value(value)
            .map(Decoded::Known)
            .map_err(|source| EnvelopeError::Invalid { kind, source })
    }
}
