//! Command protocol spoken over each WebSocket connection.
//!
//! Every message carries exactly one JSON object and is answered with
//! exactly one JSON object:
//!
//! ```text
//! Request:  {"command": "GET_LOCATION"}
//! Response: {"location": {"lat": 29.36342, "lon": 30.99788}}
//!
//! Request:  {"command": "PING"}
//! Response: {"response": "Python received: PING"}
//!
//! Request:  {}
//! Response: {"response": "Python received: unknown"}
//! ```
//!
//! Fields other than `command` are ignored. A `command` that is missing or
//! `null` is treated as the literal `unknown`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Command that answers with the fixed location.
pub const LOCATION_COMMAND: &str = "GET_LOCATION";

/// Command name used when a request carries none.
pub const DEFAULT_COMMAND: &str = "unknown";

/// Static test location (near Cairo, Egypt).
pub const FIXED_LOCATION: Coordinates = Coordinates {
    lat: 29.36342,
    lon: 30.99788,
};

/// Decoding errors for incoming messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is not a JSON object with a usable `command` field.
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: String },
}

impl ProtocolError {
    fn malformed(reason: impl ToString) -> Self {
        ProtocolError::MalformedRequest {
            reason: reason.to_string(),
        }
    }
}

/// Wire shape of a request.
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    command: Option<String>,
}

/// Parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report the fixed location.
    GetLocation,
    /// Anything else, echoed back to the client.
    Other(String),
}

impl Command {
    /// Command name as the client sent it.
    pub fn name(&self) -> &str {
        match self {
            Command::GetLocation => LOCATION_COMMAND,
            Command::Other(name) => name,
        }
    }
}

impl From<String> for Command {
    fn from(name: String) -> Self {
        if name == LOCATION_COMMAND {
            Command::GetLocation
        } else {
            Command::Other(name)
        }
    }
}

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Reply sent for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Location { location: Coordinates },
    Generic { response: String },
}

impl Response {
    /// Encode the reply as a JSON text frame payload.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode one message payload into a command.
///
/// Accepts UTF-8 JSON from either a text or a binary frame.
pub fn parse(payload: &[u8]) -> Result<Command, ProtocolError> {
    let value: Value = serde_json::from_slice(payload).map_err(ProtocolError::malformed)?;

    // serde would happily decode a struct from a JSON array
    if !value.is_object() {
        return Err(ProtocolError::malformed("expected a JSON object"));
    }

    let request = Request::deserialize(value).map_err(ProtocolError::malformed)?;
    let name = request
        .command
        .unwrap_or_else(|| DEFAULT_COMMAND.to_string());

    Ok(Command::from(name))
}

/// Produce the reply for a command.
///
/// `label` names this process in echoed replies: `"<label> received: <command>"`.
pub fn dispatch(command: &Command, label: &str) -> Response {
    match command {
        Command::GetLocation => Response::Location {
            location: FIXED_LOCATION,
        },
        Command::Other(name) => Response::Generic {
            response: format!("{label} received: {name}"),
        },
    }
}
