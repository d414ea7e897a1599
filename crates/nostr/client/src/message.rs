//! NIP-01 wire messages.
//!
//! Client to relay: `EVENT`, `REQ`, `CLOSE`, `AUTH`.
//! Relay to client: `EVENT`, `OK`, `EOSE`, `CLOSED`, `NOTICE`, `AUTH`, `COUNT`.
//! Anything else is kept as [`RelayMessage::Unknown`] so extensions can claim it.

use crate::error::{ClientError, Result};
use nostr::{Event, Filter};
use serde_json::{Value, json};

/// Message sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Auth(Event),
}

impl ClientMessage {
    /// Encode as the JSON array text sent over the wire.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut array = Vec::with_capacity(filters.len() + 2);
                array.push(Value::String("REQ".to_string()));
                array.push(Value::String(subscription_id.clone()));
                for filter in filters {
                    array.push(serde_json::to_value(filter)?);
                }
                Value::Array(array)
            }
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id]),
            ClientMessage::Auth(event) => json!(["AUTH", event]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    /// `["OK", event_id, accepted, message]`
    Ok(String, bool, String),
    Eose(String),
    /// `["CLOSED", subscription_id, reason]`
    Closed(String, String),
    Notice(String),
    Auth(String),
    Count(String, u64),
    /// A type tag the core does not know, with the remaining array elements.
    Unknown(String, Vec<Value>),
}

impl RelayMessage {
    /// The wire type tag of this message.
    pub fn kind(&self) -> &str {
        match self {
            RelayMessage::Event(..) => "EVENT",
            RelayMessage::Ok(..) => "OK",
            RelayMessage::Eose(_) => "EOSE",
            RelayMessage::Closed(..) => "CLOSED",
            RelayMessage::Notice(_) => "NOTICE",
            RelayMessage::Auth(_) => "AUTH",
            RelayMessage::Count(..) => "COUNT",
            RelayMessage::Unknown(kind, _) => kind,
        }
    }
}

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::InvalidMessage(message.into())
}

fn string_at(array: &[Value], index: usize, what: &str) -> Result<String> {
    array
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| invalid(format!("invalid {what}")))
}

/// Parse relay protocol JSON text into a typed relay message.
///
/// An empty array parses to `None`.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value =
        serde_json::from_str(text).map_err(|error| invalid(format!("not JSON: {error}")))?;
    let array = value
        .as_array()
        .ok_or_else(|| invalid("expected JSON array relay message"))?;
    if array.is_empty() {
        return Ok(None);
    }

    let kind = array[0]
        .as_str()
        .ok_or_else(|| invalid("missing relay message kind"))?;

    let message = match kind {
        "EVENT" => {
            if array.len() < 3 {
                return Err(invalid("invalid EVENT message"));
            }
            let subscription_id = string_at(array, 1, "EVENT subscription id")?;
            let event: Event = serde_json::from_value(array[2].clone())
                .map_err(|error| invalid(format!("invalid EVENT payload: {}", error)))?;
            RelayMessage::Event(subscription_id, event)
        }
        "OK" => {
            if array.len() < 4 {
                return Err(invalid("invalid OK message"));
            }
            let event_id = string_at(array, 1, "OK event id")?;
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| invalid("invalid OK accepted flag"))?;
            let message = string_at(array, 3, "OK message text")?;
            RelayMessage::Ok(event_id, accepted, message)
        }
        "EOSE" => {
            if array.len() < 2 {
                return Err(invalid("invalid EOSE message"));
            }
            RelayMessage::Eose(string_at(array, 1, "EOSE subscription id")?)
        }
        "CLOSED" => {
            if array.len() < 2 {
                return Err(invalid("invalid CLOSED message"));
            }
            let subscription_id = string_at(array, 1, "CLOSED subscription id")?;
            // The reason is optional on some relays.
            let reason = array
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            RelayMessage::Closed(subscription_id, reason)
        }
        "NOTICE" => {
            if array.len() < 2 {
                return Err(invalid("invalid NOTICE message"));
            }
            RelayMessage::Notice(string_at(array, 1, "NOTICE message text")?)
        }
        "AUTH" => {
            if array.len() < 2 {
                return Err(invalid("invalid AUTH message"));
            }
            RelayMessage::Auth(string_at(array, 1, "AUTH challenge")?)
        }
        "COUNT" => {
            if array.len() < 3 {
                return Err(invalid("invalid COUNT message"));
            }
            let subscription_id = string_at(array, 1, "COUNT subscription id")?;
            let count = array[2]
                .get("count")
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid("invalid COUNT payload"))?;
            RelayMessage::Count(subscription_id, count)
        }
        other => RelayMessage::Unknown(other.to_string(), array[1..].to_vec()),
    };

    Ok(Some(message))
}
