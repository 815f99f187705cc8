//! The one entity that crosses the channel.
//!
//! Every frame is a flat tagged object. `status` decides how the rest of the
//! fields are read:
//!
//! * `call`  – `id`, `target`, `args`
//! * `ok`    – `id`, `value`
//! * `error` – `id`, `value` (error text)
//! * any other status is an *event*: `value` only, never an `id`
//!
//! ```ignore
//! use bridge_protocol::message::Message;
//! use serde_json::json;
//!
//! let call = Message::call("42", "controller", vec![json!("PreferencesController"), json!("getState")]);
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

pub const STATUS_CALL: &str = "call";
pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// Caller-minted correlation token.
pub type CallId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CallId>,
    /// Handler-group name, only on `call`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// `Some(Value::Null)` is kept distinct from an absent field.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    #[schemars(with = "Option<Value>")]
    pub value: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Known event categories. Events outside this list are still delivered,
/// they just have no enum variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventCategory {
    State,
    Notification,
    NetworkChanged,
    EndNetworkChange,
    Lock,
    Unlock,
    Emit,
    ProviderEmit,
}

/// A decoded message sorted into the three semantic kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call {
        id: CallId,
        target: String,
        args: Vec<Value>,
    },
    Ok {
        id: CallId,
        value: Value,
    },
    Error {
        id: CallId,
        message: String,
    },
    Event {
        category: String,
        value: Value,
    },
}

// -----------------------------------------------------------------------------
// Helper constructors
// -----------------------------------------------------------------------------
impl Message {
    pub fn call(id: impl Into<CallId>, target: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            status: STATUS_CALL.to_owned(),
            id: Some(id.into()),
            target: Some(target.into()),
            args: Some(args),
            value: None,
        }
    }

    pub fn ok(id: impl Into<CallId>, value: Value) -> Self {
        Self {
            status: STATUS_OK.to_owned(),
            id: Some(id.into()),
            target: None,
            args: None,
            value: Some(value),
        }
    }

    pub fn error(id: impl Into<CallId>, message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_owned(),
            id: Some(id.into()),
            target: None,
            args: None,
            value: Some(Value::String(message.into())),
        }
    }

    /// One-way event carrying a payload.
    pub fn event(category: impl AsRef<str>, value: Value) -> Self {
        Self {
            status: category.as_ref().to_owned(),
            id: None,
            target: None,
            args: None,
            value: Some(value),
        }
    }

    /// One-way event without payload (lock / unlock).
    pub fn signal(category: impl AsRef<str>) -> Self {
        Self {
            status: category.as_ref().to_owned(),
            id: None,
            target: None,
            args: None,
            value: None,
        }
    }

    pub fn is_event(&self) -> bool {
        !matches!(
            self.status.as_str(),
            STATUS_CALL | STATUS_OK | STATUS_ERROR
        )
    }

    /// Sort the message into call / result / event. Returns `None` for
    /// anything the receiver cannot act on (missing id on a call or result,
    /// missing target on a call, an id on an event, empty status).
    pub fn classify(self) -> Option<Envelope> {
        if self.status.is_empty() {
            return None;
        }
        match self.status.as_str() {
            STATUS_CALL => Some(Envelope::Call {
                id: self.id?,
                target: self.target?,
                args: self.args.unwrap_or_default(),
            }),
            STATUS_OK => Some(Envelope::Ok {
                id: self.id?,
                value: self.value.unwrap_or(Value::Null),
            }),
            STATUS_ERROR => {
                let message = match self.value {
                    Some(Value::String(text)) => text,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Some(Envelope::Error {
                    id: self.id?,
                    message,
                })
            }
            _ if self.id.is_some() => None,
            _ => Some(Envelope::Event {
                category: self.status,
                value: self.value.unwrap_or(Value::Null),
            }),
        }
    }
}
