use crate::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response subject for a successful handler invocation.
pub const SUBJECT_OK: &str = "ok";

/// Response subject when no handler is bound for the requested method.
pub const SUBJECT_BAD_METHOD: &str = "bad-method";

/// Fallback response subject for a handler-reported error with no name.
pub const SUBJECT_ERROR: &str = "error";

/// Application properties carried by a message.
///
/// Requests set `subject` (method name), `message_id` (correlation token) and
/// `reply_to`; responses set `to`, `correlation_id` and a result `subject`.
/// Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Properties {
    pub subject: Option<String>,
    pub message_id: Option<u64>,
    pub correlation_id: Option<u64>,
    pub reply_to: Option<Address>,
    pub to: Option<Address>,
}

/// A transient wire message: properties plus an opaque JSON body.
///
/// Constructed per request/response and not retained after send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub properties: Properties,
    pub body: Value,
}

impl Message {
    // ---
    /// Build a request message.
    ///
    /// `message_id` is the caller-chosen correlation token the peer must echo
    /// back as `correlation_id`; `reply_to` is where the response goes.
    pub fn request(subject: &str, body: Value, message_id: u64, reply_to: Address) -> Self {
        // ---
        Self {
            properties: Properties {
                subject: Some(subject.to_string()),
                message_id: Some(message_id),
                reply_to: Some(reply_to),
                ..Properties::default()
            },
            body,
        }
    }

    /// Build a response message correlated to a request.
    pub fn response(to: Address, correlation_id: Option<u64>, subject: &str, body: Value) -> Self {
        // ---
        Self {
            properties: Properties {
                subject: Some(subject.to_string()),
                correlation_id,
                to: Some(to),
                ..Properties::default()
            },
            body,
        }
    }
}

/// Error payload a handler reports back to the caller.
///
/// On the wire the response carries `subject = name` (or `"error"` when no
/// name is given) and this struct serialized as the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
}

impl ErrorBody {
    // ---
    /// An unnamed error; the response subject falls back to `"error"`.
    pub fn new(message: impl Into<String>) -> Self {
        // ---
        Self {
            name: None,
            message: message.into(),
        }
    }

    /// A named error; the name becomes the response subject.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        // ---
        Self {
            name: Some(name.into()),
            message: message.into(),
        }
    }

    /// The response subject for this error.
    pub fn subject(&self) -> &str {
        self.name.as_deref().unwrap_or(SUBJECT_ERROR)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn request_sets_correlation_properties() {
        // ---
        let msg = Message::request("add", json!({"a": 2, "b": 3}), 7, Address::from("reply-1"));

        assert_eq!(msg.properties.subject.as_deref(), Some("add"));
        assert_eq!(msg.properties.message_id, Some(7));
        assert_eq!(msg.properties.reply_to, Some(Address::from("reply-1")));
        assert_eq!(msg.properties.correlation_id, None);
        assert_eq!(msg.properties.to, None);
    }

    #[test]
    fn response_echoes_correlation() {
        // ---
        let msg = Message::response(Address::from("reply-1"), Some(7), SUBJECT_OK, json!(5));

        assert_eq!(msg.properties.to, Some(Address::from("reply-1")));
        assert_eq!(msg.properties.correlation_id, Some(7));
        assert_eq!(msg.properties.subject.as_deref(), Some(SUBJECT_OK));
        assert_eq!(msg.properties.message_id, None);
    }

    #[test]
    fn error_subject_prefers_name() {
        // ---
        assert_eq!(ErrorBody::named("range-error", "out of range").subject(), "range-error");
        assert_eq!(ErrorBody::new("boom").subject(), SUBJECT_ERROR);
    }
}
