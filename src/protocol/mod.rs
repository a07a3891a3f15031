//! Wire-level message shape and request id allocation.

mod id;
mod message;

pub use id::next_request_id;
pub use message::{ErrorBody, Message, Properties, SUBJECT_BAD_METHOD, SUBJECT_ERROR, SUBJECT_OK};
