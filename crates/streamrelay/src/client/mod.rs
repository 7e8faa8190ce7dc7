//! Conversation stream client
//!
//! Sends conversations to the relay, decodes the forwarded event stream and
//! folds text deltas into live transcripts.

mod conversation;
pub mod decoder;
mod driver;
mod transcript;
mod transport;

pub use conversation::{AuxiliaryConversation, ChatSession, Conversation, ViewContext};
pub use decoder::{SseDecoder, StreamEvent, Utf8Decoder};
pub use driver::{ClientEvent, Notice, RetryPolicy, StreamDriver};
pub use transcript::Transcript;
pub use transport::{ByteStream, HttpTransport, RelayResponse, RelayTransport};
