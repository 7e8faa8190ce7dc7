//! Streamrelay - streaming chat relay and conversation client
//!
//! The relay forwards a conversation to an OpenAI-compatible completion API,
//! retrying rate limits and downgrading to a cheaper model once when credits
//! run out, and streams the upstream body back untouched. The client decodes
//! that stream incrementally and folds the text into live transcripts.

pub mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod proxy;

pub use error::RelayError;
