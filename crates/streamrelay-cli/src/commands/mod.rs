pub mod chat;

pub use chat::{ChatCommand, Input};
