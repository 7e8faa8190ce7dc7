mod error;
pub mod policy;
mod server;
mod upstream;

pub use error::ProxyError;
pub use policy::{RelayAttempt, RelayPolicy, RelayState, TerminalKind, UpstreamVerdict};
pub use server::{AppState, MODEL_USED_HEADER, ProxyServer, create_router};
pub use upstream::UpstreamClient;
