pub mod commands;
pub mod error;
pub mod output;

pub use commands::{ChatCommand, Input};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, Rendered, render_event, truncate_string};
