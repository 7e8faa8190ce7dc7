use std::future::Future;
use std::io::Write;
use std::path::Path;

use clap::Parser;
use streamrelay::RelayError;
use streamrelay::client::{ChatSession, ClientEvent, Transcript, ViewContext};
use streamrelay::config::Config;
use streamrelay::messages::Role;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::error::CliResult;
use crate::output::{OutputFormat, Rendered, render_event, truncate_string};

const HELP: &str = "\
Commands:
  <text>          send to the primary conversation
  /ask <text>     ask the auxiliary assistant about the current view
  /view <what>    set what you are viewing (empty clears it)
  /history        show both transcripts
  /quit           exit";

#[derive(Parser)]
pub struct ChatCommand {
    #[clap(long, help = "Relay URL (overrides client.relay_url)")]
    pub relay: Option<String>,

    #[clap(long, help = "Initial view context for the auxiliary assistant")]
    pub view: Option<String>,
}

/// One line typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Primary(String),
    Ask(String),
    View(String),
    History,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        if !line.starts_with('/') {
            return Input::Primary(line.to_string());
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" | "/exit" => Input::Quit,
            "/help" => Input::Help,
            "/history" => Input::History,
            "/view" => Input::View(rest.to_string()),
            "/ask" if rest.is_empty() => Input::Invalid("/ask needs a question".to_string()),
            "/ask" => Input::Ask(rest.to_string()),
            other => Input::Invalid(format!("Unknown command {other}, try /help")),
        }
    }
}

impl ChatCommand {
    pub async fn execute(&self, config_path: Option<&Path>, format: OutputFormat) -> CliResult<()> {
        let mut config = Config::load(config_path)?;
        if let Some(relay) = &self.relay {
            config.client.relay_url = relay.clone();
        }
        config.validate()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ChatSession::from_config(&config)?.map_driver(|d| d.with_events(tx));
        if let Some(view) = &self.view {
            session.set_view(ViewContext::new(view));
        }

        tracing::info!("Chatting through relay at {}", config.client.relay_url);
        eprintln!("Connected to {}. Type /help for commands.", config.client.relay_url);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            match Input::parse(&line) {
                Input::Empty => {}
                Input::Quit => break,
                Input::Help => eprintln!("{HELP}"),
                Input::Invalid(message) => eprintln!("{message}"),
                Input::History => print_history(&session),
                Input::View(context) => {
                    if context.is_empty() {
                        session.set_view(ViewContext::default());
                        eprintln!("View context cleared");
                    } else {
                        eprintln!("Now viewing {context}");
                        session.set_view(ViewContext::new(context));
                    }
                }
                Input::Primary(text) => {
                    stream_reply(session.send_primary(&text), &mut rx, format).await?;
                }
                Input::Ask(text) => {
                    stream_reply(session.send_auxiliary(&text), &mut rx, format).await?;
                }
            }
        }

        Ok(())
    }
}

/// Drive `send` to completion, printing events as they arrive
async fn stream_reply<F>(
    send: F,
    rx: &mut UnboundedReceiver<ClientEvent>,
    format: OutputFormat,
) -> CliResult<()>
where
    F: Future<Output = streamrelay::error::Result<()>>,
{
    let mut send = std::pin::pin!(send);

    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            Some(event) = rx.recv() => print_rendered(render_event(&event, format))?,
        }
    };
    while let Ok(event) = rx.try_recv() {
        print_rendered(render_event(&event, format))?;
    }

    if let OutputFormat::Text = format {
        println!();
    }

    match result {
        Ok(()) => {}
        // These already produced a notice
        Err(RelayError::RateLimited(_) | RelayError::QuotaExceeded(_) | RelayError::Transport(_)) => {
            tracing::debug!("Reply failed: {result:?}");
        }
        Err(e) => eprintln!("Error: {e}"),
    }
    Ok(())
}

fn print_rendered(rendered: Rendered) -> CliResult<()> {
    match rendered {
        Rendered::Stdout(text) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        }
        Rendered::Stderr(text) => eprintln!("{text}"),
    }
    Ok(())
}

fn print_history<T: streamrelay::client::RelayTransport>(session: &ChatSession<T>) {
    print_transcript("Primary", session.primary().transcript());
    let title = match session.auxiliary().context().viewing() {
        Some(viewing) => format!("Assistant (viewing {viewing})"),
        None => "Assistant".to_string(),
    };
    print_transcript(&title, session.auxiliary().transcript());
}

fn print_transcript(title: &str, transcript: &Transcript) {
    println!("== {title} ({} messages)", transcript.len());
    for message in transcript.messages() {
        let role = match message.role {
            Role::System => "system",
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("{role:>9}: {}", truncate_string(&message.content.replace('\n', " "), 100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_line_goes_to_primary() {
        assert_eq!(
            Input::parse("  what is rust?  "),
            Input::Primary("what is rust?".into())
        );
    }

    #[test]
    fn test_commands() {
        assert_eq!(Input::parse(""), Input::Empty);
        assert_eq!(Input::parse("/quit"), Input::Quit);
        assert_eq!(Input::parse("/exit"), Input::Quit);
        assert_eq!(Input::parse("/history"), Input::History);
        assert_eq!(Input::parse("/ask why?"), Input::Ask("why?".into()));
        assert_eq!(
            Input::parse("/view  the pricing page "),
            Input::View("the pricing page".into())
        );
        assert_eq!(Input::parse("/view"), Input::View(String::new()));
    }

    #[test]
    fn test_invalid_commands() {
        assert!(matches!(Input::parse("/ask"), Input::Invalid(_)));
        assert!(matches!(Input::parse("/nope"), Input::Invalid(m) if m.contains("/nope")));
    }
}
