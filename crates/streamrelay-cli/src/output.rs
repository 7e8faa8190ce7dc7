use streamrelay::client::{ClientEvent, Notice};

#[derive(Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// A rendered event and the stream it belongs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// Reply text, written without a trailing newline
    Stdout(String),
    Stderr(String),
}

pub fn render_event(event: &ClientEvent, format: OutputFormat) -> Rendered {
    match format {
        OutputFormat::Text => match event {
            ClientEvent::Delta(text) => Rendered::Stdout(text.clone()),
            ClientEvent::Notice(notice) => Rendered::Stderr(format!("[{notice}]")),
        },
        OutputFormat::Json => {
            let value = match event {
                ClientEvent::Delta(text) => serde_json::json!({
                    "type": "delta",
                    "text": text,
                }),
                ClientEvent::Notice(notice) => serde_json::json!({
                    "type": "notice",
                    "kind": notice_kind(notice),
                    "terminal": notice.is_terminal(),
                    "message": notice.to_string(),
                }),
            };
            Rendered::Stdout(format!("{value}\n"))
        }
    }
}

fn notice_kind(notice: &Notice) -> &'static str {
    match notice {
        Notice::RateLimitedRetrying { .. } => "rate_limited_retrying",
        Notice::EconomyMode { .. } => "economy_mode",
        Notice::RateLimitExhausted => "rate_limit_exhausted",
        Notice::QuotaExceeded => "quota_exceeded",
        Notice::Failed(_) => "failed",
    }
}

pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
