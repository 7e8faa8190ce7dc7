//! Primary and auxiliary conversations sharing one driver

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::messages::Message;

use super::driver::{RetryPolicy, StreamDriver};
use super::transcript::Transcript;
use super::transport::{HttpTransport, RelayTransport};

/// Clears the loading flag however the send ends
struct LoadingGuard<'a>(&'a mut bool);

impl<'a> LoadingGuard<'a> {
    fn acquire(flag: &'a mut bool) -> Result<Self> {
        if *flag {
            return Err(RelayError::Busy);
        }
        *flag = true;
        Ok(Self(flag))
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        *self.0 = false;
    }
}

/// One transcript and its in-flight gate
#[derive(Debug, Default)]
pub struct Conversation {
    transcript: Transcript,
    loading: bool,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Whether a reply is currently streaming
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Append `utterance` and stream the reply into the transcript
    ///
    /// Returns [`RelayError::Busy`] without touching the transcript while a
    /// previous send is still in flight.
    pub async fn send<T: RelayTransport>(
        &mut self,
        driver: &StreamDriver<T>,
        utterance: &str,
        policy: &RetryPolicy,
    ) -> Result<()> {
        self.send_with_preamble(driver, utterance, policy, None)
            .await
    }

    async fn send_with_preamble<T: RelayTransport>(
        &mut self,
        driver: &StreamDriver<T>,
        utterance: &str,
        policy: &RetryPolicy,
        preamble: Option<Message>,
    ) -> Result<()> {
        let _loading = LoadingGuard::acquire(&mut self.loading)?;

        self.transcript.push_user(utterance);

        let mut outgoing = Vec::with_capacity(self.transcript.len() + 1);
        outgoing.extend(preamble);
        outgoing.extend_from_slice(self.transcript.messages());

        driver.run(&outgoing, &mut self.transcript, policy).await
    }
}

/// What the user is looking at while talking to the auxiliary assistant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewContext {
    viewing: Option<String>,
}

impl ViewContext {
    pub fn new(viewing: impl Into<String>) -> Self {
        Self {
            viewing: Some(viewing.into()),
        }
    }

    pub fn viewing(&self) -> Option<&str> {
        self.viewing.as_deref()
    }

    /// System instruction describing the current view
    pub fn system_message(&self) -> Message {
        let content = match self.viewing.as_deref() {
            Some(viewing) => format!(
                "You are a helpful assistant embedded in the user's workspace. \
                 The user is currently viewing {viewing}. \
                 Use that context when it helps answer their question."
            ),
            None => "You are a helpful assistant embedded in the user's workspace. \
                     The user is not viewing anything in particular right now."
                .to_string(),
        };
        Message::system(content)
    }
}

/// Conversation whose requests are prefixed with the current view context
///
/// The prefix is rebuilt on every send and never stored in the transcript.
#[derive(Debug, Default)]
pub struct AuxiliaryConversation {
    conversation: Conversation,
    context: ViewContext,
}

impl AuxiliaryConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_context(&mut self, context: ViewContext) {
        self.context = context;
    }

    pub fn context(&self) -> &ViewContext {
        &self.context
    }

    pub fn transcript(&self) -> &Transcript {
        self.conversation.transcript()
    }

    pub fn is_loading(&self) -> bool {
        self.conversation.is_loading()
    }

    pub async fn send<T: RelayTransport>(
        &mut self,
        driver: &StreamDriver<T>,
        utterance: &str,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let preamble = self.context.system_message();
        self.conversation
            .send_with_preamble(driver, utterance, policy, Some(preamble))
            .await
    }
}

/// Both conversations plus the driver they share
pub struct ChatSession<T> {
    driver: StreamDriver<T>,
    primary: Conversation,
    auxiliary: AuxiliaryConversation,
    primary_policy: RetryPolicy,
    auxiliary_policy: RetryPolicy,
}

impl ChatSession<HttpTransport> {
    /// Session talking to the relay named in `config.client`
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::from_config(&config.client)?;
        let driver = StreamDriver::new(transport)
            .with_fallback_model(config.upstream.fallback_model.clone());

        let primary_policy = RetryPolicy::from_config(&config.client);
        let auxiliary_policy = if config.client.auxiliary_retries {
            primary_policy.clone()
        } else {
            primary_policy.single_attempt()
        };

        Ok(Self::new(driver, primary_policy, auxiliary_policy))
    }
}

impl<T: RelayTransport> ChatSession<T> {
    pub fn new(
        driver: StreamDriver<T>,
        primary_policy: RetryPolicy,
        auxiliary_policy: RetryPolicy,
    ) -> Self {
        Self {
            driver,
            primary: Conversation::new(),
            auxiliary: AuxiliaryConversation::new(),
            primary_policy,
            auxiliary_policy,
        }
    }

    /// Replace the driver, e.g. to attach an event channel
    pub fn map_driver(self, f: impl FnOnce(StreamDriver<T>) -> StreamDriver<T>) -> Self {
        Self {
            driver: f(self.driver),
            ..self
        }
    }

    pub fn primary(&self) -> &Conversation {
        &self.primary
    }

    pub fn auxiliary(&self) -> &AuxiliaryConversation {
        &self.auxiliary
    }

    pub fn set_view(&mut self, context: ViewContext) {
        self.auxiliary.set_context(context);
    }

    pub async fn send_primary(&mut self, utterance: &str) -> Result<()> {
        self.primary
            .send(&self.driver, utterance, &self.primary_policy)
            .await
    }

    pub async fn send_auxiliary(&mut self, utterance: &str) -> Result<()> {
        self.auxiliary
            .send(&self.driver, utterance, &self.auxiliary_policy)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::driver::tests::{Reply, ScriptedTransport, fast_policy, stream};
    use crate::messages::Role;

    const HI: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"hi there\"}}]}\n";
    const DONE: &str = "data: [DONE]\n";

    #[tokio::test]
    async fn test_send_appends_utterance_and_reply() {
        let driver = StreamDriver::new(ScriptedTransport::new(vec![stream(vec![HI, DONE])]));
        let mut conversation = Conversation::new();

        conversation
            .send(&driver, "hello", &fast_policy())
            .await
            .unwrap();

        assert_eq!(
            conversation.transcript().messages(),
            &[Message::user("hello"), Message::assistant("hi there")]
        );
        assert!(!conversation.is_loading());
    }

    #[tokio::test]
    async fn test_failed_send_keeps_utterance_and_clears_loading() {
        let driver = StreamDriver::new(ScriptedTransport::new(vec![Reply::Status(402)]));
        let mut conversation = Conversation::new();

        let err = conversation
            .send(&driver, "hello", &fast_policy())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::QuotaExceeded(_)));
        assert_eq!(
            conversation.transcript().messages(),
            &[Message::user("hello")]
        );
        assert!(!conversation.is_loading());
    }

    #[tokio::test]
    async fn test_busy_conversation_rejects_new_utterance() {
        let driver = StreamDriver::new(ScriptedTransport::new(vec![]));
        let mut conversation = Conversation::new();
        conversation.loading = true;

        let err = conversation
            .send(&driver, "hello", &fast_policy())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Busy));
        assert!(conversation.transcript().is_empty());
        assert!(conversation.is_loading());
        assert_eq!(driver.transport().calls(), 0);
    }

    #[tokio::test]
    async fn test_second_turn_sends_full_history() {
        let driver = StreamDriver::new(ScriptedTransport::new(vec![
            stream(vec![HI, DONE]),
            stream(vec![HI, DONE]),
        ]));
        let mut conversation = Conversation::new();

        conversation.send(&driver, "one", &fast_policy()).await.unwrap();
        conversation.send(&driver, "two", &fast_policy()).await.unwrap();

        let sent = driver.transport().sent.lock().unwrap();
        assert_eq!(
            sent[1],
            vec![
                Message::user("one"),
                Message::assistant("hi there"),
                Message::user("two")
            ]
        );
    }

    #[tokio::test]
    async fn test_auxiliary_prefixes_view_context() {
        let driver = StreamDriver::new(ScriptedTransport::new(vec![stream(vec![HI, DONE])]));
        let mut auxiliary = AuxiliaryConversation::new();
        auxiliary.set_context(ViewContext::new("the quarterly report"));

        auxiliary
            .send(&driver, "summarize", &fast_policy())
            .await
            .unwrap();

        let sent = driver.transport().sent.lock().unwrap();
        assert_eq!(sent[0].len(), 2);
        assert_eq!(sent[0][0].role, Role::System);
        assert!(
            sent[0][0]
                .content
                .contains("currently viewing the quarterly report")
        );
        assert_eq!(sent[0][1], Message::user("summarize"));

        // The prefix is not part of the stored transcript
        assert_eq!(
            auxiliary.transcript().messages(),
            &[Message::user("summarize"), Message::assistant("hi there")]
        );
    }

    #[tokio::test]
    async fn test_session_keeps_conversations_independent() {
        let driver = StreamDriver::new(ScriptedTransport::new(vec![
            stream(vec![HI, DONE]),
            stream(vec![HI, DONE]),
        ]));
        let mut session = ChatSession::new(driver, fast_policy(), fast_policy());
        session.set_view(ViewContext::new("docs/index.html"));

        session.send_primary("main question").await.unwrap();
        session.send_auxiliary("side question").await.unwrap();

        assert_eq!(session.primary().transcript().len(), 2);
        assert_eq!(session.auxiliary().transcript().len(), 2);
        assert_eq!(
            session.primary().transcript().messages()[0],
            Message::user("main question")
        );
        assert_eq!(
            session.auxiliary().context().viewing(),
            Some("docs/index.html")
        );
    }

    #[tokio::test]
    async fn test_session_auxiliary_policy_applies() {
        let driver = StreamDriver::new(ScriptedTransport::new(vec![Reply::Status(429)]));
        let mut session =
            ChatSession::new(driver, fast_policy(), fast_policy().single_attempt());

        let err = session.send_auxiliary("q").await.unwrap_err();

        assert!(matches!(err, RelayError::RateLimited(_)));
        assert!(!session.auxiliary().is_loading());
    }

    #[test]
    fn test_from_config_honors_auxiliary_retries() {
        let mut config = Config::default();
        config.client.auxiliary_retries = false;

        let session = ChatSession::from_config(&config).unwrap();
        assert_eq!(session.auxiliary_policy.max_attempts, 1);
        assert_eq!(session.primary_policy.max_attempts, 3);
    }

    #[test]
    fn test_empty_view_context_message() {
        let message = ViewContext::default().system_message();
        assert_eq!(message.role, Role::System);
        assert!(message.content.contains("not viewing anything"));
    }
}
