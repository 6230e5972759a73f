//! Streaming response bridge: turns one chat request into an ordered event
//! stream, running the model/tool loop in a spawned task. Every exit path
//! releases the endpoint connections exactly once.

use super::credentials::{AuthError, CredentialResolver, RequestIdentity, Resolution};
use super::endpoints::{ConnectionRegistry, MergedCatalog};
use super::persistence::TurnStore;
use crate::domain::{
    ChatMessage, ConversationTurn, MessageRole, SideChannelKind, StreamEvent, ToolCall,
    ToolInvocation, ToolResult,
};
use crate::infrastructure::model::{
    ModelChunk, ModelProvider, ModelRequest, ToolDefinition,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Use the available tools when they help answer the user.";

const TITLE_MAX_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("generation finished without an assistant message")]
    NoAssistantMessage,
    #[error("generation exceeded the time budget")]
    BudgetExhausted,
}

impl BridgeError {
    pub fn user_message(&self) -> String {
        match self {
            BridgeError::NoAssistantMessage => {
                "The model finished without producing a reply. Please try again.".to_string()
            }
            BridgeError::BudgetExhausted => {
                "The response took too long and was stopped. Please try again.".to_string()
            }
        }
    }
}

/// Per-call failures reported over the stream and fed back to the model as
/// failed tool results so the loop can recover.
#[derive(Debug)]
enum CallFailure {
    NoSuchTool { tool: String },
    InvalidArguments { tool: String, reason: String },
    Execution { tool: String, message: String },
}

impl CallFailure {
    fn user_message(&self) -> String {
        match self {
            CallFailure::NoSuchTool { tool } => {
                format!("The model asked for a tool named '{tool}' that does not exist.")
            }
            CallFailure::InvalidArguments { tool, .. } => {
                format!("The arguments for tool '{tool}' could not be understood.")
            }
            CallFailure::Execution { tool, .. } => {
                format!("Tool '{tool}' failed while running.")
            }
        }
    }

    fn feedback(&self) -> String {
        match self {
            CallFailure::NoSuchTool { tool } => format!("Error: no tool named '{tool}' exists."),
            CallFailure::InvalidArguments { tool, reason } => {
                format!("Error: invalid arguments for '{tool}': {reason}")
            }
            CallFailure::Execution { tool, message } => {
                format!("Error: '{tool}' failed: {message}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub chat_id: String,
    pub messages: Vec<ChatMessage>,
    pub identity: RequestIdentity,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_steps: usize,
    pub budget: Duration,
}

pub struct Bridge {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<CredentialResolver>,
    store: Arc<dyn TurnStore>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ConnectionRegistry>,
        resolver: Arc<CredentialResolver>,
        store: Arc<dyn TurnStore>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            resolver,
            store,
            config,
        }
    }

    /// Starts one generation run. The returned stream ends when the run is
    /// over; cancelling the token aborts the run without persisting.
    pub fn run(
        self: &Arc<Self>,
        request: BridgeRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            bridge.drive(request, cancel, tx).await;
        });
        ReceiverStream::new(rx)
    }

    async fn drive(
        &self,
        request: BridgeRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(chat_id = %request.chat_id, "generation cancelled by caller");
            }
            outcome = tokio::time::timeout(self.config.budget, self.execute(&request, &tx)) => {
                if outcome.is_err() {
                    warn!(chat_id = %request.chat_id, "generation budget exhausted");
                    emit(
                        &tx,
                        StreamEvent::Error {
                            message: BridgeError::BudgetExhausted.user_message(),
                        },
                    )
                    .await;
                }
            }
        }
        // Exactly one release per run, on every exit path.
        self.registry.close_all().await;
    }

    async fn execute(&self, request: &BridgeRequest, tx: &mpsc::Sender<StreamEvent>) {
        let latest_user = latest_user_message(&request.messages);

        let bundle = match self.resolver.resolve(latest_user, &request.identity).await {
            Ok(Resolution::EmbeddedKey { .. }) => {
                // The key itself never leaves this scope.
                emit(
                    tx,
                    StreamEvent::SideChannel {
                        kind: SideChannelKind::ApiKeyAccepted,
                        payload: json!({
                            "message": "API key received. Send your next message to start using your tools."
                        }),
                    },
                )
                .await;
                return;
            }
            Ok(Resolution::Credentials(bundle)) => bundle,
            Err(err @ AuthError::Unauthenticated) => {
                emit(
                    tx,
                    StreamEvent::SideChannel {
                        kind: SideChannelKind::AuthRequired,
                        payload: json!({"message": err.user_message()}),
                    },
                )
                .await;
                return;
            }
        };

        let catalog = self.registry.merged_catalog(&bundle).await;
        let tools = tool_definitions(&catalog);

        let mut transcript = Vec::with_capacity(request.messages.len() + 1);
        transcript.push(ChatMessage::new(
            MessageRole::System,
            compose_system_prompt(self.config.system_prompt.as_deref(), &catalog),
        ));
        transcript.extend(request.messages.iter().cloned());

        let mut invocations: Vec<ToolInvocation> = Vec::new();
        let mut assistant_text = String::new();
        let mut message_id: Option<String> = None;

        for step in 1..=self.config.max_steps {
            debug!(chat_id = %request.chat_id, step, "generation step");
            let stream = self
                .provider
                .stream_chat(ModelRequest {
                    model: self.config.model.clone(),
                    messages: transcript.clone(),
                    tools: tools.clone(),
                })
                .await;
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(chat_id = %request.chat_id, %err, "model request failed");
                    emit(
                        tx,
                        StreamEvent::Error {
                            message: err.user_message(),
                        },
                    )
                    .await;
                    return;
                }
            };

            let mut step_text = String::new();
            let mut step_calls: Vec<ToolCall> = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(ModelChunk::TextDelta(delta)) => {
                        step_text.push_str(&delta);
                        if !emit(tx, StreamEvent::TextDelta { delta }).await {
                            return;
                        }
                    }
                    Ok(ModelChunk::ReasoningDelta(delta)) => {
                        if !emit(tx, StreamEvent::ReasoningDelta { delta }).await {
                            return;
                        }
                    }
                    Ok(ModelChunk::ToolCall(call)) => step_calls.push(call),
                    Ok(ModelChunk::Finished { message_id: id }) => {
                        message_id = Some(id);
                    }
                    Err(err) => {
                        warn!(chat_id = %request.chat_id, %err, "model stream failed");
                        emit(
                            tx,
                            StreamEvent::Error {
                                message: err.user_message(),
                            },
                        )
                        .await;
                        return;
                    }
                }
            }

            assistant_text = step_text.clone();
            if step_calls.is_empty() {
                break;
            }

            transcript.push(ChatMessage::assistant_with_calls(
                step_text,
                step_calls.clone(),
            ));
            for call in step_calls {
                let (message, invocation) = self
                    .invoke_tool(&catalog, &call, tx)
                    .await;
                if let Some(invocation) = invocation {
                    invocations.push(invocation);
                }
                let Some(message) = message else {
                    // Receiver gone; stop generating.
                    return;
                };
                transcript.push(message);
            }

            if step == self.config.max_steps {
                debug!(chat_id = %request.chat_id, "step limit reached, stopping tool loop");
            }
        }

        self.finish(request, assistant_text, message_id, invocations, tx)
            .await;
    }

    /// Runs one tool call end to end. Returns the transcript message to feed
    /// back to the model (None when the event receiver is gone) and the
    /// invocation record for persistence when the call succeeded.
    async fn invoke_tool(
        &self,
        catalog: &MergedCatalog,
        call: &ToolCall,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> (Option<ChatMessage>, Option<ToolInvocation>) {
        let args = if call.arguments.trim().is_empty() {
            Ok(Value::Object(Default::default()))
        } else {
            serde_json::from_str::<Value>(&call.arguments)
        };

        let args = match args {
            Ok(args) => args,
            Err(err) => {
                let failure = CallFailure::InvalidArguments {
                    tool: call.name.clone(),
                    reason: err.to_string(),
                };
                return (self.report_failure(call, failure, tx).await, None);
            }
        };

        if !emit(
            tx,
            StreamEvent::ToolCallStarted {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                args: args.clone(),
            },
        )
        .await
        {
            return (None, None);
        }

        let Some(entry) = catalog.get(&call.name) else {
            let failure = CallFailure::NoSuchTool {
                tool: call.name.clone(),
            };
            return (self.report_failure(call, failure, tx).await, None);
        };

        let remote_args = entry.tool.remote_arguments(&args);
        let outcome = self
            .registry
            .invoke(&entry.endpoint_id, &entry.tool.remote_name, remote_args)
            .await;

        match outcome {
            Ok(value) => {
                let result = ToolResult::from_value(value);
                let feedback = serde_json::to_string(&result)
                    .unwrap_or_else(|_| "(unrepresentable result)".to_string());
                if !emit(
                    tx,
                    StreamEvent::ToolCallResult {
                        call_id: call.id.clone(),
                        tool: call.name.clone(),
                        result: result.clone(),
                    },
                )
                .await
                {
                    return (None, None);
                }
                let invocation = ToolInvocation {
                    tool_name: call.name.clone(),
                    args,
                    result,
                };
                (
                    Some(ChatMessage::tool_result(call.id.clone(), feedback)),
                    Some(invocation),
                )
            }
            Err(err) => {
                let failure = CallFailure::Execution {
                    tool: call.name.clone(),
                    message: err.to_string(),
                };
                (self.report_failure(call, failure, tx).await, None)
            }
        }
    }

    async fn report_failure(
        &self,
        call: &ToolCall,
        failure: CallFailure,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Option<ChatMessage> {
        warn!(tool = %call.name, ?failure, "tool call failed");
        if !emit(
            tx,
            StreamEvent::Error {
                message: failure.user_message(),
            },
        )
        .await
        {
            return None;
        }
        Some(ChatMessage::tool_result(call.id.clone(), failure.feedback()))
    }

    async fn finish(
        &self,
        request: &BridgeRequest,
        assistant_text: String,
        message_id: Option<String>,
        invocations: Vec<ToolInvocation>,
        tx: &mpsc::Sender<StreamEvent>,
    ) {
        let Some(message_id) = message_id else {
            warn!(chat_id = %request.chat_id, "no assistant message id at finish");
            emit(
                tx,
                StreamEvent::Error {
                    message: BridgeError::NoAssistantMessage.user_message(),
                },
            )
            .await;
            return;
        };

        let user_message = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .cloned()
            .unwrap_or_else(|| ChatMessage::new(MessageRole::User, ""));
        let title = derive_title(&user_message.content);

        let turn = ConversationTurn {
            chat_id: request.chat_id.clone(),
            title,
            user_message,
            assistant_message_id: message_id,
            assistant_message: ChatMessage::new(MessageRole::Assistant, assistant_text),
            tool_invocations: invocations,
            created_at: chrono::Utc::now(),
        };

        // Persistence is best-effort; a failed save never fails the stream.
        if let Err(err) = self.store.save(turn).await {
            warn!(chat_id = %request.chat_id, %err, "failed to persist turn");
        }
    }
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

fn latest_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::User)
        .map(|message| message.content.as_str())
}

fn tool_definitions(catalog: &MergedCatalog) -> Vec<ToolDefinition> {
    catalog
        .iter()
        .map(|(name, entry)| ToolDefinition {
            name: name.clone(),
            description: entry.tool.description.clone(),
            parameters: entry.tool.parameters_schema(),
        })
        .collect()
}

fn compose_system_prompt(base: Option<&str>, catalog: &MergedCatalog) -> String {
    let mut prompt = base.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string();
    if !catalog.is_empty() {
        prompt.push_str("\n\nAvailable tools:\n");
        for (name, entry) in catalog.iter() {
            match &entry.tool.description {
                Some(description) => {
                    prompt.push_str(&format!("- {name}: {description}\n"));
                }
                None => prompt.push_str(&format!("- {name}\n")),
            }
        }
    }
    prompt
}

/// First line of the first user message, truncated on a char boundary.
pub fn derive_title(text: &str) -> Option<String> {
    let line = text.lines().next()?.trim();
    if line.is_empty() {
        return None;
    }
    let title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    Some(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::credentials::CredentialBundle;
    use crate::application::endpoints::{
        Connector, EndpointConnection, EndpointError,
    };
    use crate::application::persistence::MemoryTurnStore;
    use crate::config::{CredentialKind, EndpointConfig, TransportConfig};
    use crate::infrastructure::model::{ModelError, ModelStream};
    use async_trait::async_trait;
    use crate::application::catalog::RemoteToolInfo;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Plays back pre-scripted model responses, one script per step.
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Vec<ModelChunk>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<ModelChunk>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn stream_chat(&self, _request: ModelRequest) -> Result<ModelStream, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(
                script.into_iter().map(Ok),
            )))
        }
    }

    struct FakeConnection {
        closes: Arc<AtomicUsize>,
        call_delay: Option<Duration>,
    }

    #[async_trait]
    impl EndpointConnection for FakeConnection {
        async fn tools(&self) -> Vec<RemoteToolInfo> {
            vec![RemoteToolInfo {
                name: "join_meeting".into(),
                description: Some("Join a meeting".into()),
                input_schema: Some(json!({
                    "type": "object",
                    "properties": {"meeting_url": {"type": "string"}}
                })),
            }]
        }

        async fn call_tool(
            &self,
            _remote_name: &str,
            _arguments: Value,
        ) -> Result<Value, EndpointError> {
            if let Some(delay) = self.call_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(json!({"content": [{"type": "text", "text": "joined"}]}))
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        closes: Arc<AtomicUsize>,
        call_delay: Option<Duration>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _endpoint: &EndpointConfig,
            _credentials: &CredentialBundle,
        ) -> Result<Arc<dyn EndpointConnection>, EndpointError> {
            Ok(Arc::new(FakeConnection {
                closes: self.closes.clone(),
                call_delay: self.call_delay,
            }))
        }
    }

    struct Harness {
        bridge: Arc<Bridge>,
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryTurnStore>,
        closes: Arc<AtomicUsize>,
    }

    fn harness(scripts: Vec<Vec<ModelChunk>>) -> Harness {
        harness_with_delay(scripts, None)
    }

    fn harness_with_delay(scripts: Vec<Vec<ModelChunk>>, call_delay: Option<Duration>) -> Harness {
        let provider = Arc::new(ScriptedProvider::new(scripts));
        let closes = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ConnectionRegistry::with_connector(
            vec![EndpointConfig {
                id: "meetings".into(),
                transport: TransportConfig::StreamOverHttp {
                    url: "https://tools.example.com/sse".into(),
                    auth_header: None,
                },
                credential: CredentialKind::BearerHeader,
            }],
            Arc::new(FakeConnector {
                closes: closes.clone(),
                call_delay,
            }),
            Duration::from_secs(5),
        ));
        let store = Arc::new(MemoryTurnStore::new());
        let bridge = Arc::new(Bridge::new(
            provider.clone(),
            registry,
            Arc::new(CredentialResolver::new(None)),
            store.clone(),
            BridgeConfig {
                model: "gpt-4o-mini".into(),
                system_prompt: None,
                max_steps: 5,
                budget: Duration::from_secs(60),
            },
        ));
        Harness {
            bridge,
            provider,
            store,
            closes,
        }
    }

    fn authed_request(text: &str) -> BridgeRequest {
        BridgeRequest {
            chat_id: "chat-1".into(),
            messages: vec![ChatMessage::new(MessageRole::User, text)],
            identity: RequestIdentity {
                session_user_id: None,
                bearer_key: Some("key-1".into()),
            },
        }
    }

    async fn collect(
        bridge: &Arc<Bridge>,
        request: BridgeRequest,
        cancel: CancellationToken,
    ) -> Vec<StreamEvent> {
        bridge.run(request, cancel).collect::<Vec<_>>().await
    }

    fn tool_call_script(name: &str) -> Vec<ModelChunk> {
        vec![
            ModelChunk::ToolCall(ToolCall {
                id: "call-1".into(),
                name: name.into(),
                arguments: r#"{"meetingUrl": "https://meet.example.com/x"}"#.into(),
            }),
            ModelChunk::Finished {
                message_id: "m-1".into(),
            },
        ]
    }

    fn text_script(text: &str) -> Vec<ModelChunk> {
        vec![
            ModelChunk::TextDelta(text.into()),
            ModelChunk::Finished {
                message_id: "m-final".into(),
            },
        ]
    }

    #[tokio::test]
    async fn unauthenticated_run_prompts_once_and_never_generates() {
        let h = harness(vec![text_script("should not run")]);
        let request = BridgeRequest {
            chat_id: "chat-1".into(),
            messages: vec![ChatMessage::new(MessageRole::User, "hello")],
            identity: RequestIdentity::default(),
        };

        let events = collect(&h.bridge, request, CancellationToken::new()).await;
        let prompts: Vec<_> = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    StreamEvent::SideChannel {
                        kind: SideChannelKind::AuthRequired,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(prompts.len(), 1);
        assert_eq!(events.len(), 1);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.store.saved_count(), 0);
    }

    #[tokio::test]
    async fn embedded_key_is_acknowledged_and_never_persisted() {
        let h = harness(vec![text_script("should not run")]);
        let request = authed_request("here you go API KEY: abc123");

        let events = collect(&h.bridge, request, CancellationToken::new()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::SideChannel {
                kind: SideChannelKind::ApiKeyAccepted,
                ..
            }
        ));
        let wire = serde_json::to_string(&events).expect("serialize");
        assert!(!wire.contains("abc123"));
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.store.saved_count(), 0);
    }

    #[tokio::test]
    async fn plain_text_generation_streams_and_persists() {
        let h = harness(vec![text_script("Hello there")]);
        let events = collect(
            &h.bridge,
            authed_request("hi\nsecond line"),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            events,
            vec![StreamEvent::TextDelta {
                delta: "Hello there".into()
            }]
        );
        assert_eq!(h.store.saved_count(), 1);
        let turn = &h.store.turns()[0];
        assert_eq!(turn.assistant_message.content, "Hello there");
        assert_eq!(turn.assistant_message_id, "m-final");
        assert_eq!(turn.title.as_deref(), Some("hi"));
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_loop_orders_started_before_result() {
        let h = harness(vec![
            tool_call_script("joinMeeting"),
            text_script("Joined the meeting."),
        ]);
        let events = collect(
            &h.bridge,
            authed_request("join my meeting"),
            CancellationToken::new(),
        )
        .await;

        let started = events
            .iter()
            .position(|event| matches!(event, StreamEvent::ToolCallStarted { .. }))
            .expect("started event");
        let result = events
            .iter()
            .position(|event| matches!(event, StreamEvent::ToolCallResult { .. }))
            .expect("result event");
        let text = events
            .iter()
            .position(|event| matches!(event, StreamEvent::TextDelta { .. }))
            .expect("text event");
        assert!(started < result);
        assert!(result < text);

        let turn = &h.store.turns()[0];
        assert_eq!(turn.tool_invocations.len(), 1);
        assert_eq!(turn.tool_invocations[0].tool_name, "joinMeeting");
        assert!(!turn.tool_invocations[0].result.is_error());
    }

    #[tokio::test]
    async fn step_limit_bounds_a_tool_hungry_model() {
        let scripts = (0..10).map(|_| tool_call_script("joinMeeting")).collect();
        let h = harness(scripts);
        let events = collect(
            &h.bridge,
            authed_request("keep joining"),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(h.provider.call_count(), 5);
        assert_eq!(h.store.saved_count(), 1);
        let starts = events
            .iter()
            .filter(|event| matches!(event, StreamEvent::ToolCallStarted { .. }))
            .count();
        assert_eq!(starts, 5);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_and_loop_recovers() {
        let h = harness(vec![
            tool_call_script("nonexistentTool"),
            text_script("Sorry, moving on."),
        ]);
        let events = collect(
            &h.bridge,
            authed_request("do something"),
            CancellationToken::new(),
        )
        .await;

        assert!(events.iter().any(|event| matches!(
            event,
            StreamEvent::Error { message } if message.contains("nonexistentTool")
        )));
        assert!(events
            .iter()
            .any(|event| matches!(event, StreamEvent::TextDelta { .. })));
        assert_eq!(h.store.saved_count(), 1);
        assert!(h.store.turns()[0].tool_invocations.is_empty());
    }

    #[tokio::test]
    async fn cancel_mid_invoke_closes_once_and_never_saves() {
        let h = harness_with_delay(
            vec![tool_call_script("joinMeeting")],
            Some(Duration::from_secs(10)),
        );
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let events = collect(&h.bridge, authed_request("join"), cancel).await;
        assert!(events
            .iter()
            .any(|event| matches!(event, StreamEvent::ToolCallStarted { .. })));
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.saved_count(), 0);
    }

    #[tokio::test]
    async fn missing_finish_marker_reports_no_assistant_message() {
        let h = harness(vec![vec![ModelChunk::TextDelta("truncated".into())]]);
        let events = collect(&h.bridge, authed_request("hi"), CancellationToken::new()).await;

        assert!(events.iter().any(|event| matches!(
            event,
            StreamEvent::Error { message } if message.contains("without producing a reply")
        )));
        assert_eq!(h.store.saved_count(), 0);
    }

    #[test]
    fn titles_come_from_the_first_line_truncated() {
        assert_eq!(derive_title("hello world\nmore"), Some("hello world".into()));
        assert_eq!(derive_title("   "), None);
        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).unwrap().chars().count(), 80);
    }

    #[test]
    fn system_prompt_lists_catalog_tools() {
        let prompt = compose_system_prompt(Some("Base."), &MergedCatalog::default());
        assert_eq!(prompt, "Base.");
    }
}
