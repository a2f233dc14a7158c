//! Turn orchestration
//!
//! One user turn drives the model and the tool server through an explicit
//! state machine:
//!
//! ```text
//! AwaitingModel(step) ──final text──▶ Done
//!        │  ▲                 └──error──▶ Failed
//!   tool │  │ results stored
//!  calls ▼  │
//! DispatchingTools(step) ──step > max_steps──▶ Incomplete
//! ```
//!
//! Every message a step produces is durably appended before the next model
//! call, so a crash never loses a completed step.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sheerwater_ai::{
    CompleteOptions, Completion, CompletionOutcome, Context, Message, ModelGateway,
    RateLimitSnapshot, Tool, ToolCall, ToolOutcome, ToolRequest, ToolResultContent, Usage,
    DEFAULT_MAX_TOKENS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::events::TurnEvent;
use crate::locks::ConversationLocks;
use crate::settings::{Settings, SettingsScope, SettingsUpdate, SharedSettingsStore};
use crate::store::{ConversationInfo, SharedTranscriptStore};
use crate::tool::{SharedToolGateway, ToolCatalog, ToolFailure, render_failure, render_result};

/// Shown in place of a final answer when the step bound is reached
pub const INCOMPLETE_NOTICE: &str = "I wasn't able to finish this request within the allowed number of steps. \
The tool results gathered so far are shown above; ask me to continue if you need more.";

const TITLE_MAX_CHARS: usize = 50;

/// Orchestrator knobs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model calls allowed per turn
    pub max_steps: u32,
    /// Bound on each tool call
    pub tool_timeout: Duration,
    /// Generation limit per model call
    pub max_tokens: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            tool_timeout: Duration::from_secs(120),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// One user message to process
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    /// `None` starts a new conversation
    pub conversation_id: Option<String>,
    pub message: String,
    /// Explicit settings; `None` resolves them from the settings store
    pub settings: Option<Settings>,
}

impl TurnRequest {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: None,
            message: message.into(),
            settings: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The model produced a final answer
    Complete,
    /// The step bound was reached first
    Incomplete,
}

/// Consolidated outcome of one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub conversation_id: String,
    pub status: TurnStatus,
    /// Final answer, or [`INCOMPLETE_NOTICE`]
    pub text: String,
    /// Every tool call made during the turn, in request order
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    /// As reported by the last model call
    pub rate_limit: Option<RateLimitSnapshot>,
    /// Chart links produced by tools
    pub chart_urls: Vec<String>,
    /// Model calls made
    pub steps: u32,
}

impl TurnResult {
    pub fn is_incomplete(&self) -> bool {
        self.status == TurnStatus::Incomplete
    }
}

/// A stored conversation with its messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub info: ConversationInfo,
    pub messages: Vec<Message>,
}

enum TurnState {
    AwaitingModel {
        step: u32,
    },
    DispatchingTools {
        step: u32,
        text: String,
        requests: Vec<ToolRequest>,
    },
    Done {
        text: String,
    },
    Incomplete,
    Failed(Error),
}

/// Working state of one turn
struct TurnRun {
    conversation_id: String,
    settings: Settings,
    catalog: ToolCatalog,
    history: Vec<Message>,
    last_timestamp: i64,
    usage: Usage,
    rate_limit: Option<RateLimitSnapshot>,
    tool_calls: Vec<ToolCall>,
    chart_urls: Vec<String>,
    steps: u32,
}

impl TurnRun {
    /// Creation time for the next message, never earlier than the last one
    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = self.last_timestamp.max(now);
        self.last_timestamp
    }

    fn into_result(self, status: TurnStatus, text: String) -> TurnResult {
        TurnResult {
            conversation_id: self.conversation_id,
            status,
            text,
            tool_calls: self.tool_calls,
            usage: self.usage,
            rate_limit: self.rate_limit,
            chart_urls: self.chart_urls,
            steps: self.steps,
        }
    }
}

/// Result of one tool call within a step
struct Dispatched {
    call: ToolCall,
    content: ToolResultContent,
    chart_urls: Vec<String>,
}

struct Inner {
    model: Arc<dyn ModelGateway>,
    tools: SharedToolGateway,
    transcripts: SharedTranscriptStore,
    settings: SharedSettingsStore,
    locks: ConversationLocks,
    config: OrchestratorConfig,
    event_tx: broadcast::Sender<TurnEvent>,
}

/// Runs user turns against a model and a tool server.
///
/// Cheap to clone; clones share gateways, stores and conversation locks.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelGateway>,
        tools: SharedToolGateway,
        transcripts: SharedTranscriptStore,
        settings: SharedSettingsStore,
        config: OrchestratorConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                model,
                tools,
                transcripts,
                settings,
                locks: ConversationLocks::new(),
                config,
                event_tx,
            }),
        }
    }

    /// Subscribe to turn events
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Process one user message to a consolidated result.
    ///
    /// The turn runs on its own task: if the caller stops waiting, the turn
    /// still finishes and persists its work.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnResult> {
        let this = self.clone();
        tokio::spawn(async move { this.execute_turn(request).await })
            .await
            .map_err(|e| Error::Internal(format!("turn task failed: {}", e)))?
    }

    /// Effective settings for a user, optionally within a conversation
    pub fn settings(&self, user_id: &str, conversation_id: Option<&str>) -> Result<Settings> {
        Ok(self.inner.settings.get(user_id, conversation_id)?)
    }

    /// Apply a partial settings update
    pub fn update_settings(&self, scope: &SettingsScope, update: SettingsUpdate) -> Result<()> {
        self.inner.settings.put(scope, update)?;
        Ok(())
    }

    pub fn list_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationInfo>> {
        Ok(self.inner.transcripts.list_conversations(user_id, limit)?)
    }

    /// A conversation and its messages, if `user_id` owns it
    pub fn get_conversation(&self, user_id: &str, conversation_id: &str) -> Result<Transcript> {
        let info = self.owned_conversation(user_id, conversation_id)?;
        let messages = self.inner.transcripts.load(conversation_id)?;
        Ok(Transcript { info, messages })
    }

    /// Delete a conversation and its settings, if `user_id` owns it
    pub async fn delete_conversation(&self, user_id: &str, conversation_id: &str) -> Result<()> {
        let _guard = self.inner.locks.acquire(conversation_id).await;
        self.owned_conversation(user_id, conversation_id)?;
        self.inner.transcripts.delete(conversation_id)?;
        self.inner.settings.set_layer(
            &SettingsScope::Conversation(conversation_id.to_string()),
            SettingsUpdate::default(),
        )?;
        tracing::info!("Deleted conversation {}", conversation_id);
        Ok(())
    }

    /// Tools currently offered by the tool server
    pub async fn tool_catalog(&self) -> std::result::Result<Vec<Tool>, ToolFailure> {
        self.inner.tools.catalog().await
    }

    fn owned_conversation(&self, user_id: &str, conversation_id: &str) -> Result<ConversationInfo> {
        match self.inner.transcripts.get_conversation(conversation_id)? {
            Some(info) if info.user_id == user_id => Ok(info),
            _ => Err(Error::ConversationNotFound(conversation_id.to_string())),
        }
    }

    fn emit(&self, event: TurnEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    async fn execute_turn(&self, request: TurnRequest) -> Result<TurnResult> {
        let conversation_id = match &request.conversation_id {
            Some(id) => id.clone(),
            None => self.inner.transcripts.create(&request.user_id)?,
        };

        let _guard = self.inner.locks.acquire(&conversation_id).await;
        // Checked under the lock so a concurrent delete cannot slip in between
        let info = self.owned_conversation(&request.user_id, &conversation_id)?;

        let settings = match request.settings {
            Some(settings) => settings,
            None => self
                .inner
                .settings
                .get(&request.user_id, Some(&conversation_id))?,
        };
        let history = self.inner.transcripts.load(&conversation_id)?;
        let last_timestamp = history.last().map(Message::timestamp).unwrap_or(i64::MIN);

        let mut run = TurnRun {
            conversation_id: conversation_id.clone(),
            settings,
            catalog: ToolCatalog::empty(),
            history,
            last_timestamp,
            usage: Usage::default(),
            rate_limit: None,
            tool_calls: Vec::new(),
            chart_urls: Vec::new(),
            steps: 0,
        };

        self.persist(&mut run, Message::user(request.message.as_str()))?;
        if info.title.is_none() {
            self.inner
                .transcripts
                .set_title(&conversation_id, &title_from(&request.message))?;
        }

        tracing::info!(
            "Turn started for conversation {} ({} prior messages, model {})",
            conversation_id,
            run.history.len() - 1,
            run.settings.model
        );
        self.emit(TurnEvent::TurnStart {
            conversation_id: conversation_id.clone(),
        });

        run.catalog = match self.inner.tools.catalog().await {
            Ok(tools) => ToolCatalog::new(tools),
            Err(e) => {
                tracing::warn!("Tool catalog unavailable, continuing without tools: {}", e);
                ToolCatalog::empty()
            }
        };

        let mut state = TurnState::AwaitingModel { step: 1 };
        loop {
            state = match state {
                TurnState::Done { text } => {
                    self.finish(&run, false);
                    return Ok(run.into_result(TurnStatus::Complete, text));
                }
                TurnState::Incomplete => {
                    tracing::warn!(
                        "Turn for conversation {} reached the step bound ({}) without a final answer",
                        conversation_id,
                        self.inner.config.max_steps
                    );
                    if let Err(e) = self.persist(&mut run, Message::assistant(INCOMPLETE_NOTICE, vec![])) {
                        return Err(self.fail(&conversation_id, e));
                    }
                    self.finish(&run, true);
                    return Ok(run.into_result(TurnStatus::Incomplete, INCOMPLETE_NOTICE.to_string()));
                }
                TurnState::Failed(e) => return Err(self.fail(&conversation_id, e)),
                active => match self.advance(active, &mut run).await {
                    Ok(next) => next,
                    Err(e) => TurnState::Failed(e),
                },
            };
        }
    }

    /// Run one non-terminal state to the next state
    async fn advance(&self, state: TurnState, run: &mut TurnRun) -> Result<TurnState> {
        match state {
            TurnState::AwaitingModel { step } => {
                if step > self.inner.config.max_steps {
                    return Ok(TurnState::Incomplete);
                }
                self.emit(TurnEvent::ModelRequest {
                    conversation_id: run.conversation_id.clone(),
                    step,
                });

                let completion = self
                    .call_model(run)
                    .await
                    .map_err(|source| Error::ModelUnavailable { step, source })?;
                run.steps = step;
                run.usage.accumulate(&completion.usage);
                run.rate_limit = completion.rate_limit;

                match completion.outcome {
                    CompletionOutcome::FinalText(text) => {
                        self.persist(run, Message::assistant(text.as_str(), vec![]))?;
                        Ok(TurnState::Done { text })
                    }
                    CompletionOutcome::ToolRequests { text, requests } => {
                        tracing::debug!("Step {} requested {} tool call(s)", step, requests.len());
                        Ok(TurnState::DispatchingTools {
                            step,
                            text,
                            requests,
                        })
                    }
                }
            }
            TurnState::DispatchingTools {
                step,
                text,
                requests,
            } => {
                let dispatched = self.dispatch_tools(run, requests).await;

                let mut calls = Vec::with_capacity(dispatched.len());
                let mut results = Vec::with_capacity(dispatched.len());
                let mut chart_urls = Vec::new();
                for d in dispatched {
                    calls.push(d.call);
                    results.push(d.content);
                    chart_urls.extend(d.chart_urls);
                }

                self.persist(run, Message::assistant(text, calls.clone()))?;
                self.persist(run, Message::tool_results(results))?;
                run.tool_calls.extend(calls);
                run.chart_urls.extend(chart_urls);

                Ok(TurnState::AwaitingModel { step: step + 1 })
            }
            terminal => Ok(terminal),
        }
    }

    async fn call_model(&self, run: &TurnRun) -> sheerwater_ai::Result<Completion> {
        let context = Context {
            system_prompt: Some(run.settings.system_prompt.clone()),
            messages: run.history.clone(),
            tools: run.catalog.tools().to_vec(),
        };
        let options = CompleteOptions {
            model: run.settings.model.clone(),
            max_tokens: self.inner.config.max_tokens,
        };
        self.inner.model.complete(&context, &options).await
    }

    /// Run a step's tool calls concurrently; results keep request order
    async fn dispatch_tools(&self, run: &TurnRun, requests: Vec<ToolRequest>) -> Vec<Dispatched> {
        let calls = requests
            .into_iter()
            .map(|request| self.invoke_tool(&run.conversation_id, &run.catalog, request));
        join_all(calls).await
    }

    async fn invoke_tool(
        &self,
        conversation_id: &str,
        catalog: &ToolCatalog,
        request: ToolRequest,
    ) -> Dispatched {
        self.emit(TurnEvent::ToolExecutionStart {
            conversation_id: conversation_id.to_string(),
            tool_call_id: request.id.clone(),
            tool_name: request.name.clone(),
            arguments: request.arguments.clone(),
        });
        tracing::info!("Calling tool {} with {}", request.name, request.arguments);

        let result = match catalog.check(&request.name, &request.arguments) {
            Err(failure) => Err(failure),
            Ok(()) => {
                let invoke = self
                    .inner
                    .tools
                    .invoke(&request.name, request.arguments.clone());
                match tokio::time::timeout(self.inner.config.tool_timeout, invoke).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolFailure::Timeout),
                }
            }
        };

        let dispatched = match result {
            Ok(payload) => {
                let rendered = render_result(&payload);
                Dispatched {
                    content: ToolResultContent {
                        tool_call_id: request.id.clone(),
                        content: rendered.text,
                        is_error: false,
                    },
                    chart_urls: rendered.chart_urls,
                    call: request.complete(ToolOutcome::Success { result: payload }),
                }
            }
            Err(failure) => {
                tracing::warn!("Tool {} failed: {}", request.name, failure);
                Dispatched {
                    content: ToolResultContent {
                        tool_call_id: request.id.clone(),
                        content: render_failure(&failure),
                        is_error: true,
                    },
                    chart_urls: Vec::new(),
                    call: request.complete(ToolOutcome::Failure {
                        reason: failure.reason(),
                    }),
                }
            }
        };

        self.emit(TurnEvent::ToolExecutionEnd {
            conversation_id: conversation_id.to_string(),
            tool_call_id: dispatched.call.id.clone(),
            tool_name: dispatched.call.name.clone(),
            is_error: dispatched.call.outcome.is_error(),
        });
        dispatched
    }

    /// Durably append a message and add it to the working history
    fn persist(&self, run: &mut TurnRun, message: Message) -> Result<()> {
        let message = message.with_timestamp(run.next_timestamp());
        self.inner.transcripts.append(&run.conversation_id, &message)?;
        run.history.push(message);
        Ok(())
    }

    fn finish(&self, run: &TurnRun, incomplete: bool) {
        tracing::info!(
            "Turn finished for conversation {}: {} step(s), {} tool call(s), {} tokens",
            run.conversation_id,
            run.steps,
            run.tool_calls.len(),
            run.usage.total
        );
        self.emit(TurnEvent::TurnEnd {
            conversation_id: run.conversation_id.clone(),
            steps: run.steps,
            usage: run.usage,
            incomplete,
        });
    }

    fn fail(&self, conversation_id: &str, error: Error) -> Error {
        tracing::error!("Turn failed for conversation {}: {}", conversation_id, error);
        self.emit(TurnEvent::Error {
            conversation_id: conversation_id.to_string(),
            message: error.to_string(),
        });
        error
    }
}

/// Conversation title from its first message
pub fn title_from(message: &str) -> String {
    let mut chars = message.chars();
    let title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", title)
    } else {
        title
    }
}
