use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::traits::{MessageProcessor, PipelineStats, PipelineStatsSnapshot};
use crate::agent::Agent;
use crate::config::InterceptorConfig;
use crate::conversation::ConversationStore;
use crate::message::{ConversationContext, Message, MessageStatus, META_AGENT_ID};
use crate::routing::{MessageRouter, RoutingDecision};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Runs each message through pre-processing, routing, conversation
/// resolution, the bound agent and post-processing.
pub struct MessageInterceptor {
    router: Arc<dyn MessageRouter>,
    conversations: Arc<dyn ConversationStore>,
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    default_agent: RwLock<Option<String>>,
    pre_processors: RwLock<Vec<Arc<dyn MessageProcessor>>>,
    post_processors: RwLock<Vec<Arc<dyn MessageProcessor>>>,
    queue_tx: mpsc::UnboundedSender<Message>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    poll_interval: Duration,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: PipelineStats,
}

/// Conversation a routed message was bound to.
struct Resolved {
    context: ConversationContext,
    /// `create` already persisted the message as the seed.
    created: bool,
}

impl MessageInterceptor {
    pub fn new(router: Arc<dyn MessageRouter>, conversations: Arc<dyn ConversationStore>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            router,
            conversations,
            agents: RwLock::new(HashMap::new()),
            default_agent: RwLock::new(None),
            pre_processors: RwLock::new(Vec::new()),
            post_processors: RwLock::new(Vec::new()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            stats: PipelineStats::default(),
        }
    }

    pub fn from_config(
        router: Arc<dyn MessageRouter>,
        conversations: Arc<dyn ConversationStore>,
        config: &InterceptorConfig,
    ) -> Self {
        let interceptor = Self::new(router, conversations)
            .with_poll_interval(Duration::from_millis(config.queue_poll_interval_ms));
        if !config.default_agent.is_empty() {
            interceptor.set_default_agent(config.default_agent.as_str());
        }
        interceptor
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_default_agent(self, agent_id: impl Into<String>) -> Self {
        self.set_default_agent(agent_id);
        self
    }

    /// Agent used when a conversation has no registered agent of its own.
    pub fn set_default_agent(&self, agent_id: impl Into<String>) {
        *self.default_agent.write() = Some(agent_id.into());
    }

    pub fn default_agent(&self) -> Option<String> {
        self.default_agent.read().clone()
    }

    /// Register `agent` under its id, replacing any agent with the same id.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_string();
        self.agents.write().insert(id.clone(), agent);
        tracing::info!(agent = %id, "agent registered");
    }

    pub fn add_pre_processor(&self, processor: Arc<dyn MessageProcessor>) {
        tracing::debug!(processor = processor.name(), "pre-processor added");
        self.pre_processors.write().push(processor);
    }

    pub fn add_post_processor(&self, processor: Arc<dyn MessageProcessor>) {
        tracing::debug!(processor = processor.name(), "post-processor added");
        self.post_processors.write().push(processor);
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Process one message and return the agent's response, if any.
    ///
    /// Ignored messages and messages that cannot be bound to a conversation
    /// or an agent return `Ok(None)` with the status set accordingly.
    /// Processor, agent and storage faults are returned as errors. A message
    /// that had not yet reached a final status is marked failed; one already
    /// processed keeps that status when a post-processor fails.
    pub async fn intercept(&self, message: &mut Message) -> Result<Option<Message>> {
        self.stats.record_intercepted();
        match self.run(message).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if !message.status.is_terminal() {
                    self.fail(message);
                }
                tracing::error!(message_id = %message.id, error = %format!("{e:#}"), "message processing failed");
                Err(e)
            }
        }
    }

    async fn run(&self, message: &mut Message) -> Result<Option<Message>> {
        let pre = self.pre_processors.read().clone();
        for processor in pre {
            processor
                .process(message)
                .await
                .with_context(|| format!("pre-processor `{}` failed", processor.name()))?;
        }
        message.transition(MessageStatus::Queued);

        let decision = self.router.route(message).await;
        if !decision.should_process {
            message.transition(MessageStatus::Ignored);
            self.stats.record_ignored();
            tracing::info!(message_id = %message.id, reason = %decision.reason, "message ignored");
            return Ok(None);
        }

        let Some(Resolved { context, created }) = self.resolve_conversation(message, decision).await?
        else {
            self.fail(message);
            return Ok(None);
        };
        let conversation_id = context.conversation_id.clone();
        message.conversation_id = Some(conversation_id.clone());
        message.transition(MessageStatus::Processing);

        let Some(agent) = self.select_agent(&context) else {
            tracing::warn!(
                message_id = %message.id,
                conversation_id = %conversation_id,
                "no agent available for conversation"
            );
            self.fail(message);
            return Ok(None);
        };

        let response = agent
            .process(message, &context)
            .await
            .with_context(|| format!("agent `{}` failed", agent.id()))?;

        if !created {
            self.conversations.update(&conversation_id, message).await?;
        }
        if let Some(response) = &response {
            self.conversations.update(&conversation_id, response).await?;
        }
        message.transition(MessageStatus::Processed);
        self.stats.record_processed();

        let Some(mut response) = response else {
            return Ok(None);
        };
        let post = self.post_processors.read().clone();
        for processor in post {
            processor
                .process(&mut response)
                .await
                .with_context(|| format!("post-processor `{}` failed", processor.name()))?;
        }
        Ok(Some(response))
    }

    async fn resolve_conversation(
        &self,
        message: &Message,
        decision: RoutingDecision,
    ) -> Result<Option<Resolved>> {
        if decision.create_new_conversation {
            let mut metadata = decision.metadata;
            if !metadata.contains_key(META_AGENT_ID) {
                if let Some(agent_id) = self.default_agent() {
                    metadata.insert(META_AGENT_ID.into(), agent_id.into());
                }
            }
            let context = self.conversations.create(message, metadata).await?;
            tracing::info!(
                message_id = %message.id,
                conversation_id = %context.conversation_id,
                reason = %decision.reason,
                "conversation created for message"
            );
            return Ok(Some(Resolved {
                context,
                created: true,
            }));
        }

        let Some(conversation_id) = decision.conversation_id else {
            tracing::warn!(message_id = %message.id, "routing decision named no conversation");
            return Ok(None);
        };
        match self.conversations.get(&conversation_id).await? {
            Some(context) if !context.is_active => {
                tracing::warn!(message_id = %message.id, conversation_id = %conversation_id, "conversation is closed");
                Ok(None)
            }
            Some(context) => Ok(Some(Resolved {
                context,
                created: false,
            })),
            None => {
                tracing::warn!(message_id = %message.id, conversation_id = %conversation_id, "conversation not found");
                Ok(None)
            }
        }
    }

    fn select_agent(&self, context: &ConversationContext) -> Option<Arc<dyn Agent>> {
        let agents = self.agents.read();
        context
            .agent_id
            .as_deref()
            .and_then(|id| agents.get(id))
            .or_else(|| {
                self.default_agent
                    .read()
                    .as_deref()
                    .and_then(|id| agents.get(id))
            })
            .cloned()
    }

    fn fail(&self, message: &mut Message) {
        message.transition(MessageStatus::Failed);
        self.stats.record_failed();
    }

    /// Enqueue a message for the background loop.
    pub fn queue_message(&self, message: Message) {
        let message_id = message.id.clone();
        if self.queue_tx.send(message).is_err() {
            tracing::error!(message_id = %message_id, "intake queue closed, message dropped");
        } else {
            tracing::debug!(message_id = %message_id, "message queued");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the background loop. Returns `false` if it is already running.
    pub fn start_processing(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.process_queue().await });
        *self.worker.lock() = Some(handle);
        true
    }

    /// Ask the loop to exit and wait for it. An in-flight message finishes first.
    ///
    /// Returns `false` if the loop was not running.
    pub async fn stop_processing(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "processing loop terminated abnormally");
            }
        }
        true
    }

    async fn process_queue(&self) {
        let mut queue = self.queue_rx.lock().await;
        tracing::info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "processing loop started");
        while self.running.load(Ordering::SeqCst) {
            let mut message = match tokio::time::timeout(self.poll_interval, queue.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(message)) => message,
            };
            // Result is dropped; failures are already logged by intercept.
            let _ = self.intercept(&mut message).await;
        }
        tracing::info!("processing loop stopped");
    }
}
