use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::conversation_store::{Completion, ConversationStore};
use crate::agent::ChatTransport;
use crate::errors::ChatError;
use crate::models::{Message, MessageRole, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Streaming,
    Cancelling,
}

/// Terminal state of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Completed(Option<TokenUsage>),
    Cancelled,
    Failed(String),
}

/// The one outstanding request. Never leaves the controller.
struct GenerationHandle {
    id: u64,
    token: CancellationToken,
    started: Instant,
}

struct ControllerState {
    phase: Phase,
    active: Option<GenerationHandle>,
    next_id: u64,
}

/// Runs at most one generation per conversation.
///
/// `send` and `cancel` never block on I/O: each generation consumes its chunk
/// stream on a task of `runtime`, checking the cancellation token before every
/// read and before applying every chunk.
pub struct StreamingController {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    runtime: Handle,
    user_name: String,
    state: Mutex<ControllerState>,
    phase: watch::Sender<Phase>,
}

impl StreamingController {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        user_name: impl Into<String>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            runtime,
            user_name: user_name.into(),
            state: Mutex::new(ControllerState { phase: Phase::Idle, active: None, next_id: 0 }),
            phase: watch::channel(Phase::Idle).0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Time since the current generation started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.lock().active.as_ref().map(|g| g.started.elapsed())
    }

    /// Appends the user turn and an empty assistant turn, then starts streaming.
    /// Fails without touching the conversation unless the controller is idle.
    pub fn send(self: &Arc<Self>, text: &str) -> Result<(), ChatError> {
        let (id, token, started) = {
            let mut state = self.lock();
            if state.phase != Phase::Idle {
                return Err(ChatError::AlreadyInProgress);
            }
            let id = state.next_id;
            state.next_id += 1;
            let token = CancellationToken::new();
            let started = Instant::now();
            state.active = Some(GenerationHandle { id, token: token.clone(), started });
            state.phase = Phase::Streaming;
            self.phase.send_replace(Phase::Streaming);
            (id, token, started)
        };

        // The slot is reserved; listeners notified by the store may call back in.
        let history = match self.open_turn(text) {
            Ok(history) => history,
            Err(e) => {
                error!(conversation = %self.store.id(), generation = id, "Could not open turn: {e}");
                self.finish(id);
                return Err(e);
            }
        };

        info!(
            conversation = %self.store.id(),
            generation = id,
            model = %self.transport.model_name(),
            "Generation started"
        );

        let controller = Arc::clone(self);
        self.runtime.spawn(async move {
            controller.run(id, history, token, started).await;
        });
        Ok(())
    }

    fn open_turn(&self, text: &str) -> Result<Vec<Message>, ChatError> {
        self.store.append(MessageRole::User, &self.user_name, text)?;
        let history = self.store.snapshot();
        self.store.begin(MessageRole::Assistant, self.transport.model_name())?;
        Ok(history)
    }

    /// Stops the running generation. A no-op unless streaming.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if state.phase != Phase::Streaming {
            return;
        }
        if let Some(active) = &state.active {
            info!(conversation = %self.store.id(), generation = active.id, "Cancelling generation");
            active.token.cancel();
        }
        state.phase = Phase::Cancelling;
        self.phase.send_replace(Phase::Cancelling);
    }

    /// Resolves once no generation is outstanding.
    pub async fn wait_idle(&self) {
        let mut phase = self.phase.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = phase.wait_for(|p| *p == Phase::Idle).await;
    }

    async fn run(self: Arc<Self>, id: u64, history: Vec<Message>, token: CancellationToken, started: Instant) {
        let guard = AbortGuard { controller: &self, id, started, armed: true };
        let outcome = self.consume(&history, &token).await;
        let elapsed = started.elapsed();

        let completion = match &outcome {
            Outcome::Completed(usage) => {
                info!(generation = id, elapsed_ms = elapsed.as_millis() as u64, "Generation completed");
                Completion::complete(*usage)
            }
            Outcome::Cancelled => {
                info!(generation = id, elapsed_ms = elapsed.as_millis() as u64, "Generation cancelled");
                Completion::truncated()
            }
            Outcome::Failed(reason) => {
                warn!(generation = id, elapsed_ms = elapsed.as_millis() as u64, %reason, "Generation failed");
                Completion::failed(reason.clone())
            }
        };

        guard.disarm();
        self.seal(id, completion.with_response_time(elapsed));
    }

    fn seal(&self, id: u64, completion: Completion) {
        if let Err(e) = self.store.complete(completion) {
            error!(generation = id, "Could not seal the assistant message: {e}");
        }
        self.finish(id);
    }

    /// Forwards chunks into the store until the stream ends, fails or is
    /// cancelled. The chunk stream, and with it the connection, is dropped on return.
    async fn consume(&self, history: &[Message], token: &CancellationToken) -> Outcome {
        let mut chunks = tokio::select! {
            biased;
            _ = token.cancelled() => return Outcome::Cancelled,
            opened = self.transport.stream(history) => match opened {
                Ok(chunks) => chunks,
                Err(e) => return Outcome::Failed(e.to_string()),
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Outcome::Cancelled,
                next = chunks.next() => next,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Outcome::Failed(e.to_string()),
                None => return Outcome::Failed("response ended before the final chunk".to_string()),
            };
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }
            if let Err(e) = self.store.append_chunk(&chunk.text) {
                return Outcome::Failed(e.to_string());
            }
            if chunk.is_final {
                return Outcome::Completed(chunk.usage);
            }
        }
    }

    fn finish(&self, id: u64) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|g| g.id == id) {
            state.active = None;
            state.phase = Phase::Idle;
            self.phase.send_replace(Phase::Idle);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Seals the turn as failed and frees the slot if the worker is torn down
/// (panic or runtime shutdown) before it gets to do so itself.
struct AbortGuard<'a> {
    controller: &'a StreamingController,
    id: u64,
    started: Instant,
    armed: bool,
}

impl AbortGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        error!(generation = self.id, "Generation worker stopped before sealing its turn");
        let completion = Completion::failed("generation aborted").with_response_time(self.started.elapsed());
        self.controller.seal(self.id, completion);
    }
}
