//! Stream orchestration for the chat endpoint.
//!
//! `prepare` does everything that may still fail with an HTTP status. Once `run` starts, the
//! response is committed and every failure is reported in-band as a terminal frame.

use crate::chunk_buffer::ChunkBuffer;
use crate::constants::{
    DEFAULT_BATCH_DELAY_MS, DEFAULT_BATCH_SIZE, DEFAULT_FRAGMENT_IDLE_TIMEOUT_SECS,
    DEFAULT_HISTORY_TURNS, DEFAULT_STREAM_BUDGET_SECS, PERSISTENCE_FAILURE_MESSAGE,
    TIMEOUT_FALLBACK_MESSAGE, TUTOR_SYSTEM_PROMPT, UPSTREAM_FALLBACK_MESSAGE,
};
use crate::db::{self, DbPool};
use crate::frames::{FrameSink, SinkStatus, StreamFrame};
use crate::intent::{extract_pdf_text, Attachment, Mode, Operation, RequestIntent};
use crate::logging::StreamMetric;
use crate::model::{ChatModel, ModelRequest};
use crate::prompt::{build_prompt, select_model, PromptParts};
use crate::reconcile::{Exchange, TranscriptReconciler};
use crate::types::{ChatTurn, Result, Role, StudyError};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Init,
    Validating,
    InvokingModel,
    Streaming,
    Finalizing,
    Closed,
    Error,
}

impl StreamPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamPhase::Init => "init",
            StreamPhase::Validating => "validating",
            StreamPhase::InvokingModel => "invoking_model",
            StreamPhase::Streaming => "streaming",
            StreamPhase::Finalizing => "finalizing",
            StreamPhase::Closed => "closed",
            StreamPhase::Error => "error",
        }
    }
}

fn enter(phase: &mut StreamPhase, next: StreamPhase) {
    tracing::debug!("Stream phase {} -> {}", phase.as_str(), next.as_str());
    *phase = next;
}

/// Delivery cadence and time limits of a streamed answer.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub fragment_idle_timeout: Duration,
    pub stream_budget: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            fragment_idle_timeout: Duration::from_secs(DEFAULT_FRAGMENT_IDLE_TIMEOUT_SECS),
            stream_budget: Duration::from_secs(DEFAULT_STREAM_BUDGET_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chat_model: String,
    pub vision_model: String,
    pub history_turns: usize,
    pub pacing: PacingConfig,
}

impl PipelineConfig {
    pub fn new(chat_model: impl Into<String>, vision_model: impl Into<String>) -> Self {
        Self {
            chat_model: chat_model.into(),
            vision_model: vision_model.into(),
            history_turns: DEFAULT_HISTORY_TURNS,
            pacing: PacingConfig::default(),
        }
    }
}

/// A validated request with everything the model call needs.
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub intent: RequestIntent,
    pub history: Vec<ChatTurn>,
    pub file_context: Option<String>,
    pub model: String,
    pub request_id: String,
}

/// What a finished stream did, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub phase: StreamPhase,
    pub full_text: String,
    pub frames: usize,
    pub persisted: bool,
    pub disconnected: bool,
}

#[derive(Clone)]
pub struct ChatPipeline {
    db: DbPool,
    model: Arc<dyn ChatModel>,
    reconciler: TranscriptReconciler,
    config: PipelineConfig,
}

enum Pull {
    Fragment(String),
    End,
    Failed(crate::types::ObservedError),
    TimedOut,
}

impl ChatPipeline {
    pub fn new(
        db: DbPool,
        model: Arc<dyn ChatModel>,
        reconciler: TranscriptReconciler,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            model,
            reconciler,
            config,
        }
    }

    /// Authorization, history loading and attachment extraction. No model work happens here.
    ///
    /// Every check that can reject the request runs before the session row is created.
    pub async fn prepare(&self, intent: RequestIntent, request_id: &str) -> Result<PreparedChat> {
        let mut phase = StreamPhase::Init;
        enter(&mut phase, StreamPhase::Validating);

        let file_context = match &intent.attachment {
            Attachment::Pdf(pdf) => Some(extract_pdf_text(pdf).await?),
            Attachment::None | Attachment::Image(_) => None,
        };

        let history = match &intent.mode {
            Mode::Guest { history } => history.clone(),
            Mode::Authenticated { user_id } => {
                if db::find_user(&self.db, user_id).await?.is_none() {
                    return Err(StudyError::NotFound(format!("User {} not found", user_id)).into());
                }
                if let Some(session) = db::get_session(&self.db, &intent.session_id).await? {
                    if session.user_id.as_ref() != Some(user_id) {
                        return Err(StudyError::Forbidden(format!(
                            "Session {} belongs to another user",
                            intent.session_id.short()
                        ))
                        .into());
                    }
                }
                let history = self.stored_history(&intent).await?;
                db::ensure_session(&self.db, &intent.session_id, user_id).await?;
                history
            }
        };

        let model = select_model(
            &self.config.chat_model,
            &self.config.vision_model,
            intent.attachment.image().is_some(),
        )
        .to_string();

        tracing::debug!(
            "Prepared chat for {}: guest={} history={} attachment={}",
            intent.session_id.short(),
            intent.is_guest(),
            history.len(),
            intent.attachment.kind()
        );

        Ok(PreparedChat {
            intent,
            history,
            file_context,
            model,
            request_id: request_id.to_string(),
        })
    }

    async fn stored_history(&self, intent: &RequestIntent) -> Result<Vec<ChatTurn>> {
        match &intent.operation {
            Operation::Send => {
                let recent =
                    db::recent_messages(&self.db, &intent.session_id, self.config.history_turns)
                        .await?;
                Ok(recent.into_iter().map(ChatTurn::from).collect())
            }
            Operation::Edit { message_id } => {
                // The edited question is answered as if nothing after it had been said.
                let all = db::list_messages(&self.db, &intent.session_id).await?;
                let position = all
                    .iter()
                    .position(|m| &m.id == message_id && m.role == Role::User);
                match position {
                    Some(idx) => {
                        let start = idx.saturating_sub(self.config.history_turns);
                        Ok(all[start..idx].iter().cloned().map(ChatTurn::from).collect())
                    }
                    None => Err(StudyError::NotFound(format!(
                        "Message {} not found in session {}",
                        message_id,
                        intent.session_id.short()
                    ))
                    .into()),
                }
            }
        }
    }

    /// Streams the answer into `sink`, then records the exchange.
    pub async fn run(&self, prepared: PreparedChat, sink: FrameSink) -> StreamOutcome {
        let span = tracing::info_span!(
            "stream",
            session = %prepared.intent.session_id.short(),
            request_id = %prepared.request_id,
            model = %prepared.model
        );
        self.run_inner(prepared, sink).instrument(span).await
    }

    async fn run_inner(&self, prepared: PreparedChat, mut sink: FrameSink) -> StreamOutcome {
        let started = Instant::now();
        let pacing = &self.config.pacing;
        let mut phase = StreamPhase::Validating;
        let mut metric = StreamMetric::new();
        let mut full_text = String::new();

        enter(&mut phase, StreamPhase::InvokingModel);
        let messages = build_prompt(&PromptParts {
            system_rules: TUTOR_SYSTEM_PROMPT,
            file_context: prepared.file_context.as_deref(),
            history: &prepared.history,
            max_history: self.config.history_turns,
            user_text: &prepared.intent.message,
            image: prepared.intent.attachment.image(),
        });
        let request = ModelRequest::new(prepared.model.clone(), messages).with_temperature(0.7);

        let opened = tokio::time::timeout(
            pacing.fragment_idle_timeout,
            self.model.stream_chat(request),
        )
        .await;
        let mut tokens = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!("Model invocation failed: {}", e);
                return self
                    .fail(&mut phase, &mut sink, &metric, started, UPSTREAM_FALLBACK_MESSAGE)
                    .await;
            }
            Err(_) => {
                tracing::error!(
                    "Model did not start streaming within {:?}",
                    pacing.fragment_idle_timeout
                );
                return self
                    .fail(&mut phase, &mut sink, &metric, started, TIMEOUT_FALLBACK_MESSAGE)
                    .await;
            }
        };

        enter(&mut phase, StreamPhase::Streaming);
        let deadline = started + pacing.stream_budget;
        let mut buffer = ChunkBuffer::new(pacing.batch_size);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = pacing.fragment_idle_timeout.min(remaining);
            let pulled = match tokio::time::timeout(wait, tokens.next()).await {
                Ok(Some(Ok(fragment))) => Pull::Fragment(fragment),
                Ok(Some(Err(e))) => Pull::Failed(e),
                Ok(None) => Pull::End,
                Err(_) => Pull::TimedOut,
            };

            let fragment = match pulled {
                Pull::Fragment(f) => f,
                Pull::End => break,
                Pull::Failed(e) => {
                    tracing::error!("Model stream failed after {} chars: {}", full_text.len(), e);
                    return self
                        .fail(&mut phase, &mut sink, &metric, started, UPSTREAM_FALLBACK_MESSAGE)
                        .await;
                }
                Pull::TimedOut => {
                    tracing::error!(
                        "Model stream stalled ({} chars so far, {:?} elapsed)",
                        full_text.len(),
                        started.elapsed()
                    );
                    return self
                        .fail(&mut phase, &mut sink, &metric, started, TIMEOUT_FALLBACK_MESSAGE)
                        .await;
                }
            };

            metric.record_fragment(&fragment, started.elapsed());
            full_text.push_str(&fragment);

            for batch in buffer.push(&fragment) {
                if !self.deliver(&mut sink, &mut metric, batch).await {
                    // Dropping `tokens` aborts the upstream request.
                    drop(tokens);
                    return self.disconnected(&mut phase, &metric, started, full_text);
                }
            }
        }

        if let Some(rest) = buffer.flush() {
            if !self.deliver(&mut sink, &mut metric, rest).await {
                return self.disconnected(&mut phase, &metric, started, full_text);
            }
        }

        if full_text.trim().is_empty() {
            tracing::warn!("Model finished without producing any text");
            return self
                .fail(&mut phase, &mut sink, &metric, started, UPSTREAM_FALLBACK_MESSAGE)
                .await;
        }

        enter(&mut phase, StreamPhase::Finalizing);
        let exchange = Exchange {
            session_id: prepared.intent.session_id.clone(),
            mode: prepared.intent.mode.clone(),
            operation: prepared.intent.operation.clone(),
            user_text: prepared.intent.message.clone(),
            assistant_text: full_text.clone(),
        };

        let persisted = match self.reconciler.reconcile(&exchange).await {
            Ok(outcome) => {
                if let Some(title) = outcome.title {
                    sink.send(StreamFrame::title(title)).await;
                }
                outcome.persisted
            }
            Err(e) => {
                tracing::error!("Failed to persist exchange: {}", e);
                sink.send(StreamFrame::persistence_error(PERSISTENCE_FAILURE_MESSAGE))
                    .await;
                false
            }
        };

        let status = sink.send(StreamFrame::complete(full_text.clone())).await;
        metric.frames = sink.frames_sent();
        enter(&mut phase, StreamPhase::Closed);
        metric.log_summary("complete", started.elapsed());

        StreamOutcome {
            phase,
            full_text,
            frames: metric.frames,
            persisted,
            disconnected: status == SinkStatus::Disconnected,
        }
    }

    /// Writes one paced chunk. Returns false once the client is gone.
    async fn deliver(&self, sink: &mut FrameSink, metric: &mut StreamMetric, batch: String) -> bool {
        match sink.send(StreamFrame::chunk(batch)).await {
            SinkStatus::Delivered => {
                metric.record_batch();
                if !self.config.pacing.batch_delay.is_zero() {
                    tokio::time::sleep(self.config.pacing.batch_delay).await;
                }
                true
            }
            SinkStatus::Disconnected | SinkStatus::Terminated => false,
        }
    }

    async fn fail(
        &self,
        phase: &mut StreamPhase,
        sink: &mut FrameSink,
        metric: &StreamMetric,
        started: Instant,
        message: &str,
    ) -> StreamOutcome {
        enter(phase, StreamPhase::Error);
        let status = sink.send(StreamFrame::error(message)).await;
        metric.log_summary("error", started.elapsed());
        StreamOutcome {
            phase: *phase,
            full_text: String::new(),
            frames: sink.frames_sent(),
            persisted: false,
            disconnected: status == SinkStatus::Disconnected,
        }
    }

    fn disconnected(
        &self,
        phase: &mut StreamPhase,
        metric: &StreamMetric,
        started: Instant,
        full_text: String,
    ) -> StreamOutcome {
        tracing::info!(
            "Client disconnected after {} chars; stopping without saving",
            full_text.len()
        );
        enter(phase, StreamPhase::Closed);
        metric.log_summary("disconnected", started.elapsed());
        StreamOutcome {
            phase: *phase,
            full_text,
            frames: metric.batches,
            persisted: false,
            disconnected: true,
        }
    }
}
