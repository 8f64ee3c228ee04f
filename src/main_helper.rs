use crate::constants::{
    DEFAULT_BATCH_DELAY_MS, DEFAULT_BATCH_SIZE, DEFAULT_CHAT_MODEL, DEFAULT_FRAGMENT_IDLE_TIMEOUT_SECS,
    DEFAULT_HISTORY_TURNS, DEFAULT_STEP_TIMEOUT_SECS, DEFAULT_STREAM_BUDGET_SECS,
    DEFAULT_VISION_MODEL,
};
use crate::db::DbPool;
use crate::generate::Generator;
use crate::hardening::CircuitBreaker;
use crate::model::ChatModel;
use crate::reconcile::{TitleSummarizer, TranscriptReconciler};
use crate::streaming::{ChatPipeline, PacingConfig, PipelineConfig};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "studyhall.db")]
    pub database: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    /// Request body limit; uploads are additionally capped at 10 MiB.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 5)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = 30)]
    pub circuit_recovery_secs: u64,
    #[arg(long, default_value = DEFAULT_CHAT_MODEL)]
    pub chat_model: String,
    #[arg(long, default_value = DEFAULT_VISION_MODEL)]
    pub vision_model: String,
    /// Prior turns replayed into each prompt.
    #[arg(long, default_value_t = DEFAULT_HISTORY_TURNS)]
    pub history_turns: usize,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    #[arg(long, default_value_t = DEFAULT_BATCH_DELAY_MS)]
    pub batch_delay_ms: u64,
    #[arg(long, default_value_t = DEFAULT_FRAGMENT_IDLE_TIMEOUT_SECS)]
    pub fragment_idle_timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_STREAM_BUDGET_SECS)]
    pub stream_budget_secs: u64,
    /// Timeout of each non-streaming model call (titles, quiz questions, flashcards, mind maps).
    #[arg(long, default_value_t = DEFAULT_STEP_TIMEOUT_SECS)]
    pub step_timeout_secs: u64,
    /// Ask the model for session titles instead of deriving them from the first words.
    #[arg(long, default_value_t = false)]
    pub summarize_titles: bool,
    /// Comma-separated allowed origins; any origin when unset.
    #[arg(long)]
    pub cors_origins: Option<String>,
    #[arg(long, default_value = ".")]
    pub log_dir: String,
}

impl Default for Args {
    fn default() -> Self {
        Self::parse_from(["studyhall"])
    }
}

impl Args {
    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            batch_size: self.batch_size.max(1),
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            fragment_idle_timeout: Duration::from_secs(self.fragment_idle_timeout_secs),
            stream_budget: Duration::from_secs(self.stream_budget_secs),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Whole-request timeout of the model HTTP client. The client timeout also covers the
    /// streamed body, so it must not cut a stream before its budget runs out.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(self.stream_budget_secs))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub model: Arc<dyn ChatModel>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub pipeline: ChatPipeline,
    pub generator: Generator,
    pub args: Arc<Args>,
}

impl AppState {
    /// Wires the pipeline, reconciler and generator around one injected model client.
    pub fn new(
        db: DbPool,
        model: Arc<dyn ChatModel>,
        circuit_breaker: Arc<CircuitBreaker>,
        args: Arc<Args>,
    ) -> Self {
        let mut reconciler = TranscriptReconciler::new(db.clone());
        if args.summarize_titles {
            reconciler = reconciler.with_summarizer(TitleSummarizer {
                model: model.clone(),
                model_name: args.chat_model.clone(),
                step_timeout: args.step_timeout(),
            });
        }

        let config = PipelineConfig {
            chat_model: args.chat_model.clone(),
            vision_model: args.vision_model.clone(),
            history_turns: args.history_turns,
            pacing: args.pacing(),
        };
        let pipeline = ChatPipeline::new(db.clone(), model.clone(), reconciler, config);
        let generator = Generator::new(model.clone(), args.chat_model.clone(), args.step_timeout());

        Self {
            db,
            model,
            circuit_breaker,
            pipeline,
            generator,
            args,
        }
    }
}
