pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504, 520];

/// OpenRouter API endpoint
pub const OPENROUTER_CHAT_COMPLETIONS: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Model defaults
pub const DEFAULT_CHAT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_VISION_MODEL: &str = "openai/gpt-4o";

/// Database pragmas
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

/// Attachments
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const PDF_MIME: &str = "application/pdf";
pub const IMAGE_MIMES: &[&str] = &["image/png", "image/jpeg", "image/jpg", "image/webp", "image/gif"];
/// Extracted document text beyond this many characters is dropped from the prompt.
pub const MAX_FILE_CONTEXT_CHARS: usize = 20_000;

/// Prompt assembly
pub const DEFAULT_HISTORY_TURNS: usize = 10;

/// Streaming cadence
pub const DEFAULT_BATCH_SIZE: usize = 3;
pub const DEFAULT_BATCH_DELAY_MS: u64 = 15;
pub const DEFAULT_FRAGMENT_IDLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STREAM_BUDGET_SECS: u64 = 300;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 25;
pub const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Titles
pub const TITLE_MAX_WORDS: usize = 5;
pub const TITLE_MAX_CHARS: usize = 60;
pub const UNTITLED_SESSION: &str = "New Session";

/// Structured generation limits
pub const MAX_FLASHCARDS: usize = 30;
pub const MAX_QUIZ_QUESTIONS: usize = 20;
pub const MAX_SOURCE_CHARS: usize = 15_000;

pub const TIMEOUT_FALLBACK_MESSAGE: &str =
    "Sorry, the tutor took too long to respond. Please try asking again.";
pub const UPSTREAM_FALLBACK_MESSAGE: &str =
    "Sorry, the tutor is unavailable right now. Please try again in a moment.";
pub const PERSISTENCE_FAILURE_MESSAGE: &str =
    "Your answer was delivered but could not be saved to this session.";

pub const TUTOR_SYSTEM_PROMPT: &str = "You are a patient, encouraging study tutor. \
Explain concepts step by step in plain language, check understanding with short follow-up \
questions, use concrete examples, and format answers in Markdown. If the student shares a \
document or image, ground your answers in it and say so when something is not covered. \
Never invent citations.";

pub const TITLE_SYSTEM_PROMPT: &str = "Summarize the student's first message as a study \
session title of at most five words. Reply with the title only, no quotes or punctuation.";
