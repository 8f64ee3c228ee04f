//! Durable recording of an exchange after the answer has been delivered.

use crate::constants::{TITLE_MAX_CHARS, TITLE_MAX_WORDS, TITLE_SYSTEM_PROMPT, UNTITLED_SESSION};
use crate::db::{self, DbPool};
use crate::intent::{Mode, Operation};
use crate::model::{ChatModel, ModelRequest};
use crate::specs::openai::{OpenAiContent, OpenAiMessage};
use crate::types::{MessageId, Result, Role, SessionId, StoredMessage, StudyError, UserId};
use std::sync::Arc;
use std::time::Duration;

/// One finished question/answer pair.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub session_id: SessionId,
    pub mode: Mode,
    pub operation: Operation,
    pub user_text: String,
    pub assistant_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub persisted: bool,
    pub user_message_id: Option<MessageId>,
    pub assistant_message_id: Option<MessageId>,
    /// Set when this exchange gave the session its title.
    pub title: Option<String>,
}

/// Optional model-backed title summarization.
#[derive(Clone)]
pub struct TitleSummarizer {
    pub model: Arc<dyn ChatModel>,
    pub model_name: String,
    pub step_timeout: Duration,
}

#[derive(Clone)]
pub struct TranscriptReconciler {
    db: DbPool,
    summarizer: Option<TitleSummarizer>,
}

impl TranscriptReconciler {
    pub fn new(db: DbPool) -> Self {
        Self {
            db,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: TitleSummarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub async fn reconcile(&self, exchange: &Exchange) -> Result<ReconcileOutcome> {
        let user_id = match &exchange.mode {
            Mode::Guest { history } => {
                // The caller owns guest history; only the title is computed here.
                let title = if history.is_empty() {
                    Some(derive_title(&exchange.user_text))
                } else {
                    None
                };
                tracing::debug!("Guest exchange in {}: nothing persisted", exchange.session_id.short());
                return Ok(ReconcileOutcome {
                    title,
                    ..Default::default()
                });
            }
            Mode::Authenticated { user_id } => user_id,
        };

        let candidate_title = match db::session_topic(&self.db, &exchange.session_id).await? {
            Some(_) => None,
            None => Some(self.title_for(&exchange.user_text).await),
        };

        let mut tx = self.db.begin().await?;
        let now = db::now_millis();

        let (user_message_id, assistant_message_id) = match &exchange.operation {
            Operation::Send => {
                let user_message = new_message(exchange, user_id, Role::User, &exchange.user_text, now);
                let assistant_message =
                    new_message(exchange, user_id, Role::Assistant, &exchange.assistant_text, now);
                db::insert_message(&mut *tx, &user_message).await?;
                db::insert_message(&mut *tx, &assistant_message).await?;
                (user_message.id, assistant_message.id)
            }
            Operation::Edit { message_id } => {
                let target = match db::get_message(&mut *tx, message_id).await? {
                    Some(m) if m.session_id == exchange.session_id && m.role == Role::User => m,
                    _ => {
                        return Err(StudyError::NotFound(format!(
                            "Message {} not found in session {}",
                            message_id,
                            exchange.session_id.short()
                        ))
                        .into())
                    }
                };

                db::update_message_content(
                    &mut *tx,
                    &exchange.session_id,
                    &target.id,
                    &exchange.user_text,
                )
                .await?;

                let removed = db::delete_following_assistant(&mut tx, &target).await?;
                // The replacement takes the removed reply's place in the ordering.
                let slot = match &removed {
                    Some(old) => old.created_at,
                    None => target.created_at,
                };
                let assistant_message =
                    new_message(exchange, user_id, Role::Assistant, &exchange.assistant_text, slot);
                db::insert_message(&mut *tx, &assistant_message).await?;
                tracing::debug!(
                    "Edited {}: replaced reply {:?} with {}",
                    target.id,
                    removed.map(|m| m.id.0),
                    assistant_message.id
                );
                (target.id, assistant_message.id)
            }
        };

        let title = match candidate_title {
            Some(t) => {
                if db::set_topic_if_empty(&mut *tx, &exchange.session_id, &t).await? {
                    Some(t)
                } else {
                    None
                }
            }
            None => None,
        };

        tx.commit().await?;

        tracing::info!(
            "Persisted exchange in {} (user {}, assistant {})",
            exchange.session_id.short(),
            user_message_id,
            assistant_message_id
        );

        Ok(ReconcileOutcome {
            persisted: true,
            user_message_id: Some(user_message_id),
            assistant_message_id: Some(assistant_message_id),
            title,
        })
    }

    async fn title_for(&self, user_text: &str) -> String {
        match &self.summarizer {
            Some(s) => summarize_title(s, user_text).await,
            None => derive_title(user_text),
        }
    }
}

fn new_message(
    exchange: &Exchange,
    user_id: &UserId,
    role: Role,
    content: &str,
    created_at: i64,
) -> StoredMessage {
    StoredMessage {
        id: MessageId::generate(),
        session_id: exchange.session_id.clone(),
        user_id: Some(user_id.clone()),
        role,
        content: content.to_string(),
        created_at,
    }
}

/// First few words, each capitalised, bounded in length.
pub fn derive_title(text: &str) -> String {
    let words: Vec<String> = text
        .split_whitespace()
        .take(TITLE_MAX_WORDS)
        .map(capitalize)
        .collect();
    let joined = words.join(" ");
    let title = crate::str_utils::prefix_chars(&joined, TITLE_MAX_CHARS)
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());

    if title.is_empty() {
        UNTITLED_SESSION.to_string()
    } else {
        title.to_string()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Asks the model for a title; any failure or timeout falls back to `derive_title`.
pub async fn summarize_title(summarizer: &TitleSummarizer, user_text: &str) -> String {
    let request = ModelRequest::new(
        summarizer.model_name.clone(),
        vec![
            OpenAiMessage::System {
                content: TITLE_SYSTEM_PROMPT.to_string(),
            },
            OpenAiMessage::User {
                content: OpenAiContent::String(user_text.to_string()),
            },
        ],
    )
    .with_temperature(0.2);

    let outcome = tokio::time::timeout(summarizer.step_timeout, summarizer.model.complete(request)).await;
    let raw = match outcome {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!("Title summarization failed, deriving locally: {}", e);
            return derive_title(user_text);
        }
        Err(_) => {
            tracing::warn!(
                "Title summarization timed out after {:?}, deriving locally",
                summarizer.step_timeout
            );
            return derive_title(user_text);
        }
    };

    let cleaned = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '#')
        .trim();
    if cleaned.is_empty() {
        derive_title(user_text)
    } else {
        crate::str_utils::prefix_chars(cleaned, TITLE_MAX_CHARS).to_string()
    }
}
