//! Structured study material: flashcards, quizzes and mind maps.
//!
//! Flashcards and quizzes stream as NDJSON so the client can render items as they arrive.
//! A bad item is skipped (flashcards) or replaced with a templated one (quiz) instead of
//! failing the batch.

use crate::constants::{MAX_FLASHCARDS, MAX_QUIZ_QUESTIONS, MAX_SOURCE_CHARS};
use crate::json_repair::parse_model_json;
use crate::model::{ChatModel, ModelRequest};
use crate::ndjson::NdjsonSender;
use crate::specs::openai::{OpenAiContent, OpenAiMessage};
use crate::types::{Result, StudyError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_FLASHCARDS: usize = 10;
const DEFAULT_QUIZ_QUESTIONS: usize = 5;
const MAX_MINDMAP_DEPTH: usize = 4;

const FLASHCARD_PROMPT: &str = "You create study flashcards. Reply with JSON only, shaped as \
{\"flashcards\": [{\"front\": \"term or question\", \"back\": \"definition or answer\"}]}. \
Keep each side short and self-contained.";

const QUIZ_PROMPT: &str = "You write one multiple-choice quiz question at a time. Reply with \
JSON only, shaped as {\"question\": \"...\", \"options\": [\"...\", \"...\", \"...\", \"...\"], \
\"answerIndex\": 0, \"explanation\": \"...\"}. Exactly one option is correct.";

const MINDMAP_PROMPT: &str = "You organise study material into a mind map. Reply with JSON only, \
shaped as {\"title\": \"central idea\", \"children\": [{\"title\": \"...\", \"children\": [...]}]}. \
Use at most three levels below the root and short titles.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub difficulty: Option<String>,
}

/// What the material is generated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudySource {
    pub label: String,
    pub text: String,
}

impl GenerateRequest {
    pub fn source(&self) -> Result<StudySource> {
        let topic = self
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let content = self
            .content
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        match (topic, content) {
            (_, Some(content)) => Ok(StudySource {
                label: topic.unwrap_or("the provided material").to_string(),
                text: crate::str_utils::prefix_chars(content, MAX_SOURCE_CHARS).to_string(),
            }),
            (Some(topic), None) => Ok(StudySource {
                label: topic.to_string(),
                text: topic.to_string(),
            }),
            (None, None) => {
                Err(StudyError::Validation("Provide a topic or some content".to_string()).into())
            }
        }
    }

    fn count_or(&self, default: usize, max: usize) -> usize {
        self.count.unwrap_or(default).clamp(1, max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub answer_index: Option<usize>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MindmapNode {
    pub title: String,
    #[serde(default)]
    pub children: Vec<MindmapNode>,
}

/// One line of a flashcard or quiz stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Card {
        index: usize,
        front: String,
        back: String,
    },
    Question {
        index: usize,
        question: QuizQuestion,
        fallback: bool,
    },
    Done {
        count: usize,
    },
    Error {
        message: String,
    },
}

/// Pulls individually valid cards out of whatever JSON the model produced.
pub fn collect_flashcards(value: &Value, limit: usize) -> Vec<Flashcard> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match ["flashcards", "cards"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
        {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    let field = |item: &Value, keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|k| item.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    items
        .iter()
        .filter_map(|item| {
            let front = field(item, &["front", "question", "term"]);
            let back = field(item, &["back", "answer", "definition"]);
            match (front, back) {
                (Some(front), Some(back)) => Some(Flashcard { front, back }),
                _ => {
                    tracing::debug!("Skipping malformed flashcard: {}", item);
                    None
                }
            }
        })
        .take(limit)
        .collect()
}

/// Checks a generated question; `None` means it should be replaced.
pub fn validate_question(mut q: QuizQuestion) -> Option<QuizQuestion> {
    q.question = q.question.trim().to_string();
    q.options = q
        .options
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    if q.question.is_empty() || q.options.len() < 2 {
        return None;
    }
    match q.answer_index {
        Some(i) if i < q.options.len() => Some(q),
        _ => None,
    }
}

pub fn fallback_question(index: usize, source: &StudySource) -> QuizQuestion {
    QuizQuestion {
        question: format!(
            "Question {}: In your own words, explain one key idea about {}.",
            index + 1,
            source.label
        ),
        options: Vec::new(),
        answer_index: None,
        explanation: Some(
            "Open review question. Compare your answer with your notes.".to_string(),
        ),
    }
}

/// Trims titles, drops empty branches and caps the depth.
pub fn normalize_mindmap(node: MindmapNode, depth: usize) -> Option<MindmapNode> {
    let title = node.title.trim().to_string();
    if title.is_empty() {
        return None;
    }
    let children = if depth >= MAX_MINDMAP_DEPTH {
        Vec::new()
    } else {
        node.children
            .into_iter()
            .filter_map(|c| normalize_mindmap(c, depth + 1))
            .collect()
    };
    Some(MindmapNode { title, children })
}

#[derive(Clone)]
pub struct Generator {
    model: Arc<dyn ChatModel>,
    model_name: String,
    step_timeout: Duration,
}

impl Generator {
    pub fn new(model: Arc<dyn ChatModel>, model_name: impl Into<String>, step_timeout: Duration) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            step_timeout,
        }
    }

    async fn complete_json(&self, system: &str, user: String) -> Result<String> {
        let request = ModelRequest::new(
            self.model_name.clone(),
            vec![
                OpenAiMessage::System {
                    content: system.to_string(),
                },
                OpenAiMessage::User {
                    content: OpenAiContent::String(user),
                },
            ],
        )
        .with_temperature(0.4)
        .with_json_mode();

        match tokio::time::timeout(self.step_timeout, self.model.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(StudyError::Timeout(format!(
                "Model step exceeded {:?}",
                self.step_timeout
            ))
            .into()),
        }
    }

    pub async fn stream_flashcards(&self, req: GenerateRequest, source: StudySource, out: NdjsonSender) {
        let count = req.count_or(DEFAULT_FLASHCARDS, MAX_FLASHCARDS);
        let prompt = format!(
            "Create {} flashcards about {}.\n\nMaterial:\n{}",
            count, source.label, source.text
        );

        let cards = match self.complete_json(FLASHCARD_PROMPT, prompt).await {
            Ok(reply) => parse_model_json::<Value>(&reply).map(|v| collect_flashcards(&v, count)),
            Err(e) => Err(e),
        };

        let cards = match cards {
            Ok(cards) => cards,
            Err(e) => {
                tracing::error!("Flashcard generation failed: {}", e);
                out.send(&GenerationEvent::Error {
                    message: "Could not generate flashcards. Please try again.".to_string(),
                })
                .await;
                return;
            }
        };

        tracing::info!("Generated {} of {} requested flashcards", cards.len(), count);
        let total = cards.len();
        for (index, card) in cards.into_iter().enumerate() {
            let event = GenerationEvent::Card {
                index,
                front: card.front,
                back: card.back,
            };
            if !out.send(&event).await {
                tracing::debug!("Flashcard client disconnected at card {}", index);
                return;
            }
        }
        out.send(&GenerationEvent::Done { count: total }).await;
    }

    pub async fn stream_quiz(&self, req: GenerateRequest, source: StudySource, out: NdjsonSender) {
        let count = req.count_or(DEFAULT_QUIZ_QUESTIONS, MAX_QUIZ_QUESTIONS);
        let difficulty = req.difficulty.as_deref().unwrap_or("medium");
        let mut asked: Vec<String> = Vec::new();

        for index in 0..count {
            let previous = if asked.is_empty() {
                String::new()
            } else {
                format!("\n\nDo not repeat these questions:\n- {}", asked.join("\n- "))
            };
            let prompt = format!(
                "Write question {} of {} ({} difficulty) about {}.{}\n\nMaterial:\n{}",
                index + 1,
                count,
                difficulty,
                source.label,
                previous,
                source.text
            );

            let generated = match self.complete_json(QUIZ_PROMPT, prompt).await {
                Ok(reply) => parse_model_json::<QuizQuestion>(&reply).map(validate_question),
                Err(e) => Err(e),
            };

            let (question, fallback) = match generated {
                Ok(Some(q)) => (q, false),
                Ok(None) => {
                    tracing::warn!("Quiz question {} was malformed, using fallback", index + 1);
                    (fallback_question(index, &source), true)
                }
                Err(e) => {
                    tracing::warn!("Quiz question {} failed ({}), using fallback", index + 1, e);
                    (fallback_question(index, &source), true)
                }
            };

            asked.push(question.question.clone());
            let event = GenerationEvent::Question {
                index,
                question,
                fallback,
            };
            if !out.send(&event).await {
                tracing::debug!("Quiz client disconnected at question {}", index);
                return;
            }
        }
        out.send(&GenerationEvent::Done { count }).await;
    }

    pub async fn mindmap(&self, source: &StudySource) -> Result<MindmapNode> {
        let prompt = format!(
            "Build a mind map about {}.\n\nMaterial:\n{}",
            source.label, source.text
        );
        let reply = self.complete_json(MINDMAP_PROMPT, prompt).await?;
        let root: MindmapNode = parse_model_json(&reply)?;
        match normalize_mindmap(root, 0) {
            Some(tree) => Ok(tree),
            None => Err(StudyError::Parse("Mind map has no title".to_string()).into()),
        }
    }
}
