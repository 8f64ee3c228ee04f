use crate::constants::MAX_FILE_CONTEXT_CHARS;
use crate::intent::ImageAttachment;
use crate::specs::openai::{OpenAiContent, OpenAiContentPart, OpenAiImageUrl, OpenAiMessage};
use crate::types::{ChatTurn, Role};
use base64::Engine;

pub struct PromptParts<'a> {
    pub system_rules: &'a str,
    pub file_context: Option<&'a str>,
    pub history: &'a [ChatTurn],
    pub max_history: usize,
    pub user_text: &'a str,
    pub image: Option<&'a ImageAttachment>,
}

/// Assembles the ordered turns sent to the model: system, recent history, current user turn.
pub fn build_prompt(parts: &PromptParts<'_>) -> Vec<OpenAiMessage> {
    let mut messages = Vec::with_capacity(parts.max_history + 2);
    messages.push(OpenAiMessage::System {
        content: system_instructions(parts.system_rules, parts.file_context),
    });

    let mut history = parts.history;
    // Guest clients sometimes replay the pending message as the last transcript entry.
    if let Some(last) = history.last() {
        if last.role == Role::User && last.content.trim() == parts.user_text.trim() {
            history = &history[..history.len() - 1];
        }
    }
    let start = history.len().saturating_sub(parts.max_history);
    for turn in &history[start..] {
        messages.push(match turn.role {
            Role::User => OpenAiMessage::User {
                content: OpenAiContent::String(turn.content.clone()),
            },
            Role::Assistant => OpenAiMessage::Assistant {
                content: turn.content.clone(),
            },
        });
    }

    let content = match parts.image {
        Some(image) => OpenAiContent::Parts(vec![
            OpenAiContentPart::Text {
                text: parts.user_text.to_string(),
            },
            OpenAiContentPart::ImageUrl {
                image_url: OpenAiImageUrl {
                    url: image_data_url(image),
                },
            },
        ]),
        None => OpenAiContent::String(parts.user_text.to_string()),
    };
    messages.push(OpenAiMessage::User { content });
    messages
}

fn system_instructions(rules: &str, file_context: Option<&str>) -> String {
    match file_context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(context) => {
            let excerpt = crate::str_utils::prefix_chars(context, MAX_FILE_CONTEXT_CHARS);
            format!(
                "{}\n\nThe student attached a document. Its extracted text follows between the markers.\n<document>\n{}\n</document>",
                rules, excerpt
            )
        }
        None => rules.to_string(),
    }
}

pub fn image_data_url(image: &ImageAttachment) -> String {
    format!(
        "data:{};base64,{}",
        image.mime,
        base64::engine::general_purpose::STANDARD.encode(&image.data)
    )
}

/// Images need the vision-capable model; everything else goes to the chat model.
pub fn select_model<'a>(chat_model: &'a str, vision_model: &'a str, has_image: bool) -> &'a str {
    if has_image {
        vision_model
    } else {
        chat_model
    }
}
