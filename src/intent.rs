//! Request intent: the one place where the chat request's optional shapes are resolved.
//!
//! JSON and multipart bodies, guest and authenticated callers, sends and edits all collapse
//! into a single `RequestIntent` value that the rest of the pipeline dispatches on.

use crate::constants::{IMAGE_MIMES, MAX_UPLOAD_BYTES, PDF_MIME};
use crate::types::{ChatTurn, GuestMessage, MessageId, ObservedError, Result, SessionId, StudyError, UserId};
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use bytes::Bytes;
use serde::Deserialize;

/// Header carrying the caller identity, set by the OAuth gateway in front of the service.
pub const AUTH_USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Guest { history: Vec<ChatTurn> },
    Authenticated { user_id: UserId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Send,
    Edit { message_id: MessageId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfAttachment {
    pub file_name: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime: String,
    pub file_name: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    None,
    Pdf(PdfAttachment),
    Image(ImageAttachment),
}

impl Attachment {
    pub fn image(&self) -> Option<&ImageAttachment> {
        match self {
            Attachment::Image(img) => Some(img),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Attachment::None => "none",
            Attachment::Pdf(_) => "pdf",
            Attachment::Image(_) => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIntent {
    pub session_id: SessionId,
    pub message: String,
    pub mode: Mode,
    pub operation: Operation,
    pub attachment: Attachment,
}

impl RequestIntent {
    pub fn is_guest(&self) -> bool {
        matches!(self.mode, Mode::Guest { .. })
    }
}

/// Guest transcripts arrive as a JSON array, or as a JSON-encoded string inside multipart forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GuestMessagesField {
    List(Vec<GuestMessage>),
    Encoded(String),
}

impl GuestMessagesField {
    fn into_turns(self) -> Result<Vec<ChatTurn>> {
        let list = match self {
            GuestMessagesField::List(list) => list,
            GuestMessagesField::Encoded(raw) => {
                serde_json::from_str::<Vec<GuestMessage>>(&raw).map_err(|e| {
                    StudyError::Validation(format!("guestMessages is not a valid transcript: {}", e))
                })?
            }
        };
        Ok(list.into_iter().map(ChatTurn::from).collect())
    }
}

/// Wire shape of the chat request before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_guest_mode: bool,
    #[serde(default)]
    pub guest_messages: Option<GuestMessagesField>,
    #[serde(default)]
    pub is_edit: bool,
    #[serde(default)]
    pub edit_message_id: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RequestIntent {
    pub fn from_raw(
        raw: RawChatRequest,
        attachment: Attachment,
        authenticated_user: Option<&str>,
    ) -> Result<Self> {
        // Blank check only; indentation (pasted code) is kept as sent.
        let message = match raw.message.filter(|m| !m.trim().is_empty()) {
            Some(m) => m,
            None => return Err(StudyError::Validation("Message is required".to_string()).into()),
        };
        let session_id = match non_empty(raw.session_id) {
            Some(s) => SessionId(s),
            None => {
                return Err(StudyError::Validation("Session ID is required".to_string()).into())
            }
        };

        let mode = if raw.is_guest_mode {
            let history = match raw.guest_messages {
                Some(field) => field.into_turns()?,
                None => {
                    return Err(StudyError::Validation(
                        "guestMessages is required in guest mode".to_string(),
                    )
                    .into())
                }
            };
            Mode::Guest { history }
        } else {
            match authenticated_user.map(str::trim).filter(|u| !u.is_empty()) {
                Some(user) => Mode::Authenticated {
                    user_id: UserId(user.to_string()),
                },
                None => {
                    return Err(StudyError::Unauthorized(
                        "Sign in or use guest mode to chat".to_string(),
                    )
                    .into())
                }
            }
        };

        let operation = if raw.is_edit {
            match non_empty(raw.edit_message_id) {
                Some(id) => Operation::Edit {
                    message_id: MessageId(id),
                },
                None => {
                    return Err(StudyError::Validation(
                        "editMessageId is required when isEdit is set".to_string(),
                    )
                    .into())
                }
            }
        } else {
            Operation::Send
        };

        Ok(Self {
            session_id,
            message,
            mode,
            operation,
            attachment,
        })
    }
}

/// Checks size and type of an uploaded file.
pub fn classify_attachment(file_name: &str, content_type: &str, data: Bytes) -> Result<Attachment> {
    if data.len() > MAX_UPLOAD_BYTES {
        return Err(StudyError::PayloadTooLarge(format!(
            "File too large: {} bytes exceeds maximum of {} bytes",
            data.len(),
            MAX_UPLOAD_BYTES
        ))
        .into());
    }
    if data.is_empty() {
        return Err(StudyError::Validation("Uploaded file is empty".to_string()).into());
    }

    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let lower_name = file_name.to_ascii_lowercase();

    if mime == PDF_MIME || (mime == "application/octet-stream" && lower_name.ends_with(".pdf")) {
        return Ok(Attachment::Pdf(PdfAttachment {
            file_name: file_name.to_string(),
            data,
        }));
    }
    if IMAGE_MIMES.contains(&mime.as_str()) {
        let mime = if mime == "image/jpg" {
            "image/jpeg".to_string()
        } else {
            mime
        };
        return Ok(Attachment::Image(ImageAttachment {
            mime,
            file_name: file_name.to_string(),
            data,
        }));
    }

    Err(StudyError::UnsupportedMedia(format!(
        "Unsupported file type: {}. Attach a PDF or an image (PNG, JPEG, WEBP, GIF).",
        if mime.is_empty() { "unknown" } else { mime.as_str() }
    ))
    .into())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Reads the multipart form, enforcing the upload limit while the file streams in.
pub async fn read_multipart(mut multipart: Multipart) -> Result<(RawChatRequest, Attachment)> {
    let mut raw = RawChatRequest::default();
    let mut attachment = Attachment::None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| StudyError::Validation(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();

            let mut data: Vec<u8> = Vec::new();
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| StudyError::Validation(format!("Failed to read file chunk: {}", e)))?
            {
                data.extend_from_slice(&chunk);
                if data.len() > MAX_UPLOAD_BYTES {
                    return Err(StudyError::PayloadTooLarge(format!(
                        "File too large: exceeds maximum of {} bytes",
                        MAX_UPLOAD_BYTES
                    ))
                    .into());
                }
            }
            tracing::debug!(
                "Received attachment {} ({}, {} bytes)",
                file_name,
                content_type,
                data.len()
            );
            attachment = classify_attachment(&file_name, &content_type, Bytes::from(data))?;
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| StudyError::Validation(format!("Failed to read field {}: {}", name, e)))?;
        match name.as_str() {
            "message" => raw.message = Some(value),
            "sessionId" => raw.session_id = Some(value),
            "isGuestMode" => raw.is_guest_mode = parse_flag(&value),
            "guestMessages" => raw.guest_messages = Some(GuestMessagesField::Encoded(value)),
            "isEdit" => raw.is_edit = parse_flag(&value),
            "editMessageId" => raw.edit_message_id = Some(value),
            other => tracing::debug!("Ignoring unknown form field: {}", other),
        }
    }

    Ok((raw, attachment))
}

#[axum::async_trait]
impl<S> FromRequest<S> for RequestIntent
where
    S: Send + Sync,
{
    type Rejection = ObservedError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let user = req
            .headers()
            .get(AUTH_USER_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|ct| ct.starts_with("multipart/form-data"))
            .unwrap_or(false);

        let (raw, attachment) = if is_multipart {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| StudyError::Validation(format!("Invalid multipart body: {}", e)))?;
            read_multipart(multipart).await?
        } else {
            let axum::Json(raw) = axum::Json::<RawChatRequest>::from_request(req, state)
                .await
                .map_err(|e| StudyError::Validation(format!("Invalid JSON body: {}", e)))?;
            (raw, Attachment::None)
        };

        RequestIntent::from_raw(raw, attachment, user.as_deref())
    }
}

/// Pulls the text out of a PDF attachment.
pub async fn extract_pdf_text(pdf: &PdfAttachment) -> Result<String> {
    let data = pdf.data.clone();
    let file_name = pdf.file_name.clone();
    let extracted = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&data))
        .await
        .map_err(|e| StudyError::internal(format!("PDF extraction task failed: {}", e)))?;

    match extracted {
        Ok(text) => {
            tracing::debug!("Extracted {} chars from {}", text.len(), file_name);
            Ok(text)
        }
        Err(e) => Err(StudyError::Validation(format!(
            "Could not read text from {}: {}",
            file_name, e
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(message: &str, session: &str) -> RawChatRequest {
        RawChatRequest {
            message: Some(message.to_string()),
            session_id: Some(session.to_string()),
            ..Default::default()
        }
    }

    fn expect_err(result: Result<RequestIntent>) -> StudyError {
        match result {
            Ok(intent) => panic!("Expected error, got {:?}", intent),
            Err(e) => e.inner,
        }
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let err = expect_err(RequestIntent::from_raw(raw("  ", "s1"), Attachment::None, Some("u1")));
        assert!(matches!(err, StudyError::Validation(_)));
        let err = expect_err(RequestIntent::from_raw(raw("Hi", ""), Attachment::None, Some("u1")));
        assert!(matches!(err, StudyError::Validation(_)));
    }

    #[test]
    fn test_message_text_is_kept_verbatim() {
        let text = "    fn main() {\n        println!(\"hi\");\n    }\n";
        let intent = match RequestIntent::from_raw(raw(text, " s1 "), Attachment::None, Some("u1")) {
            Ok(i) => i,
            Err(e) => panic!("Expected intent, got {:?}", e),
        };
        assert_eq!(intent.message, text);
        assert_eq!(intent.session_id, SessionId("s1".into()));
    }

    #[test]
    fn test_authenticated_send() {
        let intent = match RequestIntent::from_raw(raw("Explain osmosis", "s1"), Attachment::None, Some("u1")) {
            Ok(i) => i,
            Err(e) => panic!("Expected intent, got {:?}", e),
        };
        assert_eq!(intent.mode, Mode::Authenticated { user_id: UserId("u1".into()) });
        assert_eq!(intent.operation, Operation::Send);
        assert!(!intent.is_guest());

        let err = expect_err(RequestIntent::from_raw(raw("Hi", "s1"), Attachment::None, None));
        assert!(matches!(err, StudyError::Unauthorized(_)));
    }

    #[test]
    fn test_guest_transcript_forms() {
        let body = r#"{"message":"Next?","sessionId":"g1","isGuestMode":true,
            "guestMessages":[{"role":"user","content":"Hi"},{"role":"ai","content":"Hello!","id":"x"}]}"#;
        let parsed: RawChatRequest = match serde_json::from_str(body) {
            Ok(r) => r,
            Err(e) => panic!("parse failed: {:?}", e),
        };
        let intent = match RequestIntent::from_raw(parsed, Attachment::None, None) {
            Ok(i) => i,
            Err(e) => panic!("Expected intent, got {:?}", e),
        };
        match intent.mode {
            Mode::Guest { history } => {
                assert_eq!(history.len(), 2);
                assert_eq!(history[1].role, crate::types::Role::Assistant);
            }
            other => panic!("Expected guest mode, got {:?}", other),
        }

        let mut encoded = raw("Next?", "g1");
        encoded.is_guest_mode = true;
        encoded.guest_messages = Some(GuestMessagesField::Encoded(
            r#"[{"role":"user","content":"Hi"}]"#.to_string(),
        ));
        assert!(RequestIntent::from_raw(encoded, Attachment::None, None).is_ok());

        let mut missing = raw("Next?", "g1");
        missing.is_guest_mode = true;
        let err = expect_err(RequestIntent::from_raw(missing, Attachment::None, None));
        assert!(matches!(err, StudyError::Validation(_)));
    }

    #[test]
    fn test_edit_requires_target() {
        let mut edit = raw("Fixed question", "s1");
        edit.is_edit = true;
        let err = expect_err(RequestIntent::from_raw(edit.clone(), Attachment::None, Some("u1")));
        assert!(matches!(err, StudyError::Validation(_)));

        edit.edit_message_id = Some("m7".to_string());
        let intent = match RequestIntent::from_raw(edit, Attachment::None, Some("u1")) {
            Ok(i) => i,
            Err(e) => panic!("Expected intent, got {:?}", e),
        };
        assert_eq!(intent.operation, Operation::Edit { message_id: MessageId("m7".into()) });
    }

    #[test]
    fn test_attachment_classification() {
        let pdf = classify_attachment("notes.pdf", "application/pdf", Bytes::from_static(b"%PDF-1.4"));
        assert!(matches!(pdf, Ok(Attachment::Pdf(_))));

        let by_name = classify_attachment("notes.PDF", "application/octet-stream", Bytes::from_static(b"%PDF"));
        assert!(matches!(by_name, Ok(Attachment::Pdf(_))));

        match classify_attachment("cell.jpg", "image/jpg", Bytes::from_static(b"\xff\xd8")) {
            Ok(Attachment::Image(img)) => assert_eq!(img.mime, "image/jpeg"),
            other => panic!("Expected image, got {:?}", other),
        }

        match classify_attachment("essay.docx", "application/vnd.openxmlformats", Bytes::from_static(b"PK")) {
            Err(e) => assert!(matches!(e.inner, StudyError::UnsupportedMedia(_))),
            Ok(a) => panic!("Expected rejection, got {:?}", a.kind()),
        }

        let oversized = Bytes::from(vec![0u8; 12 * 1024 * 1024]);
        match classify_attachment("big.pdf", "application/pdf", oversized) {
            Err(e) => assert!(matches!(e.inner, StudyError::PayloadTooLarge(_))),
            Ok(a) => panic!("Expected rejection, got {:?}", a.kind()),
        }
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" TRUE "));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }
}
