//! Framed events for the chunked chat response.
//!
//! Every frame is one JSON object followed by `\n`, so a client can parse each line as soon
//! as it arrives. The sink owns ordering and the terminal-frame rule.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const FRAME_SEPARATOR: u8 = b'\n';

pub type BodyItem = std::result::Result<Bytes, std::io::Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Chunk,
    Title,
    PersistenceError,
    Complete,
    Error,
}

impl FrameKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameKind::Complete | FrameKind::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub content: String,
    pub complete: bool,
}

impl StreamFrame {
    fn new(kind: FrameKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            complete: kind.is_terminal(),
        }
    }

    pub fn chunk(content: impl Into<String>) -> Self {
        Self::new(FrameKind::Chunk, content)
    }

    pub fn title(content: impl Into<String>) -> Self {
        Self::new(FrameKind::Title, content)
    }

    pub fn persistence_error(content: impl Into<String>) -> Self {
        Self::new(FrameKind::PersistenceError, content)
    }

    pub fn complete(full_text: impl Into<String>) -> Self {
        Self::new(FrameKind::Complete, full_text)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FrameKind::Error, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn encode(&self) -> crate::types::Result<Bytes> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(FRAME_SEPARATOR);
        Ok(Bytes::from(buf))
    }

    pub fn decode(line: &str) -> crate::types::Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Delivered,
    /// The client went away; nothing more will be read.
    Disconnected,
    /// A terminal frame was already written.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Open,
    Terminated,
    Disconnected,
}

/// Write side of a chunked response body.
pub struct FrameSink {
    tx: mpsc::Sender<BodyItem>,
    state: SinkState,
    frames_sent: usize,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<BodyItem>) -> Self {
        Self {
            tx,
            state: SinkState::Open,
            frames_sent: 0,
        }
    }

    /// A sink plus the stream that becomes the response body.
    pub fn channel(capacity: usize) -> (Self, ReceiverStream<BodyItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), ReceiverStream::new(rx))
    }

    pub fn is_open(&self) -> bool {
        self.state == SinkState::Open
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SinkState::Terminated
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }

    pub async fn send(&mut self, frame: StreamFrame) -> SinkStatus {
        match self.state {
            SinkState::Terminated => {
                tracing::warn!(
                    "Dropping {:?} frame written after the terminal frame",
                    frame.kind
                );
                return SinkStatus::Terminated;
            }
            SinkState::Disconnected => return SinkStatus::Disconnected,
            SinkState::Open => {}
        }

        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Failed to encode {:?} frame: {}", frame.kind, e);
                return SinkStatus::Delivered;
            }
        };

        if self.tx.send(Ok(bytes)).await.is_err() {
            tracing::debug!("Client disconnected while writing {:?} frame", frame.kind);
            self.state = SinkState::Disconnected;
            return SinkStatus::Disconnected;
        }

        self.frames_sent += 1;
        if frame.is_terminal() {
            self.state = SinkState::Terminated;
        }
        SinkStatus::Delivered
    }
}
