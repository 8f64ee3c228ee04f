//! Newline-delimited JSON for the bulk generation endpoints.
//!
//! Producer side: `NdjsonSender` writes one record per line into a response body.
//! Consumer side: `NdjsonCodec` decodes records from a byte stream that may split a record
//! anywhere; the unfinished tail stays buffered until the next read completes it.

use crate::types::{ObservedError, Result, StudyError};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{Decoder, Encoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const MAX_RECORD_BYTES: usize = 1024 * 1024;

pub struct NdjsonCodec<T> {
    lines: LinesCodec,
    _record: PhantomData<fn() -> T>,
}

impl<T> NdjsonCodec<T> {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_RECORD_BYTES),
            _record: PhantomData,
        }
    }
}

impl<T> Default for NdjsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn map_line_error(e: LinesCodecError) -> ObservedError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => StudyError::Parse(format!(
            "NDJSON record exceeds {} bytes",
            MAX_RECORD_BYTES
        ))
        .into(),
        LinesCodecError::Io(io) => StudyError::Io(io).into(),
    }
}

fn parse_record<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line).map_err(|e| {
        StudyError::Parse(format!(
            "Invalid NDJSON record ({}): {}",
            e,
            crate::str_utils::prefix_chars(line, 120)
        ))
        .into()
    })
}

impl<T: DeserializeOwned> Decoder for NdjsonCodec<T> {
    type Item = T;
    type Error = ObservedError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        loop {
            match self.lines.decode(src).map_err(map_line_error)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return parse_record(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        loop {
            match self.lines.decode_eof(src).map_err(map_line_error)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return parse_record(&line).map(Some),
                None => return Ok(None),
            }
        }
    }
}

impl<'a, T: Serialize> Encoder<&'a T> for NdjsonCodec<T> {
    type Error = ObservedError;

    fn encode(&mut self, item: &'a T, dst: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

pub fn encode_line<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    NdjsonCodec::<T>::new().encode(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes records from any byte stream, regardless of how reads split the lines.
pub fn decode_stream<T, S, E>(bytes: S) -> impl Stream<Item = Result<T>> + Unpin
where
    T: DeserializeOwned,
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Into<std::io::Error>,
{
    FramedRead::new(StreamReader::new(bytes), NdjsonCodec::<T>::new())
}

/// Reads an NDJSON response body incrementally.
pub fn read_ndjson<T: DeserializeOwned>(
    response: reqwest::Response,
) -> impl Stream<Item = Result<T>> + Unpin {
    let bytes_stream = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    decode_stream(Box::pin(bytes_stream))
}

/// Writes records into a streaming NDJSON response.
#[derive(Clone)]
pub struct NdjsonSender {
    tx: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
}

impl NdjsonSender {
    /// Returns false once the client is gone.
    pub async fn send<T: Serialize>(&self, record: &T) -> bool {
        let line = match encode_line(record) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!("Failed to encode NDJSON record: {}", e);
                return true;
            }
        };
        self.tx.send(Ok(line)).await.is_ok()
    }
}

pub fn channel(capacity: usize) -> (NdjsonSender, NdjsonBody) {
    let (tx, rx) = mpsc::channel(capacity);
    (NdjsonSender { tx }, NdjsonBody { rx })
}

pub struct NdjsonBody {
    rx: mpsc::Receiver<std::result::Result<Bytes, std::io::Error>>,
}

impl IntoResponse for NdjsonBody {
    fn into_response(self) -> Response {
        (
            [
                (axum::http::header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
                (axum::http::header::CACHE_CONTROL, "no-cache"),
            ],
            axum::body::Body::from_stream(ReceiverStream::new(self.rx)),
        )
            .into_response()
    }
}
