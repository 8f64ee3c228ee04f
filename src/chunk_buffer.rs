//! Word-aligned buffering of model output.
//!
//! Model fragments arrive at arbitrary boundaries ("Expl", "ain osm", "osis "). The buffer
//! releases only whole words (and the whitespace runs between them, byte for byte) and keeps
//! a trailing fragment that may still be growing until the next push or the final flush.

/// Splits text into alternating runs of whitespace and non-whitespace.
pub fn split_preserving_whitespace(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut current_is_ws: Option<bool> = None;

    for (idx, ch) in text.char_indices() {
        let is_ws = ch.is_whitespace();
        match current_is_ws {
            Some(prev) if prev != is_ws => {
                tokens.push(&text[start..idx]);
                start = idx;
            }
            _ => {}
        }
        current_is_ws = Some(is_ws);
    }

    if start < text.len() {
        tokens.push(&text[start..]);
    }
    tokens
}

#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    pending: String,
    batch_size: usize,
}

impl ChunkBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            pending: String::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// The possibly-incomplete word held back from the last push.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Appends a fragment and returns the batches that are ready for delivery.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        // Blank fragments carry intentional spacing; forward them right away.
        if fragment.trim().is_empty() {
            let mut out = std::mem::take(&mut self.pending);
            out.push_str(fragment);
            if out.is_empty() {
                return Vec::new();
            }
            return vec![out];
        }

        self.pending.push_str(fragment);

        let ends_at_boundary = self
            .pending
            .chars()
            .next_back()
            .map(char::is_whitespace)
            .unwrap_or(false);

        let buffered = std::mem::take(&mut self.pending);
        let mut tokens = split_preserving_whitespace(&buffered);

        if !ends_at_boundary {
            if let Some(tail) = tokens.pop() {
                self.pending = tail.to_string();
            }
        }

        tokens
            .chunks(self.batch_size)
            .map(|group| group.concat())
            .collect()
    }

    /// Releases whatever is still held; called once the upstream sequence has ended.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}
