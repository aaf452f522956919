//! Sentence-level chunking for streamed responses.
//!
//! Splits the token stream into speakable pieces whose length lies between
//! the configured character bounds, preferring sentence boundaries so
//! synthesis prosody stays natural. Chunks carry a dense sequence number
//! starting at 0 for each response; the ordered queue reassembles on it.

/// Characters treated as sentence boundaries.
const BOUNDARY_CHARS: [char; 5] = ['.', '!', '?', '\n', '\u{2014}'];

/// One sentence-sized piece of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Dense sequence number, from 0 per response.
    pub seq: u64,
    pub text: String,
}

/// Streaming sentence chunker.
pub struct SentenceChunker {
    min_chars: usize,
    max_chars: usize,
    buffer: Vec<char>,
    next_seq: u64,
}

impl SentenceChunker {
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        Self {
            min_chars,
            max_chars,
            buffer: Vec::new(),
            next_seq: 0,
        }
    }

    /// Feed a streamed delta; returns every chunk that became complete.
    pub fn push(&mut self, delta: &str) -> Vec<TextChunk> {
        self.buffer.extend(delta.chars());

        let mut out = Vec::new();
        while let Some(split) = self.find_split() {
            out.push(self.take_chunk(split));
        }
        out
    }

    /// Emit whatever remains as a final chunk.
    pub fn flush(&mut self) -> Option<TextChunk> {
        let text: String = self.buffer.drain(..).collect();
        let text = text.trim().to_string();
        if text.is_empty() {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(TextChunk { seq, text })
    }

    /// Sequence number the next chunk will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Find the split index (exclusive) for the next chunk, if the buffer
    /// holds enough text to commit to one.
    fn find_split(&self) -> Option<usize> {
        if self.buffer.len() < self.min_chars {
            return None;
        }

        // Sentence boundary at or after min, strictly before max.
        let window_end = self.buffer.len().min(self.max_chars);
        for i in (self.min_chars - 1)..window_end {
            if BOUNDARY_CHARS.contains(&self.buffer[i]) {
                return Some(i + 1);
            }
        }

        if self.buffer.len() < self.max_chars {
            return None;
        }

        // No boundary in range: last whitespace before max, else hard cut.
        let ws = (0..self.max_chars).rev().find(|&i| self.buffer[i].is_whitespace());
        Some(match ws {
            Some(i) if i > 0 => i + 1,
            _ => self.max_chars,
        })
    }

    fn take_chunk(&mut self, split: usize) -> TextChunk {
        let text: String = self.buffer.drain(..split).collect();
        // Leading whitespace belongs to no sentence.
        while self.buffer.first().is_some_and(|c| c.is_whitespace()) {
            self.buffer.remove(0);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        TextChunk {
            seq,
            text: text.trim_end().to_string(),
        }
    }
}
