use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::debug;

pub const DEFAULT_CHUNK_MAX_TOKENS: usize = 300;
pub const DEFAULT_CHUNK_OVERLAP_TOKENS: usize = 20;
pub const DEFAULT_SEPARATOR: &str = "\n";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub separator: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_CHUNK_MAX_TOKENS,
            overlap_tokens: DEFAULT_CHUNK_OVERLAP_TOKENS,
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_tokens == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_tokens must be greater than zero".to_string(),
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_tokens ({}) must be smaller than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        if self.separator.is_empty() {
            return Err(IngestError::InvalidChunkConfig(
                "separator must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Measures text length in tokens of a fixed tokenizer.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// The `cl100k_base` byte-pair encoding.
#[derive(Clone)]
pub struct Cl100kTokenizer {
    bpe: Arc<CoreBPE>,
}

impl Cl100kTokenizer {
    pub fn new() -> Result<Self, IngestError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|error| IngestError::Tokenizer(error.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl std::fmt::Debug for Cl100kTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cl100kTokenizer")
    }
}

impl TokenCounter for Cl100kTokenizer {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

/// Splits text into overlapping chunks bounded by a token budget.
///
/// Text is cut at the configured separator first. Pieces are then packed
/// greedily; when a chunk fills up, its trailing pieces that fit within the
/// overlap budget are carried into the next chunk. A single piece over the
/// budget is cut again on whitespace, and whatever still does not fit is cut
/// by token count. Output depends only on the input text, the config and the
/// tokenizer.
pub struct TextChunker<T = Cl100kTokenizer> {
    config: ChunkingConfig,
    tokenizer: T,
}

impl TextChunker<Cl100kTokenizer> {
    pub fn cl100k(config: ChunkingConfig) -> Result<Self, IngestError> {
        Self::new(config, Cl100kTokenizer::new()?)
    }
}

impl<T: TokenCounter> TextChunker<T> {
    pub fn new(config: ChunkingConfig, tokenizer: T) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config, tokenizer })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn token_count(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let separator = self.config.separator.as_str();
        let mut pieces = Vec::new();
        for piece in text.split(separator).filter(|piece| !piece.trim().is_empty()) {
            let tokens = self.tokenizer.count(piece);
            if tokens > self.config.max_tokens {
                pieces.extend(self.split_oversized(piece));
            } else {
                pieces.push((piece.to_string(), tokens));
            }
        }

        let separator_tokens = self.tokenizer.count(separator);
        merge_pieces(
            &pieces,
            separator,
            separator_tokens,
            self.config.max_tokens,
            self.config.overlap_tokens,
        )
    }

    /// Cuts a piece over the budget on whitespace, then cuts any part that is
    /// still over the budget by token count.
    fn split_oversized(&self, piece: &str) -> Vec<(String, usize)> {
        let max_tokens = self.config.max_tokens;
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for word in piece.split_whitespace() {
            let tokens = self.tokenizer.count(word);
            if tokens > max_tokens {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                    current_tokens = 0;
                }
                parts.extend(self.cut_by_tokens(word));
                continue;
            }
            if !current.is_empty() && current_tokens + tokens + 1 > max_tokens {
                parts.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            if !current.is_empty() {
                current.push(' ');
                current_tokens += 1;
            }
            current.push_str(word);
            current_tokens += tokens;
        }
        if !current.is_empty() {
            parts.push(current);
        }

        let mut sized = Vec::with_capacity(parts.len());
        for part in parts {
            let tokens = self.tokenizer.count(&part);
            if tokens > max_tokens {
                for cut in self.cut_by_tokens(&part) {
                    let tokens = self.tokenizer.count(&cut);
                    sized.push((cut, tokens));
                }
            } else {
                sized.push((part, tokens));
            }
        }
        sized
    }

    /// Splits `text` on char boundaries into the longest runs that each fit
    /// in `max_tokens`. A single char over the budget is kept on its own.
    fn cut_by_tokens(&self, text: &str) -> Vec<String> {
        let max_tokens = self.config.max_tokens;
        let bounds = text
            .char_indices()
            .map(|(offset, _)| offset)
            .chain(std::iter::once(text.len()))
            .collect::<Vec<_>>();
        let chars = bounds.len() - 1;
        let fits = |from: usize, to: usize| {
            self.tokenizer.count(&text[bounds[from]..bounds[to]]) <= max_tokens
        };

        let mut cuts = Vec::new();
        let mut start = 0usize;
        while start < chars {
            // `good` always fits (or is one char); `bad` never does.
            let mut good = start + 1;
            let mut bad = None;
            let mut span = 1usize;
            while good < chars {
                let candidate = (start + span * 2).min(chars);
                if fits(start, candidate) {
                    good = candidate;
                    span *= 2;
                } else {
                    bad = Some(candidate);
                    break;
                }
            }
            if let Some(mut bad) = bad {
                while bad - good > 1 {
                    let middle = good + (bad - good) / 2;
                    if fits(start, middle) {
                        good = middle;
                    } else {
                        bad = middle;
                    }
                }
            }

            cuts.push(text[bounds[start]..bounds[good]].to_string());
            start = good;
        }

        debug!(
            pieces = cuts.len(),
            max_tokens,
            "cut segment without usable whitespace by token count"
        );
        cuts
    }
}

fn merge_pieces(
    pieces: &[(String, usize)],
    separator: &str,
    separator_tokens: usize,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut window: Vec<&(String, usize)> = Vec::new();
    let mut total = 0usize;

    let joined_len = |window: &[&(String, usize)]| -> usize {
        let tokens = window.iter().map(|(_, tokens)| *tokens).sum::<usize>();
        tokens + separator_tokens * window.len().saturating_sub(1)
    };

    for piece in pieces {
        let extra = if window.is_empty() { 0 } else { separator_tokens };
        if total + piece.1 + extra > max_tokens && !window.is_empty() {
            push_joined(&mut chunks, &window, separator);

            while !window.is_empty()
                && (total > overlap_tokens
                    || total + piece.1 + separator_tokens > max_tokens)
            {
                window.remove(0);
                total = joined_len(&window);
            }
        }

        window.push(piece);
        total = joined_len(&window);
    }

    push_joined(&mut chunks, &window, separator);
    chunks
}

fn push_joined(chunks: &mut Vec<String>, window: &[&(String, usize)], separator: &str) {
    let joined = window
        .iter()
        .map(|(text, _)| text.as_str())
        .collect::<Vec<_>>()
        .join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}
