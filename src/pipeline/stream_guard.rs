//! Degeneration watchdog for token streams.
//!
//! Small local models occasionally collapse into repetition mid-stream.
//! The guard watches tokens through a ring buffer and aborts the stream on
//! consecutive-identical runs, repeating multi-token sequences, or a hard
//! token cap. Composable: any streaming consumer feeds its tokens through
//! `observe`.

use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone)]
pub struct StreamGuardConfig {
    /// Same token repeated N times consecutively → abort.
    pub max_consecutive_identical: usize,
    /// Length of token sequence to check for repetition.
    pub sequence_length: usize,
    /// Same K-token sequence repeated M times → abort.
    pub max_sequence_repeats: usize,
    /// Hard cap on total tokens.
    pub max_total_tokens: usize,
    /// Ring buffer capacity for pattern detection.
    pub ring_buffer_size: usize,
}

impl Default for StreamGuardConfig {
    fn default() -> Self {
        Self {
            max_consecutive_identical: 20,
            sequence_length: 10,
            max_sequence_repeats: 5,
            max_total_tokens: 8192,
            ring_buffer_size: 200,
        }
    }
}

/// Why the stream was aborted.
#[derive(Debug, Clone)]
pub enum DegenerationPattern {
    /// Same token repeated consecutively (e.g., "\n" × 25).
    TokenRepeat { token: String, count: usize },
    /// Same multi-token sequence repeated back to back.
    SequenceRepeat { repeat_count: usize },
    /// Hard token limit exceeded.
    TokenLimitExceeded { total_tokens: usize },
}

impl fmt::Display for DegenerationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenRepeat { token, count } => {
                write!(f, "token_repeat({:?} × {count})", truncate(token, 50))
            }
            Self::SequenceRepeat { repeat_count } => {
                write!(f, "sequence_repeat(× {repeat_count})")
            }
            Self::TokenLimitExceeded { total_tokens } => {
                write!(f, "token_limit_exceeded({total_tokens})")
            }
        }
    }
}

pub struct StreamGuard {
    config: StreamGuardConfig,
    ring: VecDeque<String>,
    total_tokens: usize,
    consecutive_identical: usize,
    last_token: Option<String>,
}

impl StreamGuard {
    pub fn new(config: StreamGuardConfig) -> Self {
        Self {
            ring: VecDeque::with_capacity(config.ring_buffer_size),
            config,
            total_tokens: 0,
            consecutive_identical: 0,
            last_token: None,
        }
    }

    /// Feed one token. `Some(pattern)` means the stream is degenerate and
    /// the caller must abort.
    pub fn observe(&mut self, token: &str) -> Option<DegenerationPattern> {
        self.total_tokens += 1;
        if self.total_tokens > self.config.max_total_tokens {
            return Some(DegenerationPattern::TokenLimitExceeded {
                total_tokens: self.total_tokens,
            });
        }

        if self.last_token.as_deref() == Some(token) {
            self.consecutive_identical += 1;
            if self.consecutive_identical >= self.config.max_consecutive_identical {
                return Some(DegenerationPattern::TokenRepeat {
                    token: token.to_string(),
                    count: self.consecutive_identical,
                });
            }
        } else {
            self.consecutive_identical = 1;
            self.last_token = Some(token.to_string());
        }

        if self.ring.len() == self.config.ring_buffer_size {
            self.ring.pop_front();
        }
        self.ring.push_back(token.to_string());

        self.detect_sequence_repeat()
    }

    /// Check whether the tail of the ring is the same K-token sequence
    /// repeated M times back to back.
    fn detect_sequence_repeat(&self) -> Option<DegenerationPattern> {
        let k = self.config.sequence_length;
        let m = self.config.max_sequence_repeats;
        if k == 0 || self.ring.len() < k * m {
            return None;
        }

        let tail: Vec<&String> = self.ring.iter().rev().take(k * m).collect();
        let reference = &tail[0..k];
        for repeat in 1..m {
            let window = &tail[repeat * k..(repeat + 1) * k];
            if window != reference {
                return None;
            }
        }

        Some(DegenerationPattern::SequenceRepeat { repeat_count: m })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
