use tracing::{trace, warn};

use crate::models::raw_line::RawLine;

/// Longest carry-over kept while waiting for a delimiter.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;

const DELIMITER: u8 = b'\n';

/// Turns an unbounded byte stream into newline-delimited lines.
///
/// Bytes are buffered until a `\n` arrives and only complete lines are
/// decoded (lossy UTF-8), so where the stream was split into chunks never
/// changes the lines produced. Blank lines are dropped.
///
/// A line that grows past `max_line_bytes` without a delimiter is discarded
/// up to and including its delimiter.
#[derive(Debug)]
pub struct LineFramer {
    carry_over: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            carry_over: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Feed one chunk and return every line it completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RawLine> {
        let mut lines = vec![];
        let mut remaining = bytes;

        while let Some(position) = remaining.iter().position(|b| *b == DELIMITER) {
            let (head, tail) = remaining.split_at(position);
            remaining = &tail[1..];

            if self.discarding {
                trace!("Reached the end of an oversized line.");
                self.discarding = false;
                continue;
            }
            if self.carry_over.len() + head.len() > self.max_line_bytes {
                warn!(
                    "Dropping line of {} bytes. Limit is {} bytes.",
                    self.carry_over.len() + head.len(),
                    self.max_line_bytes
                );
                self.carry_over.clear();
                continue;
            }

            self.carry_over.extend_from_slice(head);
            if let Some(line) = RawLine::new(&String::from_utf8_lossy(&self.carry_over)) {
                lines.push(line);
            }
            self.carry_over.clear();
        }

        if !self.discarding {
            self.carry_over.extend_from_slice(remaining);
            if self.carry_over.len() > self.max_line_bytes {
                warn!(
                    "No delimiter within {} bytes. Discarding partial line.",
                    self.max_line_bytes
                );
                self.carry_over.clear();
                self.discarding = true;
            }
        }

        lines
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.carry_over.len()
    }

    /// Forget any partial line. Used when a new connection opens.
    pub fn reset(&mut self) {
        self.carry_over.clear();
        self.discarding = false;
    }
}
