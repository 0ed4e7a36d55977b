//! Frame re-assembly from unaligned reads.
//!
//! The transport hands over whatever bytes arrived; a frame may be split across
//! several reads or several frames may arrive in one. `FrameAssembler` keeps the
//! tail in a `BytesMut` until the rest shows up.
//!
//! Two shapes are supported:
//! - terminated text frames (delimited and fixed-width grammars)
//! - fixed-length binary frames opened by a start byte

use super::decode::MalformedReason;
use crate::profile::FrameGrammar;
use bytes::{Bytes, BytesMut};

/// Output of one assembly step.
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    /// A complete frame, delimiters included
    Frame(Bytes),
    /// Bytes dropped without producing a frame
    Rejected(MalformedReason),
}

#[derive(Debug, Clone)]
enum Shape {
    Terminated { terminator: Vec<u8> },
    Fixed { start: u8, length: usize },
}

/// Incremental frame splitter for one grammar.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    shape: Shape,
    max_frame_len: usize,
}

impl FrameAssembler {
    pub fn for_grammar(grammar: &FrameGrammar, max_frame_len: usize) -> Self {
        let shape = match grammar {
            FrameGrammar::Delimited { terminator, .. } | FrameGrammar::FixedWidth { terminator, .. } => {
                Shape::Terminated {
                    terminator: terminator.as_bytes().to_vec(),
                }
            }
            FrameGrammar::Binary {
                start_byte, length, ..
            } => Shape::Fixed {
                start: *start_byte,
                length: *length,
            },
        };
        Self {
            buffer: BytesMut::with_capacity(max_frame_len.max(64) * 2),
            shape,
            max_frame_len: max_frame_len.max(1),
        }
    }

    /// Bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Append `data` and extract every complete frame.
    pub fn push(&mut self, data: &[u8]) -> Vec<Assembled> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            let step = match &self.shape {
                Shape::Terminated { terminator } => {
                    let terminator = terminator.clone();
                    self.next_terminated(&terminator)
                }
                Shape::Fixed { start, length } => {
                    let (start, length) = (*start, *length);
                    self.next_fixed(start, length)
                }
            };
            match step {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    fn next_terminated(&mut self, terminator: &[u8]) -> Option<Assembled> {
        loop {
            match find(&self.buffer, terminator) {
                Some(pos) => {
                    let frame = self.buffer.split_to(pos + terminator.len()).freeze();
                    if frame.len() == terminator.len() {
                        // Blank line between frames.
                        continue;
                    }
                    if frame.len() > self.max_frame_len + terminator.len() {
                        return Some(Assembled::Rejected(MalformedReason::Overflow {
                            discarded: frame.len(),
                        }));
                    }
                    return Some(Assembled::Frame(frame));
                }
                None if self.buffer.len() > self.max_frame_len + terminator.len() => {
                    // Keep a possible partial terminator at the tail.
                    let keep = terminator.len().saturating_sub(1);
                    let discarded = self.buffer.len() - keep;
                    let _ = self.buffer.split_to(discarded);
                    return Some(Assembled::Rejected(MalformedReason::Overflow { discarded }));
                }
                None => return None,
            }
        }
    }

    fn next_fixed(&mut self, start: u8, length: usize) -> Option<Assembled> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.buffer[0] != start {
            let discarded = self
                .buffer
                .iter()
                .position(|b| *b == start)
                .unwrap_or(self.buffer.len());
            let _ = self.buffer.split_to(discarded);
            return Some(Assembled::Rejected(MalformedReason::Garbage { discarded }));
        }
        if self.buffer.len() < length {
            return None;
        }
        Some(Assembled::Frame(self.buffer.split_to(length).freeze()))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
