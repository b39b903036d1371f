//! Reassembles the upstream event stream into ordered delta events.
//!
//! Network reads split the wire stream at arbitrary byte offsets. The
//! [`FrameBuffer`] keeps the unterminated tail between reads, and the
//! [`Reassembler`] turns each complete `data:` line into zero or more
//! [`DeltaEvent`]s in wire order.

use memchr::memchr;
use tracing::{debug, warn};

use crate::api::{ChatResponse, FinishReason};
use crate::core::error::ChatError;

pub const DONE_SENTINEL: &str = "[DONE]";

/// One content fragment of one upstream choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEvent {
    pub index: u32,
    pub content: String,
    pub finish_reason: Option<FinishReason>,
}

impl DeltaEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            index: 0,
            content: content.into(),
            finish_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Done,
    Failed,
}

/// Carry-over buffer for a line-oriented byte stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    /// Appends `chunk` and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    /// Returns the remaining lines, including an unterminated last one.
    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Bytes waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            push_line(&mut lines, &self.buffer[search_index..newline_index]);
            search_index = newline_index + 1;
        }

        if flush {
            push_line(&mut lines, &self.buffer[search_index..]);
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

fn push_line(lines: &mut Vec<String>, bytes: &[u8]) {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        Err(err) => warn!(len = bytes.len(), error = %err, "dropping non-UTF-8 line"),
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Per-stream state machine: `Open` until the sentinel, a clean close, a
/// provider error frame, or cancellation.
#[derive(Debug)]
pub struct Reassembler {
    buffer: FrameBuffer,
    state: StreamState,
    data_frames: usize,
    malformed_frames: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            buffer: FrameBuffer::default(),
            state: StreamState::Open,
            data_frames: 0,
            malformed_frames: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn malformed_frames(&self) -> usize {
        self.malformed_frames
    }

    /// Feeds one network read, emitting events for every complete frame.
    ///
    /// Returns `Err` once, on the transition to `Failed`. Input arriving after
    /// the stream left `Open` is ignored.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        mut emit: impl FnMut(DeltaEvent),
    ) -> Result<StreamState, ChatError> {
        if self.state != StreamState::Open {
            return Ok(self.state);
        }
        let lines = self.buffer.push(chunk);
        self.process_lines(lines, &mut emit)
    }

    /// Handles a clean upstream close: flushes a trailing unterminated line and
    /// completes the stream.
    pub fn finish(&mut self, mut emit: impl FnMut(DeltaEvent)) -> Result<StreamState, ChatError> {
        if self.state != StreamState::Open {
            return Ok(self.state);
        }
        let lines = self.buffer.finish();
        self.process_lines(lines, &mut emit)?;
        if self.state == StreamState::Open {
            self.complete()?;
        }
        Ok(self.state)
    }

    /// Stops the stream without an error; buffered bytes are discarded.
    pub fn cancel(&mut self) {
        self.buffer.clear();
        if self.state == StreamState::Open {
            self.state = StreamState::Done;
        }
    }

    /// Marks the stream failed after a read error.
    pub fn fail(&mut self) {
        self.buffer.clear();
        self.state = StreamState::Failed;
    }

    fn process_lines(
        &mut self,
        lines: Vec<String>,
        emit: &mut impl FnMut(DeltaEvent),
    ) -> Result<StreamState, ChatError> {
        for line in lines {
            let Some(payload) = extract_data_payload(&line) else {
                continue;
            };
            if payload.is_empty() {
                continue;
            }
            if payload == DONE_SENTINEL {
                self.buffer.clear();
                self.complete()?;
                return Ok(self.state);
            }
            if let Err(err) = self.handle_payload(payload, emit) {
                self.fail();
                return Err(err);
            }
        }
        Ok(self.state)
    }

    fn handle_payload(
        &mut self,
        payload: &str,
        emit: &mut impl FnMut(DeltaEvent),
    ) -> Result<(), ChatError> {
        self.data_frames += 1;

        let response = match serde_json::from_str::<ChatResponse>(payload) {
            Ok(response) => response,
            Err(err) => {
                self.malformed_frames += 1;
                let err = ChatError::Parse(err.to_string());
                warn!(error = %err, "skipping malformed frame");
                return Ok(());
            }
        };

        if let Some(error) = response.error.filter(|error| !error.is_null()) {
            return Err(ChatError::from_error_frame(&error));
        }

        match response.choices {
            Some(choices) => {
                for choice in choices {
                    emit(DeltaEvent {
                        index: choice.index,
                        content: choice.delta.content.unwrap_or_default(),
                        finish_reason: choice.finish_reason.map(FinishReason::from),
                    });
                }
            }
            None if response.content.is_some() || response.finish_reason.is_some() => {
                emit(DeltaEvent {
                    index: 0,
                    content: response.content.unwrap_or_default(),
                    finish_reason: response.finish_reason.map(FinishReason::from),
                });
            }
            None => debug!("frame carried no choices"),
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<(), ChatError> {
        if self.data_frames > 0 && self.malformed_frames == self.data_frames {
            self.fail();
            return Err(ChatError::malformed_stream());
        }
        self.state = StreamState::Done;
        Ok(())
    }
}
