//! HTTP-like text framing.
//!
//! A message is a start line plus header lines terminated by a blank line,
//! optionally followed by a `Content-Length` body. The whole head-and-body
//! span is delivered as one message; interpreting the start line is the
//! embedding's business.

use crate::{FrameError, Framer, MessageSink};
use engine_buffer::Buffer;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Frames CRLF-delimited text messages with Content-Length bodies.
pub struct HttpTextFramer {
    max_head: usize,
}

impl HttpTextFramer {
    pub fn new(max_head: usize) -> Self {
        Self { max_head }
    }
}

impl Default for HttpTextFramer {
    fn default() -> Self {
        Self::new(8192)
    }
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

/// Extract the Content-Length value from a complete header block, or 0
/// when the header is absent.
fn content_length(head: &[u8]) -> Result<usize, FrameError> {
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = line[..colon].trim_ascii();
        if !name.eq_ignore_ascii_case(b"content-length") {
            continue;
        }
        let value = line[colon + 1..].trim_ascii();
        let value = std::str::from_utf8(value)
            .map_err(|_| FrameError::Decode("content-length is not text"))?;
        return value
            .parse::<usize>()
            .map_err(|_| FrameError::Decode("content-length is not a number"));
    }
    Ok(0)
}

impl Framer for HttpTextFramer {
    fn on_readable(
        &mut self,
        rx: &mut Buffer,
        scratch: &mut Vec<u8>,
        sink: &mut dyn MessageSink,
    ) -> Result<usize, FrameError> {
        let mut count = 0;
        loop {
            let avail = rx.len();
            if avail == 0 {
                break;
            }

            let view = rx.contiguous_all(scratch);
            let Some(pos) = find_terminator(view) else {
                if avail > self.max_head {
                    return Err(FrameError::Oversize {
                        len: avail,
                        max: self.max_head,
                    });
                }
                break;
            };
            let head_len = pos + HEAD_TERMINATOR.len();
            if head_len > self.max_head {
                return Err(FrameError::Oversize {
                    len: head_len,
                    max: self.max_head,
                });
            }
            // A blank first line means there is no start line at all.
            if pos == 0 {
                return Err(FrameError::ShortHeader);
            }

            let body_len = content_length(&view[..head_len])?;
            let total = head_len + body_len;
            if total > avail {
                break;
            }

            sink.on_message(&view[..total]);
            rx.consume(total);
            count += 1;
        }
        Ok(count)
    }

    /// Text messages carry their own framing; they go out as-is.
    fn pack(&mut self, msg: &[u8], tx: &mut Buffer) -> Result<(), FrameError> {
        tx.append(msg);
        Ok(())
    }
}
