//! Length-prefixed binary framing.

use crate::{FrameError, Framer, MessageSink};
use engine_buffer::Buffer;

/// Size of the big-endian u16 payload-length prefix.
pub const LENGTH_HEADER: usize = 2;

/// Frames messages as a big-endian u16 payload length followed by the
/// payload.
pub struct LengthPrefixFramer {
    max_payload: usize,
}

impl LengthPrefixFramer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(u16::MAX as usize),
        }
    }
}

impl Default for LengthPrefixFramer {
    fn default() -> Self {
        Self::new(u16::MAX as usize)
    }
}

impl Framer for LengthPrefixFramer {
    fn on_readable(
        &mut self,
        rx: &mut Buffer,
        scratch: &mut Vec<u8>,
        sink: &mut dyn MessageSink,
    ) -> Result<usize, FrameError> {
        let mut count = 0;
        loop {
            if !rx.has_at_least(LENGTH_HEADER) {
                break;
            }
            let header = rx
                .contiguous(LENGTH_HEADER, scratch)
                .expect("length checked");
            let len = u16::from_be_bytes([header[0], header[1]]) as usize;
            if len > self.max_payload {
                return Err(FrameError::Oversize {
                    len,
                    max: self.max_payload,
                });
            }
            if !rx.has_at_least(LENGTH_HEADER + len) {
                // The payload has not fully arrived; the header stays in
                // the buffer untouched until it has.
                break;
            }

            rx.consume(LENGTH_HEADER);
            if len == 0 {
                sink.on_message(&[]);
            } else {
                let payload = rx.contiguous(len, scratch).expect("length checked");
                sink.on_message(payload);
                rx.consume(len);
            }
            count += 1;
        }
        Ok(count)
    }

    fn pack(&mut self, msg: &[u8], tx: &mut Buffer) -> Result<(), FrameError> {
        if msg.len() > self.max_payload {
            return Err(FrameError::Oversize {
                len: msg.len(),
                max: self.max_payload,
            });
        }

        // Keep small packets contiguous in one chunk; larger ones span.
        let total = LENGTH_HEADER + msg.len();
        if total <= tx.chunk_capacity() {
            tx.reserve(total);
        }
        tx.append(&(msg.len() as u16).to_be_bytes());
        tx.append(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut LengthPrefixFramer, rx: &mut Buffer) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = Vec::new();
        let mut scratch = Vec::new();
        let mut sink = |msg: &[u8]| out.push(msg.to_vec());
        framer.on_readable(rx, &mut scratch, &mut sink).unwrap();
        out
    }

    #[test]
    fn test_pack_then_unpack_roundtrip() {
        let mut framer = LengthPrefixFramer::default();
        let mut buf = Buffer::new();

        framer.pack(b"hello", &mut buf).unwrap();
        assert_eq!(buf.len(), 7);

        let msgs = collect(&mut framer, &mut buf);
        assert_eq!(msgs, vec![b"hello".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_header_not_consumed() {
        let mut framer = LengthPrefixFramer::default();
        let mut buf = Buffer::new();

        buf.append(&[0x00]);
        assert!(collect(&mut framer, &mut buf).is_empty());
        assert_eq!(buf.len(), 1);

        buf.append(&[0x05]);
        buf.append(b"abcde");
        let msgs = collect(&mut framer, &mut buf);
        assert_eq!(msgs, vec![b"abcde".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_payload_not_consumed() {
        let mut framer = LengthPrefixFramer::default();
        let mut buf = Buffer::new();

        buf.append(&[0x00, 0x05]);
        buf.append(b"abc");
        assert!(collect(&mut framer, &mut buf).is_empty());
        assert_eq!(buf.len(), 5);

        buf.append(b"de");
        assert_eq!(collect(&mut framer, &mut buf), vec![b"abcde".to_vec()]);
    }

    #[test]
    fn test_pipelined_messages() {
        let mut framer = LengthPrefixFramer::default();
        let mut buf = Buffer::new();

        framer.pack(b"one", &mut buf).unwrap();
        framer.pack(b"two", &mut buf).unwrap();
        framer.pack(b"", &mut buf).unwrap();

        let msgs = collect(&mut framer, &mut buf);
        assert_eq!(msgs, vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_message_spanning_small_chunks() {
        let mut framer = LengthPrefixFramer::default();
        let mut buf = Buffer::with_params(4, 16);

        buf.append(&[0x00, 0x09]);
        buf.append(b"abcdefghi");
        let msgs = collect(&mut framer, &mut buf);
        assert_eq!(msgs, vec![b"abcdefghi".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversize_is_terminal() {
        let mut framer = LengthPrefixFramer::new(8);
        let mut buf = Buffer::new();

        buf.append(&1024u16.to_be_bytes());
        let mut scratch = Vec::new();
        let mut sink = |_: &[u8]| panic!("no message expected");
        let err = framer
            .on_readable(&mut buf, &mut scratch, &mut sink)
            .unwrap_err();
        assert_eq!(err, FrameError::Oversize { len: 1024, max: 8 });
    }

    #[test]
    fn test_pack_rejects_oversize() {
        let mut framer = LengthPrefixFramer::new(4);
        let mut buf = Buffer::new();
        assert!(framer.pack(b"too long", &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
