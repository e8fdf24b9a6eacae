//! Newline-delimited frame codec.
//!
//! A frame on the wire is its payload with `\` written as `\\` and newline
//! written as `\n`, followed by a single newline separator. Decoding keeps
//! unknown escape sequences literally, so a peer writing raw newline-delimited
//! text (without backslashes) decodes unchanged.

use crate::error::FrameError;

pub const FRAME_SEPARATOR: u8 = b'\n';
const ESCAPE: u8 = b'\\';
const ESCAPED_SEPARATOR: u8 = b'n';

/// Encode one payload as a complete wire frame, separator included.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    for &b in payload {
        match b {
            FRAME_SEPARATOR => out.extend_from_slice(&[ESCAPE, ESCAPED_SEPARATOR]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPE]),
            _ => out.push(b),
        }
    }
    out.push(FRAME_SEPARATOR);
    out
}

fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match iter.peek().copied() {
            Some(ESCAPE) => {
                out.push(ESCAPE);
                iter.next();
            }
            Some(ESCAPED_SEPARATOR) => {
                out.push(FRAME_SEPARATOR);
                iter.next();
            }
            _ => out.push(ESCAPE),
        }
    }
    out
}

/// Incremental frame splitter. Holds the bytes of a partial frame between
/// reads.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_frame_len,
        }
    }

    /// Feed one chunk read from the socket. Returns every frame it completes,
    /// in order, and the length violation that stopped decoding, if any.
    /// Frames completed before a violation are still returned.
    pub fn push(&mut self, chunk: &[u8]) -> (Vec<Vec<u8>>, Option<FrameError>) {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == FRAME_SEPARATOR) {
            let raw = if self.pending.is_empty() {
                unescape(&rest[..pos])
            } else {
                self.pending.extend_from_slice(&rest[..pos]);
                let raw = unescape(&self.pending);
                self.pending.clear();
                raw
            };
            if raw.len() > self.max_frame_len {
                let err = FrameError::TooLong {
                    got: raw.len(),
                    max: self.max_frame_len,
                };
                return (frames, Some(err));
            }
            frames.push(raw);
            rest = &rest[pos + 1..];
        }

        self.pending.extend_from_slice(rest);
        // Escaped text is at most twice the decoded length.
        if self.pending.len() > self.max_frame_len.saturating_mul(2) {
            let err = FrameError::TooLong {
                got: self.pending.len(),
                max: self.max_frame_len,
            };
            return (frames, Some(err));
        }

        (frames, None)
    }

    /// Bytes buffered for a frame whose separator has not arrived yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multiple_frames_in_one_read() {
        let mut decoder = FrameDecoder::new(1024);
        let (frames, err) = decoder.push(b"Message1\nMessage2\nMessage3\n");

        assert_eq!(
            frames,
            vec![b"Message1".to_vec(), b"Message2".to_vec(), b"Message3".to_vec()]
        );
        assert_eq!(err, None);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_reassemble_frame_across_reads() {
        let mut decoder = FrameDecoder::new(1024);

        assert_eq!(decoder.push(b"Mess"), (Vec::new(), None));
        assert_eq!(decoder.push(b"age"), (Vec::new(), None));
        let (frames, _) = decoder.push(b"1\nMes");

        assert_eq!(frames, vec![b"Message1".to_vec()]);
        assert_eq!(decoder.pending_len(), 3);

        let (frames, _) = decoder.push(b"sage2\n");
        assert_eq!(frames, vec![b"Message2".to_vec()]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = [encode_frame(b"a\nb"), encode_frame(b"c\\d")].concat();
        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for b in wire {
            let (complete, err) = decoder.push(&[b]);
            assert!(err.is_none());
            frames.extend(complete);
        }

        assert_eq!(frames, vec![b"a\nb".to_vec(), b"c\\d".to_vec()]);
    }

    #[test]
    fn test_escaping_keeps_separator_out_of_payload() {
        let wire = encode_frame(b"line1\nline2\\n");

        assert_eq!(wire.iter().filter(|&&b| b == FRAME_SEPARATOR).count(), 1);
        assert_eq!(wire, b"line1\\nline2\\\\n\n".to_vec());
    }

    #[test]
    fn test_unknown_escape_is_literal() {
        let mut decoder = FrameDecoder::new(1024);
        let (frames, _) = decoder.push(b"C:\\tmp\\\n");

        assert_eq!(frames, vec![b"C:\\tmp\\".to_vec()]);
    }

    #[test]
    fn test_empty_frames_are_preserved() {
        let mut decoder = FrameDecoder::new(1024);
        let (frames, _) = decoder.push(b"\n\nx\n");

        assert_eq!(frames, vec![Vec::new(), Vec::new(), b"x".to_vec()]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new(4);

        let (frames, err) = decoder.push(b"12345\n");
        assert!(frames.is_empty());
        assert_eq!(err, Some(FrameError::TooLong { got: 5, max: 4 }));

        let mut decoder = FrameDecoder::new(4);
        assert!(decoder.push(b"123456789").1.is_some());
    }

    #[test]
    fn test_frames_before_violation_are_kept() {
        let mut decoder = FrameDecoder::new(4);

        let (frames, err) = decoder.push(b"ok\n0123456789abcdef");

        assert_eq!(frames, vec![b"ok".to_vec()]);
        assert_eq!(err, Some(FrameError::TooLong { got: 16, max: 4 }));
    }
}
