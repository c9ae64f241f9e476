//! Decoding of the engine's attach stream: 8-byte multiplex framing with a
//! raw-bytes fallback, line reassembly across chunks, and the console burst
//! guard.

use std::time::{Duration, Instant};

/// Frame header: stream type byte (0 stdin, 1 stdout, 2 stderr), three zero
/// bytes, big-endian u32 payload length.
const HEADER_LEN: usize = 8;

fn header_valid(chunk: &[u8]) -> bool {
    chunk.len() >= HEADER_LEN && chunk[0] <= 2 && chunk[1] == 0 && chunk[2] == 0 && chunk[3] == 0
}

/// Splits one attach chunk into payloads.
///
/// Correctly framed records yield exactly their payload bytes. The moment a
/// header is structurally out of range, the remainder of the chunk is
/// treated as raw bytes: the engine delivers unframed output for TTY
/// containers, and this fallback is what keeps those streams readable.
pub fn demultiplex(chunk: &[u8]) -> Vec<&[u8]> {
    let mut payloads = Vec::new();
    let mut rest = chunk;
    while !rest.is_empty() {
        if !header_valid(rest) {
            payloads.push(rest);
            break;
        }
        let declared = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        // A frame truncated by the chunk boundary yields what is available.
        let end = (HEADER_LEN + declared).min(rest.len());
        payloads.push(&rest[HEADER_LEN..end]);
        rest = &rest[end..];
    }
    payloads
}

/// Reassembles payload fragments into complete lines. Keeps the trailing
/// incomplete line buffered until its newline arrives.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one payload; returns every line completed by it, `\r?\n`
    /// stripped.
    pub fn push(&mut self, payload: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(payload);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Console flood limiter: once a 100 ms window has seen its quota of lines,
/// the rest of the window is dropped.
#[derive(Debug)]
pub struct BurstGuard {
    window_start: Instant,
    count: u32,
}

const BURST_WINDOW: Duration = Duration::from_millis(100);
const BURST_LIMIT: u32 = 10;

impl BurstGuard {
    pub fn new() -> Self {
        BurstGuard {
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Returns whether the line at `now` may pass.
    pub fn admit(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= BURST_WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= BURST_LIMIT
    }
}

impl Default for BurstGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Branding rewrite applied to every console line.
pub fn brand_rewrite(line: &str) -> String {
    line.replace("pterodactyl", "argon")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream_type, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_demultiplex_concatenated_frames() {
        let mut chunk = frame(1, b"hello ");
        chunk.extend(frame(2, b"world"));
        chunk.extend(frame(1, b""));
        let payloads = demultiplex(&chunk);
        assert_eq!(payloads, vec![&b"hello "[..], &b"world"[..], &b""[..]]);
    }

    #[test]
    fn test_demultiplex_invalid_header_is_raw() {
        let chunk = b"plain tty output with no framing";
        let payloads = demultiplex(chunk);
        assert_eq!(payloads, vec![&chunk[..]]);
    }

    #[test]
    fn test_demultiplex_out_of_range_type_byte_is_raw() {
        // 'h' = 0x68, not a valid stream type.
        let chunk = b"hello\x00\x00\x00";
        assert_eq!(demultiplex(chunk), vec![&chunk[..]]);
    }

    #[test]
    fn test_demultiplex_raw_fallback_mid_stream() {
        let mut chunk = frame(1, b"framed");
        chunk.extend_from_slice(b"then raw bytes");
        let payloads = demultiplex(&chunk);
        assert_eq!(payloads, vec![&b"framed"[..], &b"then raw bytes"[..]]);
    }

    #[test]
    fn test_demultiplex_truncated_frame_yields_available_bytes() {
        let mut chunk = frame(1, b"full payload");
        chunk.truncate(8 + 4);
        assert_eq!(demultiplex(&chunk), vec![&b"full"[..]]);
    }

    #[test]
    fn test_demultiplex_short_chunk_is_raw() {
        let chunk = [1u8, 0, 0];
        assert_eq!(demultiplex(&chunk), vec![&chunk[..]]);
    }

    #[test]
    fn test_line_assembler_splits_and_buffers() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push(b"first\nsec"), vec!["first"]);
        assert_eq!(assembler.pending(), 3);
        assert_eq!(assembler.push(b"ond\r\ntail"), vec!["second"]);
        assert_eq!(assembler.pending(), 4);
        assert_eq!(assembler.push(b"\n"), vec!["tail"]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_line_assembler_multiple_lines_one_payload() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push(b"a\nb\nc\n"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_burst_guard_caps_window() {
        let mut guard = BurstGuard::new();
        let now = Instant::now();
        for _ in 0..BURST_LIMIT {
            assert!(guard.admit(now));
        }
        assert!(!guard.admit(now));
        assert!(!guard.admit(now + Duration::from_millis(50)));
        // A fresh window admits again.
        assert!(guard.admit(now + Duration::from_millis(150)));
    }

    #[test]
    fn test_brand_rewrite() {
        assert_eq!(
            brand_rewrite("pterodactyl daemon booting"),
            "argon daemon booting"
        );
        assert_eq!(brand_rewrite("no branding here"), "no branding here");
    }
}
