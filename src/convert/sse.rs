//! Incremental SSE event framing over arbitrary byte chunks.

/// Buffers upstream bytes and yields the payload of every complete `data:`
/// line, splitting events on blank lines (LF or CRLF). Chunk boundaries may
/// fall anywhere, including inside a UTF-8 sequence: bytes are accumulated
/// raw and only complete event blocks are decoded.
#[derive(Default)]
pub struct SseFramer {
    buffer: Vec<u8>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some((pos, len)) = find_blank_line(&self.buffer) {
            let block = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
            self.buffer.drain(..pos + len);
            extract_data_lines(&block, &mut out);
        }
        out
    }

    /// Drain whatever is left at EOF; a final event may lack the trailing
    /// blank line.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        extract_data_lines(&String::from_utf8_lossy(&rest), &mut out);
        out
    }
}

/// Locate the earliest blank-line separator, `\n\n` or `\r\n\r\n` (matched
/// as `\n\r\n`; the leading `\r` stays on the block and is stripped per
/// line). Returns (block end, separator length).
fn find_blank_line(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer.windows(3).position(|w| w == b"\n\r\n").map(|p| (p, 3));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn extract_data_lines(block: &str, out: &mut Vec<String>) {
    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(data) = line.strip_prefix("data:") {
            out.push(data.trim().to_string());
        }
    }
}
