//! Bounded scrollback with monotone sequence numbers.
//!
//! The buffer keeps the most recent output as text, trimmed from the front
//! once it exceeds the cap. `seq` is the running count of characters ever
//! appended; it never rewinds, so reconnecting clients can name the exact
//! point they left off.

/// Maximum characters retained for reconnect catch-up.
pub const SCROLLBACK_MAX_CHARS: usize = 50_000;

#[derive(Debug)]
pub struct ScrollbackBuffer {
    buf: String,
    buffered: usize,
    total: u64,
    max_chars: usize,
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new(SCROLLBACK_MAX_CHARS)
    }
}

impl ScrollbackBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            buffered: 0,
            total: 0,
            max_chars,
        }
    }

    /// Append output and return the sequence number as of the end of it.
    pub fn push(&mut self, text: &str) -> u64 {
        let added = text.chars().count();
        self.buf.push_str(text);
        self.buffered += added;
        self.total += added as u64;

        if self.buffered > self.max_chars {
            let excess = self.buffered - self.max_chars;
            let cut = self
                .buf
                .char_indices()
                .nth(excess)
                .map(|(idx, _)| idx)
                .unwrap_or(self.buf.len());
            self.buf.drain(..cut);
            self.buffered -= excess;
        }

        self.total
    }

    /// Current tail sequence number.
    pub fn seq(&self) -> u64 {
        self.total
    }

    /// The whole retained buffer plus its tail sequence number.
    pub fn snapshot(&self) -> (String, u64) {
        (self.buf.clone(), self.total)
    }

    /// Everything after `last_seq`, for reconnect delta-sync.
    ///
    /// If the buffer has been trimmed past `last_seq` the remaining buffer is
    /// returned whole; the client observes a gap, not an error.
    pub fn since(&self, last_seq: u64) -> (String, u64) {
        if last_seq >= self.total {
            return (String::new(), self.total);
        }
        let head_seq = self.total - self.buffered as u64;
        let skip = last_seq.saturating_sub(head_seq) as usize;
        let start = self
            .buf
            .char_indices()
            .nth(skip)
            .map(|(idx, _)| idx)
            .unwrap_or(self.buf.len());
        (self.buf[start..].to_string(), self.total)
    }
}

/// Reassembles UTF-8 text from byte chunks that may split multi-byte
/// characters at read boundaries. Incomplete trailing bytes are carried to
/// the next chunk; genuinely invalid bytes become replacement characters.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_len]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid_len + bad);
                        }
                        None => {
                            // Incomplete trailing character; wait for the
                            // rest of its bytes.
                            self.pending.drain(..valid_len);
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_counts_cumulative_chars() {
        let mut buf = ScrollbackBuffer::default();
        assert_eq!(buf.push("hello"), 5);
        assert_eq!(buf.push(" world"), 11);
        assert_eq!(buf.seq(), 11);
    }

    #[test]
    fn snapshot_returns_everything_before_trim() {
        let mut buf = ScrollbackBuffer::default();
        buf.push("abc");
        buf.push("def");
        let (data, seq) = buf.snapshot();
        assert_eq!(data, "abcdef");
        assert_eq!(seq, 6);
    }

    #[test]
    fn since_returns_exact_delta() {
        let mut buf = ScrollbackBuffer::default();
        buf.push("0123456789");
        buf.push("abcde");
        let (delta, seq) = buf.since(10);
        assert_eq!(delta, "abcde");
        assert_eq!(seq, 15);
    }

    #[test]
    fn since_at_tail_is_empty() {
        let mut buf = ScrollbackBuffer::default();
        buf.push("abc");
        let (delta, seq) = buf.since(3);
        assert_eq!(delta, "");
        assert_eq!(seq, 3);

        // A client claiming a future seq gets nothing rather than a panic.
        let (delta, _) = buf.since(99);
        assert_eq!(delta, "");
    }

    #[test]
    fn trims_from_front_and_keeps_seq_monotone() {
        let mut buf = ScrollbackBuffer::new(10);
        buf.push("0123456789");
        buf.push("abcde");
        assert_eq!(buf.seq(), 15);
        let (data, seq) = buf.snapshot();
        assert_eq!(data, "56789abcde");
        assert_eq!(seq, 15);
    }

    #[test]
    fn since_older_than_head_replays_remaining_buffer() {
        let mut buf = ScrollbackBuffer::new(10);
        buf.push("0123456789");
        buf.push("abcde");
        // seq 2 has been trimmed away; the client gets the surviving window.
        let (delta, seq) = buf.since(2);
        assert_eq!(delta, "56789abcde");
        assert_eq!(seq, 15);
    }

    #[test]
    fn multibyte_chars_count_once() {
        let mut buf = ScrollbackBuffer::default();
        assert_eq!(buf.push("héllo"), 5);
        let (delta, _) = buf.since(1);
        assert_eq!(delta, "éllo");
    }

    #[test]
    fn utf8_carry_heals_split_characters() {
        let mut carry = Utf8Carry::new();
        let bytes = "héllo".as_bytes();
        // Split inside the two-byte 'é'.
        let first = carry.push(&bytes[..2]);
        let second = carry.push(&bytes[2..]);
        assert_eq!(format!("{first}{second}"), "héllo");
    }

    #[test]
    fn utf8_carry_replaces_invalid_bytes() {
        let mut carry = Utf8Carry::new();
        let out = carry.push(&[b'a', 0xff, b'b']);
        assert_eq!(out, "a\u{FFFD}b");
    }
}
