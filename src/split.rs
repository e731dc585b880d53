//! Line-boundary re-chunking and the binary→text boundary guard.

use crate::encoding::Encoding;

/// Re-chunks a text stream at line boundaries.
///
/// Complete lines are emitted as they arrive; a trailing partial line is
/// held back until the next push or the final flush. `\r\n` is treated as
/// the line terminator including the `\r`. Scanning is O(total bytes): a
/// scan offset remembers how far the remainder has already been searched,
/// so a very large single line is never re-scanned.
pub struct LineSplitter {
    remainder: String,
    scan_pos: usize,
    preserve_newlines: bool,
}

impl LineSplitter {
    pub fn new(preserve_newlines: bool) -> Self {
        Self {
            remainder: String::new(),
            scan_pos: 0,
            preserve_newlines,
        }
    }

    /// Append incoming text and emit every complete line found.
    ///
    /// With `preserve_newlines` off the terminator is stripped per line;
    /// a lone `"\n"` still yields one empty-string line, not zero lines.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.remainder.push_str(text);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut pos = self.scan_pos;
        while let Some(offset) = self.remainder[pos..].find('\n') {
            let end = pos + offset + 1;
            let line = self.remainder[start..end].to_string();
            lines.push(if self.preserve_newlines {
                line
            } else {
                strip_newline(line)
            });
            start = end;
            pos = end;
        }
        if start > 0 {
            self.remainder.drain(..start);
        }
        self.scan_pos = self.remainder.len();
        lines
    }

    /// Emit the held-back remainder at end of stream, if any. The
    /// remainder is not assumed to end in a terminator.
    pub fn flush(&mut self) -> Option<String> {
        if self.remainder.is_empty() {
            return None;
        }
        self.scan_pos = 0;
        Some(std::mem::take(&mut self.remainder))
    }
}

/// Remove one trailing line terminator (`\n` or `\r\n`).
pub fn strip_newline(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

/// Decodes a byte stream to text without corrupting multi-byte sequences
/// split across chunk boundaries.
///
/// An incomplete trailing sequence (up to 3 bytes for UTF-8, an odd byte
/// or unpaired high surrogate for UTF-16LE) is held back and prepended to
/// the next chunk. If the stream ends with bytes still held, they decode
/// under the codec's replacement-character policy.
pub struct DecodeGuard {
    encoding: Encoding,
    held: Vec<u8>,
}

impl DecodeGuard {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            held: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        let owned;
        let buf: &[u8] = if self.held.is_empty() {
            bytes
        } else {
            let mut v = std::mem::take(&mut self.held);
            v.extend_from_slice(bytes);
            owned = v;
            &owned
        };

        let hold = match self.encoding {
            Encoding::Utf8 => utf8_incomplete_suffix(buf),
            Encoding::Utf16Le => utf16le_incomplete_suffix(buf),
            _ => 0,
        };
        let (ready, rest) = buf.split_at(buf.len() - hold);
        self.held = rest.to_vec();
        self.encoding.decode(ready)
    }

    /// Decode whatever is still held back. Never fails: a truncated
    /// sequence becomes the replacement character.
    pub fn flush(&mut self) -> String {
        if self.held.is_empty() {
            return String::new();
        }
        let held = std::mem::take(&mut self.held);
        self.encoding.decode(&held)
    }
}

/// Length of an incomplete UTF-8 sequence at the end of `buf`, determined
/// by leading-byte inspection. Returns 0 when the tail is complete (or
/// malformed in a way the lossy decoder should handle).
fn utf8_incomplete_suffix(buf: &[u8]) -> usize {
    let scan = buf.len().min(3);
    for back in 1..=scan {
        let byte = buf[buf.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue; // continuation byte, keep looking for the lead
        }
        let width = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1, // invalid lead, let the decoder replace it
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Bytes to hold back so a UTF-16LE code unit (or surrogate pair) is never
/// split: a trailing odd byte, plus a trailing unpaired high surrogate.
fn utf16le_incomplete_suffix(buf: &[u8]) -> usize {
    let mut hold = buf.len() % 2;
    let even = buf.len() - hold;
    if even >= 2 {
        let unit = u16::from_le_bytes([buf[even - 2], buf[even - 1]]);
        if (0xD800..=0xDBFF).contains(&unit) {
            hold += 2;
        }
    }
    hold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(splitter: &mut LineSplitter, input: &str) -> Vec<String> {
        let mut out = splitter.push(input);
        out.extend(splitter.flush());
        out
    }

    #[test]
    fn test_splits_preserving_newlines() {
        let mut splitter = LineSplitter::new(true);
        let lines = collect(&mut splitter, "aaa\nbbb\nccc");
        assert_eq!(lines, vec!["aaa\n", "bbb\n", "ccc"]);
    }

    #[test]
    fn test_splits_stripping_newlines() {
        let mut splitter = LineSplitter::new(false);
        let lines = collect(&mut splitter, "aaa\nbbb\nccc");
        assert_eq!(lines, vec!["aaa", "bbb", "ccc"]);
    }

    #[test]
    fn test_crlf_kept_with_terminator() {
        let mut splitter = LineSplitter::new(true);
        let lines = collect(&mut splitter, "aaa\r\nbbb\r\n");
        assert_eq!(lines, vec!["aaa\r\n", "bbb\r\n"]);
    }

    #[test]
    fn test_crlf_stripped_entirely() {
        let mut splitter = LineSplitter::new(false);
        let lines = collect(&mut splitter, "aaa\r\nbbb");
        assert_eq!(lines, vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_lone_newline_yields_empty_chunk() {
        let mut splitter = LineSplitter::new(false);
        let lines = collect(&mut splitter, "\n");
        assert_eq!(lines, vec![""]);
    }

    #[test]
    fn test_partial_line_held_across_pushes() {
        let mut splitter = LineSplitter::new(true);
        assert_eq!(splitter.push("aa"), Vec::<String>::new());
        assert_eq!(splitter.push("a\nbb"), vec!["aaa\n"]);
        assert_eq!(splitter.flush(), Some("bb".to_string()));
    }

    #[test]
    fn test_round_trip_reproduces_input() {
        let input = "one\ntwo\r\nthree\n\nfive";
        let mut splitter = LineSplitter::new(true);
        let lines = collect(&mut splitter, input);
        assert_eq!(lines.concat(), input);
    }

    #[test]
    fn test_flush_on_empty_is_none() {
        let mut splitter = LineSplitter::new(true);
        splitter.push("done\n");
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn test_strip_newline_idempotent() {
        let once = strip_newline("value\n".to_string());
        let twice = strip_newline(once.clone());
        assert_eq!(once, "value");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_many_lines_single_push() {
        let input: String = (0..1000).map(|i| format!("line{i}\n")).collect();
        let mut splitter = LineSplitter::new(true);
        let lines = splitter.push(&input);
        assert_eq!(lines.len(), 1000);
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn test_guard_splits_multibyte_at_every_offset() {
        let text = "a\u{1F600}b"; // 4-byte emoji between ascii
        let bytes = text.as_bytes();
        for split in 1..bytes.len() {
            let mut guard = DecodeGuard::new(Encoding::Utf8);
            let mut decoded = guard.push(&bytes[..split]);
            decoded.push_str(&guard.push(&bytes[split..]));
            decoded.push_str(&guard.flush());
            assert_eq!(decoded, text, "split at byte {split}");
        }
    }

    #[test]
    fn test_guard_truncated_tail_replaced() {
        let bytes = "\u{1F600}".as_bytes();
        let mut guard = DecodeGuard::new(Encoding::Utf8);
        let mut decoded = guard.push(&bytes[..2]);
        decoded.push_str(&guard.flush());
        assert!(decoded.ends_with(char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn test_guard_utf16_odd_byte_held() {
        let bytes = Encoding::Utf16Le
            .encode(crate::stdio::Descriptor::Stdout, "hi")
            .unwrap();
        let mut guard = DecodeGuard::new(Encoding::Utf16Le);
        let mut decoded = guard.push(&bytes[..3]);
        decoded.push_str(&guard.push(&bytes[3..]));
        decoded.push_str(&guard.flush());
        assert_eq!(decoded, "hi");
    }

    #[test]
    fn test_guard_surrogate_pair_across_chunks() {
        let bytes = Encoding::Utf16Le
            .encode(crate::stdio::Descriptor::Stdout, "\u{1F600}")
            .unwrap();
        assert_eq!(bytes.len(), 4);
        let mut guard = DecodeGuard::new(Encoding::Utf16Le);
        let mut decoded = guard.push(&bytes[..2]);
        decoded.push_str(&guard.push(&bytes[2..]));
        decoded.push_str(&guard.flush());
        assert_eq!(decoded, "\u{1F600}");
    }
}
