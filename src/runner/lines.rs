//! Byte stream to line conversion for pseudo-terminal output.

/// Splits raw output on `\n` and `\r`.
///
/// Tools that redraw a status line with carriage returns produce one line
/// per redraw. Empty segments (the gap in `\r\n`) are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Trailing text without a terminator.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_chunks() {
        let mut s = LineSplitter::default();
        assert_eq!(s.push(b">>> Emerging (1 "), Vec::<String>::new());
        assert_eq!(s.push(b"of 2) a/b-1\r\n[1/3] cc"), vec![">>> Emerging (1 of 2) a/b-1"]);
        assert_eq!(s.push(b"\r[2/3] cc\n"), vec!["[1/3] cc", "[2/3] cc"]);
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_unterminated_tail() {
        let mut s = LineSplitter::default();
        s.push(b"done");
        assert_eq!(s.finish(), Some("done".to_string()));
        assert_eq!(s.finish(), None);
    }
}
