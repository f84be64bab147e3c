/// Reconstructs typed lines from raw keystroke bytes.
///
/// Observes a copy of the input only; the bytes written to the process are
/// never altered.
#[derive(Debug, Default)]
pub struct InputScanner {
    buffer: Vec<u8>,
    escape: Escape,
}

/// Progress through a keystroke escape sequence (arrows, function keys).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    None,
    Start,
    /// `ESC [` parameters until a final byte.
    Csi,
    /// `ESC O` plus one byte.
    Ss3,
}

impl InputScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed keystrokes; returns every line completed by a CR or LF.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match self.escape {
                Escape::None => {}
                Escape::Start => match byte {
                    b'[' => {
                        self.escape = Escape::Csi;
                        continue;
                    }
                    b'O' => {
                        self.escape = Escape::Ss3;
                        continue;
                    }
                    // Lone ESC; handle the byte normally.
                    _ => self.escape = Escape::None,
                },
                Escape::Csi => {
                    if (0x40..=0x7e).contains(&byte) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::Ss3 => {
                    self.escape = Escape::None;
                    continue;
                }
            }
            match byte {
                0x1b => self.escape = Escape::Start,
                b'\r' | b'\n' => {
                    let line = String::from_utf8_lossy(&self.buffer);
                    let line = line.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                    self.buffer.clear();
                }
                0x08 | 0x7f => self.pop_char(),
                b if b < 0x20 => {}
                b => self.buffer.push(b),
            }
        }
        lines
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    fn pop_char(&mut self) {
        while let Some(byte) = self.buffer.pop() {
            if byte & 0xC0 != 0x80 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_on_cr_or_lf() {
        let mut scanner = InputScanner::new();
        assert!(scanner.feed(b"cd /t").is_empty());
        assert_eq!(scanner.feed(b"mp\r"), vec!["cd /tmp"]);
        assert_eq!(scanner.feed(b"ls\nexit\r\n"), vec!["ls", "exit"]);
        assert!(scanner.pending().is_empty());
    }

    #[test]
    fn backspace_and_delete_erase() {
        let mut scanner = InputScanner::new();
        assert_eq!(scanner.feed(b"cd /tnp\x08\x08mp\r"), vec!["cd /tmp"]);
        assert_eq!(scanner.feed(b"cdd\x7f ..\r"), vec!["cd .."]);
        assert!(scanner.feed(b"\x7f\x7f").is_empty());
    }

    #[test]
    fn backspace_removes_whole_multibyte_char() {
        let mut scanner = InputScanner::new();
        let mut input = "cd é".as_bytes().to_vec();
        input.push(0x7f);
        input.extend_from_slice(b"e\r");
        assert_eq!(scanner.feed(&input), vec!["cd e"]);
    }

    #[test]
    fn control_bytes_are_dropped() {
        let mut scanner = InputScanner::new();
        assert_eq!(scanner.feed(b"c\x01d\t ..\x1b\r"), vec!["cd .."]);
    }

    #[test]
    fn arrow_and_function_keys_are_skipped() {
        let mut scanner = InputScanner::new();
        assert_eq!(scanner.feed(b"cd \x1b[A\x1b[D/tmp\r"), vec!["cd /tmp"]);
        assert_eq!(scanner.feed(b"cd \x1bOP..\x1b[15~\r"), vec!["cd .."]);
        // Split across reads.
        assert!(scanner.feed(b"cd src\x1b[1;5").is_empty());
        assert_eq!(scanner.feed(b"C\r"), vec!["cd src"]);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let mut scanner = InputScanner::new();
        assert!(scanner.feed(b"\r\r   \r").is_empty());
    }
}
