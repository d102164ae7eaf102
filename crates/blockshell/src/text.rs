//! Output cleanup for plain-text rendering of block output.

use std::sync::OnceLock;

use regex::Regex;

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // CSI sequences, OSC sequences (BEL or ST terminated), then lone two-byte escapes.
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI escape regex is valid")
    })
}

/// Strip ANSI escape sequences and carriage returns that precede a newline.
pub fn strip_ansi_codes(s: &str) -> String {
    ansi_regex().replace_all(s, "").replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_sgr_sequences() {
        assert_eq!(strip_ansi_codes("\x1b[1;31mred\x1b[0m"), "red");
    }

    #[test]
    fn test_strips_cursor_movement_and_osc_titles() {
        assert_eq!(strip_ansi_codes("\x1b[2J\x1b[Hhome"), "home");
        assert_eq!(strip_ansi_codes("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi_codes("\x1b]2;title\x1b\\text"), "text");
    }

    #[test]
    fn test_normalizes_crlf() {
        assert_eq!(strip_ansi_codes("a\r\nb\r\n"), "a\nb\n");
    }

    #[test]
    fn test_plain_text_is_untouched() {
        assert_eq!(strip_ansi_codes("hello [world]"), "hello [world]");
    }
}
