//! Newline escaping shared by the log and snapshot formats.
//!
//! Values may contain embedded newlines; both formats are line-oriented,
//! so a literal LF is written as the two-character sequence `\n` and
//! folded back on read. The backslash itself is not escaped: a value
//! containing the literal character pair `\n` is not round-trip safe.

/// Replaces every LF in `value` with the two characters `\n`.
pub fn escape(value: &str) -> String {
    value.replace('\n', "\\n")
}

/// Folds every `\n` character pair back into an LF.
pub fn unescape(value: &str) -> String {
    value.replace("\\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_pass_through() {
        assert_eq!(escape("hello"), "hello");
        assert_eq!(unescape("hello"), "hello");
    }

    #[test]
    fn newlines_round_trip() {
        let original = "line1\nline2\nline3";
        let escaped = escape(original);
        assert!(!escaped.contains('\n'));
        assert_eq!(unescape(&escaped), original);
    }

    #[test]
    fn empty_value() {
        assert_eq!(escape(""), "");
        assert_eq!(unescape(""), "");
    }

    #[test]
    fn trailing_newline_round_trips() {
        assert_eq!(unescape(&escape("ends with\n")), "ends with\n");
    }
}
