//! Normalisation of captured job output before it lands in the execution log.
//!
//! Output is stored per attempt, so an unbounded `find /` would bloat the
//! store. Middle-omission keeps both the start of the output and the final
//! lines, where errors usually are.

/// Cut `output` to at most `max_chars` characters by dropping the middle.
///
/// Splits on character boundaries, never inside a multi-byte sequence.
pub fn truncate_middle(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_owned();
    }

    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    let omitted = total - 2 * half;

    format!("{head}\n... [{omitted} chars omitted] ...\n{tail}")
}

/// Decode raw process output: strip ANSI escapes, replace invalid UTF-8,
/// trim trailing whitespace, then truncate.
pub fn clean_bytes(raw: &[u8], max_chars: usize) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    let text = String::from_utf8_lossy(&stripped);
    truncate_middle(text.trim_end(), max_chars)
}

/// `None` for empty output so the log column stays NULL.
pub fn non_empty(output: String) -> Option<String> {
    if output.is_empty() {
        None
    } else {
        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_untouched() {
        assert_eq!(truncate_middle("hello", 100), "hello");
    }

    #[test]
    fn exact_boundary_is_untouched() {
        let s = "x".repeat(64);
        assert_eq!(truncate_middle(&s, 64), s);
    }

    #[test]
    fn long_input_keeps_head_and_tail() {
        let input = format!("{}{}{}", "A".repeat(100), "B".repeat(1_000), "C".repeat(100));
        let out = truncate_middle(&input, 200);
        assert!(out.starts_with(&"A".repeat(100)));
        assert!(out.ends_with(&"C".repeat(100)));
        assert!(out.contains("[1000 chars omitted]"));
    }

    #[test]
    fn multibyte_chars_do_not_panic() {
        let s = "€".repeat(500);
        let out = truncate_middle(&s, 100);
        assert!(out.contains("400 chars omitted"));
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        let raw = b"\x1b[31mred\x1b[0m text\n\n";
        assert_eq!(clean_bytes(raw, 100), "red text");
    }

    #[test]
    fn empty_output_maps_to_none() {
        assert_eq!(non_empty(clean_bytes(b"  \n", 10)), None);
        assert_eq!(non_empty("x".to_string()), Some("x".to_string()));
    }
}
