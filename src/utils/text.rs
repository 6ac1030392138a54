/// Cut `s` to at most `max_len` bytes on a char boundary, marking the cut
/// with "..." when there is room for it.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let marker = if max_len > 3 { "..." } else { "" };
    let mut end = max_len - marker.len();
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    let mut out = String::with_capacity(end + marker.len());
    out.push_str(&s[..end]);
    out.push_str(marker);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_input_untouched() {
        assert_eq!(truncate_str("HIGH", 10), "HIGH");
        assert_eq!(truncate_str("", 0), "");
    }

    #[test]
    fn test_long_input_marked() {
        assert_eq!(truncate_str("abcdefghij", 8), "abcde...");
        assert_eq!(truncate_str("abcdefghij", 3), "abc");
    }

    #[test]
    fn test_respects_char_boundaries() {
        // 'é' is two bytes; a cut through it backs off to the previous char
        let out = truncate_str("aéééé", 5);
        assert_eq!(out, "a...");
        assert_eq!(truncate_str("aéééé", 6), "aé...");
    }
}
