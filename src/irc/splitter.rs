//! Format-aware splitting of outbound chat text.
//!
//! Every part fits the byte budget on its own and starts by re-opening the
//! decoration that was active where the previous part stopped, so a reader
//! who only sees part `k` still sees it styled as in the unsplit text.

use super::format::{FormatState, color_span_at, color_spans};

const CLAUSE_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}'];

/// Splits `text` into parts of at most `max_len` bytes each.
///
/// Newlines are not handled here; callers split lines first. A character
/// wider than `max_len` on its own goes out as a single `?` part.
pub fn split(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let max_len = max_len.max(1);

    let mut parts = Vec::new();
    let mut state = FormatState::default();
    let mut remaining = text;

    while !remaining.is_empty() {
        let mut prefix = state.reopen_codes(remaining);
        if prefix.len() >= max_len {
            prefix.clear();
        }
        if remaining.len() <= max_len - prefix.len() {
            parts.push(format!("{prefix}{remaining}"));
            break;
        }

        let mut cut = find_cut(remaining, max_len - prefix.len());
        if cut == 0 && !prefix.is_empty() {
            // Formatting is dropped before text is.
            prefix.clear();
            if remaining.len() <= max_len {
                parts.push(remaining.to_string());
                break;
            }
            cut = find_cut(remaining, max_len);
        }

        if cut == 0 {
            // The leading unit does not fit even an empty part.
            match color_span_at(remaining, 0) {
                Some(span) => {
                    state.replay(&remaining[..span.end]);
                    remaining = remaining[span.end..].trim_start();
                }
                None => {
                    let ch_len = remaining.chars().next().map_or(1, char::len_utf8);
                    parts.push("?".to_string());
                    remaining = remaining[ch_len..].trim_start();
                }
            }
            continue;
        }

        let piece = remaining[..cut].trim_end();
        state.replay(piece);
        parts.push(format!("{prefix}{piece}"));
        remaining = remaining[cut..].trim_start();
    }

    if parts.is_empty() {
        parts.push(String::new());
    }
    parts
}

/// Picks the byte offset at which `s` is cut so that `s[..cut]` fits in
/// `available` bytes. Returns 0 when no valid cut exists.
fn find_cut(s: &str, available: usize) -> usize {
    let mut limit = available.min(s.len());
    while limit > 0 && !s.is_char_boundary(limit) {
        limit -= 1;
    }

    let spans = color_spans(s);
    if let Some(span) = spans.iter().find(|span| span.contains_cut(limit)) {
        limit = span.start;
    }
    if limit == 0 {
        return 0;
    }

    let whitespace = s
        .char_indices()
        .take_while(|&(i, _)| i <= limit)
        .filter(|&(i, c)| i > 0 && c.is_whitespace())
        .map(|(i, _)| i)
        .last();
    if let Some(cut) = whitespace {
        return cut;
    }

    let punctuation = s
        .char_indices()
        .take_while(|&(i, c)| i + c.len_utf8() <= limit)
        .filter(|&(i, c)| {
            CLAUSE_PUNCTUATION.contains(&c) && !spans.iter().any(|span| span.contains_cut(i))
        })
        .map(|(i, c)| i + c.len_utf8())
        .last();
    if let Some(cut) = punctuation {
        return cut;
    }

    limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::format::{COLOR, strip_formatting};

    fn without_whitespace(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn test_short_message_is_unchanged() {
        assert_eq!(split("hello \x02world", 100), vec!["hello \x02world"]);
    }

    #[test]
    fn test_empty_message_yields_one_empty_part() {
        assert_eq!(split("", 10), vec![String::new()]);
        assert_eq!(split("", 0), vec![String::new()]);
    }

    #[test]
    fn test_prefers_whitespace() {
        let parts = split("the quick brown fox jumps", 10);
        assert_eq!(parts, vec!["the quick", "brown fox", "jumps"]);
    }

    #[test]
    fn test_falls_back_to_punctuation() {
        let parts = split("aaaa,bbbb,cccc", 6);
        assert_eq!(parts, vec!["aaaa,", "bbbb,", "cccc"]);
    }

    #[test]
    fn test_falls_back_to_raw_cut_for_long_tokens() {
        let parts = split("abcdefghijkl", 5);
        assert_eq!(parts, vec!["abcde", "fghij", "kl"]);
    }

    #[test]
    fn test_never_splits_inside_multibyte_characters() {
        let text = "ééééé日本語テキスト";
        for max in 3..12 {
            let parts = split(text, max);
            for part in &parts {
                assert!(part.len() <= max, "{part:?} exceeds {max}");
            }
            assert_eq!(parts.concat(), text);
        }
    }

    #[test]
    fn test_color_code_is_never_split() {
        let parts = split("aaaa\x0304,05bbbb", 7);
        assert_eq!(parts[0], "aaaa");
        assert!(parts[1].starts_with("\x0304,05"));
        for part in &parts {
            assert!(part.len() <= 7);
            for span in color_spans(part) {
                assert!(span.foreground.is_some(), "dangling marker in {part:?}");
            }
        }
    }

    #[test]
    fn test_comma_inside_color_code_is_not_a_clause_boundary() {
        // The only punctuation is the comma of the color code.
        let parts = split("xx\x0312,07yyyyyyyy", 7);
        assert_eq!(parts[0], "xx");
        assert!(parts[1].starts_with("\x0312,07"));
    }

    #[test]
    fn test_formatting_is_reopened_on_every_part() {
        let parts = split("\x02\x1fbold underlined words keep going on", 16);
        assert!(parts.len() > 2);
        for part in &parts[1..] {
            assert!(part.starts_with("\x02\x1f"), "missing prefix in {part:?}");
        }
    }

    #[test]
    fn test_reset_clears_formatting_for_later_parts() {
        let text = "\x02\x0304loud red text\x0f then quiet plain text follows along";
        let parts = split(text, 20);
        let reset_part = parts.iter().position(|p| p.contains('\x0f')).unwrap();
        for part in &parts[reset_part + 1..] {
            assert!(!part.starts_with('\x02'));
            assert!(!part.as_bytes().contains(&COLOR), "color leaked into {part:?}");
        }
    }

    #[test]
    fn test_parts_fit_and_preserve_visible_text() {
        let inputs = [
            "plain words that go on for a while, with commas; and more.",
            "\x02bold\x02 and \x0304,12colored\x03 text with \x1ditalic\x1d words",
            "averyveryverylongtokenwithoutanybreaksatall",
            "\x0309green\x0f\x16rev\x16 mixed, punctuation! everywhere? yes.",
        ];
        for input in inputs {
            for max in 1..=40 {
                let parts = split(input, max);
                assert!(!parts.is_empty());
                for part in &parts {
                    assert!(part.len() <= max, "{part:?} longer than {max}");
                }
                let visible: String = parts.iter().map(|p| strip_formatting(p)).collect();
                assert_eq!(
                    without_whitespace(&visible),
                    without_whitespace(&strip_formatting(input)),
                    "visible text changed for max {max}"
                );
            }
        }
    }

    #[test]
    fn test_character_wider_than_budget_becomes_placeholder() {
        assert_eq!(split("a日b", 2), vec!["a", "?", "b"]);
        assert_eq!(split("日本", 1), vec!["?", "?"]);
        // Characters that fit are never replaced.
        assert_eq!(split("é日", 3), vec!["é", "日"]);
    }

    #[test]
    fn test_bold_green_message_into_80_byte_parts() {
        let words = [
            "resilient", "clients", "survive", "netsplits", "and", "flapping", "bans",
        ];
        let mut body = String::new();
        let mut i = 0;
        while body.len() < 500 {
            if !body.is_empty() {
                body.push(' ');
            }
            body.push_str(words[i % words.len()]);
            i += 1;
        }
        body.truncate(500);
        let body = body.trim_end().to_string();
        let text = format!("\x0303\x02{body}");

        let parts = split(&text, 80);
        assert!(parts.len() >= 6, "got {} parts", parts.len());
        for part in &parts {
            assert!(part.len() <= 80);
        }
        for part in &parts[1..] {
            assert!(part.starts_with("\x0303\x02"), "bad prefix in {part:?}");
        }
        let rejoined: Vec<String> = parts.iter().map(|p| strip_formatting(p)).collect();
        let collapsed: Vec<&str> = body.split_whitespace().collect();
        assert_eq!(rejoined.join(" "), collapsed.join(" "));
    }
}
