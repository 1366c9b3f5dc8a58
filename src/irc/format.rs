//! IRC inline formatting codes and the running decoration state.
//!
//! Control bytes handled here:
//! - 0x02 bold, 0x1D italic, 0x1F underline, 0x1E strikethrough,
//!   0x11 monospace, 0x16 reverse (all toggles)
//! - 0x03 color, followed by 1-2 foreground digits and optionally a comma
//!   with 1-2 background digits; a bare 0x03 clears both colors
//! - 0x0F reset

pub const BOLD: u8 = 0x02;
pub const COLOR: u8 = 0x03;
pub const RESET: u8 = 0x0F;
pub const MONOSPACE: u8 = 0x11;
pub const REVERSE: u8 = 0x16;
pub const ITALIC: u8 = 0x1D;
pub const STRIKETHROUGH: u8 = 0x1E;
pub const UNDERLINE: u8 = 0x1F;

/// Longest possible color span: marker, two digits, comma, two digits.
pub const MAX_COLOR_SPAN: usize = 6;

pub fn is_format_byte(b: u8) -> bool {
    matches!(
        b,
        BOLD | COLOR | RESET | MONOSPACE | REVERSE | ITALIC | STRIKETHROUGH | UNDERLINE
    )
}

/// A color code found in a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorSpan {
    /// Byte offset of the 0x03 marker.
    pub start: usize,
    /// Byte offset one past the last digit of the code.
    pub end: usize,
    pub foreground: Option<u8>,
    pub background: Option<u8>,
}

impl ColorSpan {
    pub fn contains_cut(&self, cut: usize) -> bool {
        self.start < cut && cut < self.end
    }
}

fn read_digits(bytes: &[u8], at: usize) -> (usize, Option<u8>) {
    let mut len = 0;
    let mut value: u8 = 0;
    while len < 2 {
        match bytes.get(at + len) {
            Some(b) if b.is_ascii_digit() => {
                value = value * 10 + (b - b'0');
                len += 1;
            }
            _ => break,
        }
    }
    (len, (len > 0).then_some(value))
}

/// Parses the color code whose marker sits at `start`.
pub fn color_span_at(text: &str, start: usize) -> Option<ColorSpan> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&COLOR) {
        return None;
    }
    let mut end = start + 1;
    let (fg_len, foreground) = read_digits(bytes, end);
    end += fg_len;
    let mut background = None;
    if foreground.is_some() && bytes.get(end) == Some(&b',') {
        let (bg_len, bg) = read_digits(bytes, end + 1);
        if bg.is_some() {
            end += 1 + bg_len;
            background = bg;
        }
    }
    Some(ColorSpan {
        start,
        end,
        foreground,
        background,
    })
}

/// Every color code in `text`, in order.
pub fn color_spans(text: &str) -> Vec<ColorSpan> {
    let mut spans = Vec::new();
    let mut i = 0;
    while i < text.len() {
        if text.as_bytes()[i] == COLOR
            && let Some(span) = color_span_at(text, i)
        {
            i = span.end;
            spans.push(span);
        } else {
            i += 1;
        }
    }
    spans
}

/// Decoration active at some cursor position of a formatted string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatState {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub monospace: bool,
    pub reverse: bool,
    pub foreground: Option<u8>,
    pub background: Option<u8>,
}

impl FormatState {
    pub fn reset(&mut self) {
        *self = FormatState::default();
    }

    pub fn is_plain(&self) -> bool {
        *self == FormatState::default()
    }

    /// Applies every control code in `text` on top of the current state.
    pub fn replay(&mut self, text: &str) {
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                BOLD => self.bold = !self.bold,
                ITALIC => self.italic = !self.italic,
                UNDERLINE => self.underline = !self.underline,
                STRIKETHROUGH => self.strikethrough = !self.strikethrough,
                MONOSPACE => self.monospace = !self.monospace,
                REVERSE => self.reverse = !self.reverse,
                RESET => self.reset(),
                COLOR => {
                    if let Some(span) = color_span_at(text, i) {
                        match span.foreground {
                            Some(fg) => {
                                self.foreground = Some(fg);
                                if span.background.is_some() {
                                    self.background = span.background;
                                }
                            }
                            None => {
                                self.foreground = None;
                                self.background = None;
                            }
                        }
                        i = span.end;
                        continue;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    /// Codes that re-open this state at the start of a fresh message.
    ///
    /// Color comes first, then the toggles. Colors are always written with
    /// two digits so a following digit in `followed_by` is not swallowed.
    pub fn reopen_codes(&self, followed_by: &str) -> String {
        let mut codes = String::new();
        if let Some(fg) = self.foreground {
            codes.push(COLOR as char);
            codes.push_str(&format!("{fg:02}"));
            if let Some(bg) = self.background {
                codes.push_str(&format!(",{bg:02}"));
            }
        }
        let toggles = [
            (self.bold, BOLD),
            (self.italic, ITALIC),
            (self.underline, UNDERLINE),
            (self.strikethrough, STRIKETHROUGH),
            (self.monospace, MONOSPACE),
            (self.reverse, REVERSE),
        ];
        let mut wrote_toggle = false;
        for (on, code) in toggles {
            if on {
                codes.push(code as char);
                wrote_toggle = true;
            }
        }
        // A comma right after a foreground-only code would be read as a
        // background separator.
        if self.foreground.is_some()
            && self.background.is_none()
            && !wrote_toggle
            && followed_by.starts_with(',')
        {
            codes.push(BOLD as char);
            codes.push(BOLD as char);
        }
        codes
    }
}

/// Removes every formatting code, leaving the text a reader sees.
pub fn strip_formatting(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        let b = text.as_bytes()[i];
        if b == COLOR
            && let Some(span) = color_span_at(text, i)
        {
            i = span.end;
            continue;
        }
        if is_format_byte(b) {
            i += 1;
            continue;
        }
        // i stays on a char boundary: every skipped byte is ASCII.
        let ch_len = text[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_span_parsing() {
        let s = "a\x0304,12b";
        let span = color_span_at(s, 1).unwrap();
        assert_eq!(span.end, 7);
        assert_eq!(span.foreground, Some(4));
        assert_eq!(span.background, Some(12));

        let s = "\x033,x";
        let span = color_span_at(s, 0).unwrap();
        assert_eq!(span.end, 2, "comma without digits is text");
        assert_eq!(span.background, None);

        let s = "\x03,5";
        let span = color_span_at(s, 0).unwrap();
        assert_eq!(span.end, 1, "bare marker never takes a background");
    }

    #[test]
    fn test_three_digits_only_take_two() {
        let span = color_span_at("\x03123", 0).unwrap();
        assert_eq!(span.foreground, Some(12));
        assert_eq!(span.end, 3);
    }

    #[test]
    fn test_replay_toggles_and_colors() {
        let mut state = FormatState::default();
        state.replay("\x02bold\x1ditalic\x0304,01red");
        assert!(state.bold && state.italic);
        assert_eq!(state.foreground, Some(4));
        assert_eq!(state.background, Some(1));

        state.replay("\x02\x0309");
        assert!(!state.bold);
        assert_eq!(state.foreground, Some(9));
        assert_eq!(state.background, Some(1), "foreground-only keeps background");

        state.replay("\x03");
        assert_eq!(state.foreground, None);
        assert_eq!(state.background, None);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut state = FormatState::default();
        state.replay("\x02\x1f\x16\x0305,06x");
        state.replay("\x0f");
        assert!(state.is_plain());
    }

    #[test]
    fn test_reopen_codes_order() {
        let mut state = FormatState::default();
        state.replay("\x02\x033");
        assert_eq!(state.reopen_codes("text"), "\x0303\x02");
        assert_eq!(FormatState::default().reopen_codes("x"), "");
    }

    #[test]
    fn test_reopen_codes_guard_comma() {
        let mut state = FormatState::default();
        state.replay("\x0304");
        assert_eq!(state.reopen_codes(",5 apples"), "\x0304\x02\x02");
        assert_eq!(state.reopen_codes("apples"), "\x0304");
    }

    #[test]
    fn test_strip_formatting() {
        assert_eq!(strip_formatting("\x02bold\x02 \x0304,05red\x0f ok"), "bold red ok");
        assert_eq!(strip_formatting("héllo \x1dwörld"), "héllo wörld");
        assert_eq!(strip_formatting("\x03"), "");
    }

    #[test]
    fn test_color_spans_lists_all() {
        let spans = color_spans("\x0301a\x03b\x0302,03c");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].foreground, None);
        assert_eq!(spans[2].background, Some(3));
    }
}
