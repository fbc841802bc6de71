use std::borrow::Cow;

/// Ellipsis marker appended whenever text is shortened
pub const ELLIPSIS: &str = "...";

/// Characters that end a sentence, CJK full-width forms included.
const SENTENCE_ENDINGS: [char; 7] = ['。', '！', '？', '.', '!', '?', '\n'];

/// Caps a string at `max_chars` characters, appending [`ELLIPSIS`] when cut.
///
/// Counts Unicode scalar values rather than bytes, so multi-byte text is
/// never split inside a character.
///
/// # Examples
///
/// ```
/// use feedrelay::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Short", 10), "Short");
/// assert_eq!(truncate_chars("Hello World", 5), "Hello...");
/// assert_eq!(truncate_chars("你好世界", 2), "你好...");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        None => Cow::Borrowed(s),
        Some((byte_idx, _)) => Cow::Owned(format!("{}{}", &s[..byte_idx], ELLIPSIS)),
    }
}

/// Shortens text to at most `max_chars` characters, preferring natural boundaries.
///
/// Three strategies are tried in order:
///
/// 1. Cut right after the last sentence-ending mark (`.`, `!`, `?`, their
///    full-width forms, or a newline) found beyond 70% of the window.
/// 2. Cut at the last whitespace found beyond 80% of the window.
/// 3. Hard-cut at exactly `max_chars`.
///
/// Every truncated result ends with [`ELLIPSIS`]. Text that already fits is
/// returned borrowed.
///
/// # Examples
///
/// ```
/// use feedrelay::util::smart_truncate;
///
/// let text = "The quick brown fox jumps. Over the lazy dog again";
/// assert_eq!(smart_truncate(text, 30), "The quick brown fox jumps....");
/// ```
pub fn smart_truncate(text: &str, max_chars: usize) -> Cow<'_, str> {
    let window: Vec<(usize, char)> = text.char_indices().take(max_chars + 1).collect();
    if window.len() <= max_chars {
        return Cow::Borrowed(text);
    }
    let window = &window[..max_chars];

    // Position p qualifies when p > 70% (resp. 80%) of the window
    let sentence_cut = window
        .iter()
        .enumerate()
        .rev()
        .take_while(|(pos, _)| pos * 10 > max_chars * 7)
        .find(|(_, (_, c))| SENTENCE_ENDINGS.contains(c))
        .map(|(_, (byte_idx, c))| byte_idx + c.len_utf8());

    if let Some(end) = sentence_cut {
        return Cow::Owned(format!("{}{}", text[..end].trim_end(), ELLIPSIS));
    }

    let space_cut = window
        .iter()
        .enumerate()
        .rev()
        .take_while(|(pos, _)| pos * 10 > max_chars * 8)
        .find(|(_, (_, c))| c.is_whitespace())
        .map(|(_, (byte_idx, _))| *byte_idx);

    if let Some(end) = space_cut {
        return Cow::Owned(format!("{}{}", &text[..end], ELLIPSIS));
    }

    let hard_end = text
        .char_indices()
        .nth(max_chars)
        .map(|(byte_idx, _)| byte_idx)
        .unwrap_or(text.len());
    Cow::Owned(format!("{}{}", &text[..hard_end], ELLIPSIS))
}
