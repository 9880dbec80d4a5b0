//! Input sanitation for transcription text before it reaches the generator.

use std::sync::LazyLock;

use regex::Regex;

/// Result of sanitising caller-supplied text.
#[derive(Debug, Clone)]
pub struct SanitizedText {
    pub text: String,
    pub was_modified: bool,
    pub was_truncated: bool,
}

/// Phrases that try to re-program the model from inside the transcription.
static INJECTION_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(ignore (all )?(previous|prior|above) (instructions?|prompts?)|you are now|disregard (the )?system prompt)",
    )
    .expect("injection pattern regex is valid")
});

/// Sanitise transcription text: strip control characters except newline and
/// tab, drop invisible Unicode, remove injection phrases, collapse runs of
/// spaces, trim, and cap at `max_chars` on a word boundary.
pub fn sanitize_text(raw: &str, max_chars: usize) -> SanitizedText {
    let mut text: String = raw
        .chars()
        .filter(|c| !is_stripped_char(*c))
        .collect::<String>();

    text = INJECTION_PATTERNS.replace_all(&text, " ").into_owned();
    text = collapse_spaces(&text);
    text = text.trim().to_string();

    let mut was_truncated = false;
    if text.chars().count() > max_chars {
        text = truncate_at_word_boundary(&text, max_chars);
        was_truncated = true;
    }

    SanitizedText {
        was_modified: text != raw,
        was_truncated,
        text,
    }
}

fn is_stripped_char(c: char) -> bool {
    if c == '\n' || c == '\t' {
        return false;
    }
    if c.is_control() {
        return true;
    }
    matches!(
        c,
        '\u{200B}'..='\u{200F}'   // zero-width chars
        | '\u{202A}'..='\u{202E}' // directional formatting
        | '\u{2060}'..='\u{2064}' // invisible operators
        | '\u{2066}'..='\u{2069}' // directional isolates
        | '\u{FEFF}'              // BOM
        | '\u{00AD}'              // soft hyphen
    )
}

/// Collapse runs of spaces; newlines survive so paragraph structure does.
fn collapse_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for c in text.chars() {
        if c == ' ' {
            if !last_was_space {
                out.push(c);
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn truncate_at_word_boundary(text: &str, max_chars: usize) -> String {
    let truncated: String = text.chars().take(max_chars).collect();
    match truncated.rfind(char::is_whitespace) {
        Some(pos) if pos > max_chars / 2 => truncated[..pos].trim_end().to_string(),
        _ => truncated,
    }
}
