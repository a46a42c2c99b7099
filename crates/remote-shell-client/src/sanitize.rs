//! Output sanitizing.
//!
//! Strips terminal control sequences and protocol artifacts from captured
//! shell output. Safe on partial input: a sequence cut off at the end of the
//! buffer is dropped rather than leaking its parameter bytes.

use std::sync::LazyLock;

use regex::Regex;

/// Complete CSI, OSC, DCS/SOS/PM/APC, charset and two-byte escapes.
static ESCAPE_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[PX^_][^\x1b]*\x1b\\",
        r"|\x1b[()#][0-9A-Za-z]",
        r"|\x1b[@-OQ-WYZ\\=>78c]",
    ))
    .expect("escape sequence pattern is valid")
});

/// An escape sequence truncated by the end of the buffer.
static TRAILING_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[0-?]*[ -/]*|\][^\x07\x1b]*|[PX^_][^\x1b]*|[()#])?$")
        .expect("trailing escape pattern is valid")
});

/// Non-printable control bytes other than tab and newline.
static CONTROL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0B-\x1F\x7F]").expect("control pattern is valid")
});

/// Remnants of escapes whose ESC byte was lost in transit.
static FRAGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\?[0-9;]*[hl]|\[[0-9;]*m|\[[0-9]*[JK]|^\][0-9]+;.*$")
        .expect("fragment pattern is valid")
});

/// Prompt echo such as `user@host:~/src$ ls`.
static PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[A-Za-z0-9._-]+@[A-Za-z0-9._-]+:\S*[$#](?:\s.*)?$")
        .expect("prompt pattern is valid")
});

/// Clean raw shell output.
///
/// Removes escape sequences, carriage returns and control bytes, then drops
/// lines containing `end_marker` and prompt echo lines. Idempotent.
#[must_use]
pub fn sanitize(raw: &str, end_marker: &str) -> String {
    let text = ESCAPE_SEQUENCE.replace_all(raw, "");
    let text = TRAILING_ESCAPE.replace(&text, "");
    let text = CONTROL.replace_all(&text, "");

    text.split('\n')
        .map(strip_fragments)
        .filter(|line| end_marker.is_empty() || !line.contains(end_marker))
        .filter(|line| !PROMPT.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Removing one fragment can splice a new one together, as in `arr[[0mm]`.
fn strip_fragments(line: &str) -> String {
    let mut line = line.to_string();
    loop {
        let stripped = FRAGMENT.replace_all(&line, "");
        if stripped.len() == line.len() {
            return line;
        }
        line = stripped.into_owned();
    }
}

/// Sanitize command output and drop trailing line breaks.
#[must_use]
pub fn clean_output(raw: &str, end_marker: &str) -> String {
    let mut cleaned = sanitize(raw, end_marker);
    let trimmed = cleaned.trim_end_matches('\n').len();
    cleaned.truncate(trimmed);
    cleaned
}
