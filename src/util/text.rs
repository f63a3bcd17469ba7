use std::borrow::Cow;

/// Removes control characters from feed-supplied text.
///
/// C0 and C1 controls and DEL are dropped, including inside ANSI escape
/// sequences (the ESC byte goes; the printable tail of the sequence stays).
/// Tab, line feed and carriage return are kept here; callers that need a
/// single line collapse whitespace themselves.
///
/// Returns `Cow::Borrowed` when nothing needs stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|&c| !is_stripped(c)).collect())
}

fn is_stripped(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

/// Joins the raw text runs collected for a field, strips control characters
/// and trims the result once.
///
/// Runs are concatenated as-is: whitespace between runs is significant until
/// the final trim, so `["  Hello ", "World  "]` becomes `"Hello World"`.
pub fn join_text_runs<S: AsRef<str>>(runs: &[S]) -> String {
    let joined: String = runs.iter().map(AsRef::as_ref).collect();
    strip_control_chars(&joined).trim().to_string()
}
