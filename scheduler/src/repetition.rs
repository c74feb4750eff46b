/// Longest block of lines checked for repetition.
pub const MAX_PATTERN_LINES: usize = 5;

/// Whether the tail of `text` repeats one block of 1 to
/// [`MAX_PATTERN_LINES`] lines more than `max_repeats` times in a row.
///
/// A trailing newline does not open an extra empty line, so `"a\na\n"` is two
/// lines. The last line counts even when it is not yet terminated.
pub fn exceeds_repetition(text: &str, max_repeats: usize) -> bool {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    let needed = max_repeats + 1;
    (1..=MAX_PATTERN_LINES).any(|size| {
        if lines.len() < size * needed {
            return false;
        }
        let tail = &lines[lines.len() - size * needed..];
        let block = &tail[tail.len() - size..];
        tail.chunks(size).all(|chunk| chunk == block)
    })
}
