//! Splits a byte buffer into complete newline-terminated lines.

const TERMINATOR: u8 = b'\n';

/// Scans `buffer` left to right and splits off one line per terminator
/// found, terminator included. Returns the complete lines in order plus the
/// unterminated tail.
///
/// Pure and re-entrant; called once per readable chunk per connection. No
/// maximum line length is enforced here; the registry's buffer limit is
/// where an endless unterminated stream gets cut off.
pub fn extract_lines(buffer: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut lines = Vec::new();
    let mut rest = buffer;

    while let Some(pos) = rest.iter().position(|&byte| byte == TERMINATOR) {
        let (line, tail) = rest.split_at(pos + 1);
        lines.push(line.to_vec());
        rest = tail;
    }

    (lines, rest.to_vec())
}
