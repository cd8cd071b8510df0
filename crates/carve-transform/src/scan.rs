//! Minimal Rust lexing: enough to find delimiters and keywords while skipping
//! comments, string literals, raw strings and char literals.
//!
//! All offsets are byte offsets into the source. Every byte this module stops
//! on is ASCII, so offsets are always valid `str` slice boundaries.

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn utf8_width(first: u8) -> usize {
    match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

/// Index just past a quoted literal whose body starts at `start`.
fn skip_quoted(b: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start;
    while i < b.len() {
        match b[i] {
            b'\\' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    b.len()
}

fn skip_block_comment(b: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < b.len() {
        match (b[i], b[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    b.len()
}

/// `r"..."`, `r#"..."#`, ... starting at the `r`.
fn skip_raw_string(b: &[u8], r: usize) -> Option<usize> {
    let mut i = r + 1;
    let mut hashes = 0;
    while b.get(i) == Some(&b'#') {
        hashes += 1;
        i += 1;
    }
    if b.get(i) != Some(&b'"') {
        return None;
    }
    i += 1;
    while i < b.len() {
        if b[i] == b'"' && b[i + 1..].iter().take(hashes).filter(|&&c| c == b'#').count() == hashes {
            return Some(i + 1 + hashes);
        }
        i += 1;
    }
    Some(b.len())
}

/// A char literal starting at the quote, or `None` for a lifetime or label.
fn skip_char_literal(b: &[u8], quote: usize) -> Option<usize> {
    match b.get(quote + 1) {
        Some(b'\\') => Some(skip_quoted(b, quote + 1, b'\'')),
        Some(&c) => {
            let end = quote + 1 + utf8_width(c);
            (b.get(end) == Some(&b'\'')).then_some(end + 1)
        }
        None => None,
    }
}

/// If a comment or literal starts at `i`, the index just past it.
fn skip_non_code(b: &[u8], i: usize) -> Option<usize> {
    let prev_is_ident = i > 0 && is_ident_byte(b[i - 1]);
    match b[i] {
        b'/' if b.get(i + 1) == Some(&b'/') => Some(
            b[i..]
                .iter()
                .position(|&c| c == b'\n')
                .map_or(b.len(), |p| i + p),
        ),
        b'/' if b.get(i + 1) == Some(&b'*') => Some(skip_block_comment(b, i)),
        b'"' => Some(skip_quoted(b, i + 1, b'"')),
        b'\'' => skip_char_literal(b, i),
        b'b' if !prev_is_ident => match b.get(i + 1) {
            Some(b'"') => Some(skip_quoted(b, i + 2, b'"')),
            Some(b'\'') => skip_char_literal(b, i + 1),
            Some(b'r') => skip_raw_string(b, i + 1),
            _ => None,
        },
        b'c' if !prev_is_ident && b.get(i + 1) == Some(&b'"') => Some(skip_quoted(b, i + 2, b'"')),
        b'r' if !prev_is_ident => skip_raw_string(b, i),
        _ => None,
    }
}

/// Per-byte flag: `true` where the byte is code rather than a comment or literal.
pub fn code_mask(src: &str) -> Vec<bool> {
    let b = src.as_bytes();
    let mut mask = vec![true; b.len()];
    let mut i = 0;
    while i < b.len() {
        match skip_non_code(b, i) {
            Some(end) => {
                let end = end.min(b.len());
                mask[i..end].fill(false);
                i = end;
            }
            None => i += 1,
        }
    }
    mask
}

pub fn is_open(b: u8) -> bool {
    matches!(b, b'(' | b'[' | b'{')
}

pub fn closer_of(open: u8) -> Option<u8> {
    match open {
        b'(' => Some(b')'),
        b'[' => Some(b']'),
        b'{' => Some(b'}'),
        _ => None,
    }
}

/// Index of the delimiter closing the one at `open`. `None` if `open` is not
/// an opening delimiter or the nesting is unbalanced.
pub fn matching_delimiter(src: &str, open: usize) -> Option<usize> {
    let b = src.as_bytes();
    if !is_open(*b.get(open)?) {
        return None;
    }
    let mut stack: Vec<u8> = Vec::new();
    let mut i = open;
    while i < b.len() {
        if let Some(end) = skip_non_code(b, i) {
            i = end;
            continue;
        }
        match b[i] {
            c if is_open(c) => stack.push(c),
            c @ (b')' | b']' | b'}') => {
                let opener = stack.pop()?;
                if closer_of(opener) != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// First index at or after `pos` that is neither whitespace nor a comment.
pub fn skip_trivia(src: &str, pos: usize) -> usize {
    let b = src.as_bytes();
    let mut i = pos;
    while i < b.len() {
        if b[i].is_ascii_whitespace() {
            i += 1;
        } else if b[i] == b'/' && matches!(b.get(i + 1), Some(b'/' | b'*')) {
            i = skip_non_code(b, i).unwrap_or(i + 1);
        } else {
            break;
        }
    }
    i
}

/// Byte offset where the line containing `pos` begins.
pub fn line_start(src: &str, pos: usize) -> usize {
    src[..pos].rfind('\n').map_or(0, |n| n + 1)
}

/// Leading whitespace of the line containing `pos`.
pub fn line_indent(src: &str, pos: usize) -> &str {
    let line = &src[line_start(src, pos)..];
    let width = line.len() - line.trim_start_matches([' ', '\t']).len();
    &line[..width]
}
