//! Buffer size tokens for working-set declarations.
//!
//! ```text
//! 4096        one 4096 byte buffer
//! 4k          one 4 KiB buffer (k/m/g, either case, powers of 1024)
//! 10n4k       ten 4 KiB buffers
//! 4096-16k    one buffer, size drawn from [4096, 16384] at allocation
//! 4k/2n1m     several tokens separated by '/'
//! ```

use super::step::BufferSize;

/// Parse a single size such as `4096` or `16M`. Returns `None` for zero or malformed input.
pub fn parse_size(text: &str) -> Option<u64> {
    let (digits, mult) = match text.as_bytes().last()? {
        b'k' | b'K' => (&text[..text.len() - 1], 1u64 << 10),
        b'm' | b'M' => (&text[..text.len() - 1], 1u64 << 20),
        b'g' | b'G' => (&text[..text.len() - 1], 1u64 << 30),
        b'0'..=b'9' => (text, 1),
        _ => return None,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    if value == 0 {
        return None;
    }
    value.checked_mul(mult)
}

/// Parse one `[Cn]SIZE[-SIZE]` token into `C` identical size specs.
fn parse_buffer_token(token: &str) -> Option<Vec<BufferSize>> {
    let (count, rest) = match token.split_once('n') {
        Some((count, rest)) => {
            let count: usize = count.parse().ok()?;
            if count == 0 {
                return None;
            }
            (count, rest)
        }
        None => (1, token),
    };

    let (min, max) = match rest.split_once('-') {
        Some((min, max)) => (parse_size(min)?, parse_size(max)?),
        None => {
            let size = parse_size(rest)?;
            (size, size)
        }
    };
    if max < min {
        return None;
    }

    Some(vec![BufferSize { min, max }; count])
}

/// Parse a `/`-separated list of buffer tokens, appending to `out`.
///
/// Returns `false` on the first malformed token.
pub fn parse_buffer_list(text: &str, out: &mut Vec<BufferSize>) -> bool {
    if text.is_empty() {
        return false;
    }
    for token in text.split('/') {
        match parse_buffer_token(token) {
            Some(sizes) => out.extend(sizes),
            None => return false,
        }
    }
    true
}
