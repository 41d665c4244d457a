//! Line framing shared by the BOB and SAM grammars

use crate::error::{GrammarError, Result};

/// Outcome of running a grammar rule over buffered bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// A full unit was recognised; `consumed` bytes may be discarded
    Complete { value: T, consumed: usize },

    /// The buffer holds a valid prefix but not yet a full unit
    Incomplete,
}

impl<T> Parsed<T> {
    /// Map the parsed value, keeping the consumed count
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Parsed<U> {
        match self {
            Parsed::Complete { value, consumed } => Parsed::Complete {
                value: f(value),
                consumed,
            },
            Parsed::Incomplete => Parsed::Incomplete,
        }
    }

    /// Whether a full unit was recognised
    pub fn is_complete(&self) -> bool {
        matches!(self, Parsed::Complete { .. })
    }
}

/// Split the next `\n`-terminated line off `input[offset..]`.
///
/// Returns the line (without terminator, trailing `\r` stripped) and the
/// offset just past the terminator, or `None` if no terminator is buffered.
pub fn next_line(input: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let rest = input.get(offset..)?;
    let end = rest.iter().position(|byte| *byte == b'\n')?;
    let mut line = &rest[..end];
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    }

    Some((line, offset + end + 1))
}

/// Decode a line as UTF-8
pub fn line_str(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line).map_err(|_| GrammarError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_line_needs_terminator() {
        assert_eq!(next_line(b"OK partial", 0), None);
        assert_eq!(next_line(b"", 0), None);
    }

    #[test]
    fn test_next_line_offsets() {
        let input = b"first\nsecond\r\nthird";
        let (line, offset) = next_line(input, 0).unwrap();
        assert_eq!(line, b"first");
        assert_eq!(offset, 6);

        let (line, offset) = next_line(input, offset).unwrap();
        assert_eq!(line, b"second");
        assert_eq!(offset, 14);

        assert_eq!(next_line(input, offset), None);
    }

    #[test]
    fn test_parsed_map() {
        let parsed = Parsed::Complete {
            value: 2,
            consumed: 5,
        };
        assert_eq!(
            parsed.map(|v| v * 2),
            Parsed::Complete {
                value: 4,
                consumed: 5
            }
        );
        assert!(!Parsed::<u8>::Incomplete.is_complete());
    }
}
