//! Peer address preamble
//!
//! The first line received on an accepted SAM stream (and on a BOB server
//! tunnel connection) names the remote peer:
//!
//! ```text
//! <destination> [FROM_PORT=n TO_PORT=m]\n
//! ```

use crate::error::{GrammarError, Result};
use crate::line::{line_str, next_line, Parsed};
use crate::sam::parse_key_value_pairs;

/// Remote peer announced ahead of the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLine {
    pub destination: String,
    pub from_port: Option<u16>,
    pub to_port: Option<u16>,
}

impl PeerLine {
    /// Parse the preamble from the front of `input`; the remaining bytes are
    /// application payload
    pub fn parse(input: &[u8]) -> Result<Parsed<PeerLine>> {
        let Some((line, consumed)) = next_line(input, 0) else {
            return Ok(Parsed::Incomplete);
        };

        let value = PeerLine::parse_line(line_str(line)?)?;
        Ok(Parsed::Complete { value, consumed })
    }

    /// Parse a single framed preamble line
    pub fn parse_line(line: &str) -> Result<PeerLine> {
        let line = line.trim();
        let (destination, options) = match line.split_once(' ') {
            Some((destination, options)) => (destination, options),
            None => (line, ""),
        };
        if destination.is_empty() {
            return Err(GrammarError::MalformedLine(line.to_string()));
        }

        let (rest, pairs) = parse_key_value_pairs(options)
            .map_err(|_| GrammarError::MalformedLine(line.to_string()))?;
        if !rest.trim().is_empty() {
            return Err(GrammarError::MalformedLine(line.to_string()));
        }

        let port = |field: &'static str| -> Result<Option<u16>> {
            pairs
                .get(field)
                .map(|value| {
                    value.parse::<u16>().map_err(|_| GrammarError::InvalidField {
                        field,
                        value: value.clone(),
                    })
                })
                .transpose()
        };

        Ok(PeerLine {
            destination: destination.to_string(),
            from_port: port("FROM_PORT")?,
            to_port: port("TO_PORT")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_line_with_ports() {
        let input = b"spam FROM_PORT=34444 TO_PORT=0\nEgg and spam";
        match PeerLine::parse(input).unwrap() {
            Parsed::Complete { value, consumed } => {
                assert_eq!(
                    value,
                    PeerLine {
                        destination: "spam".to_string(),
                        from_port: Some(34444),
                        to_port: Some(0),
                    }
                );
                assert_eq!(&input[consumed..], b"Egg and spam");
            }
            Parsed::Incomplete => panic!("expected a complete preamble"),
        }
    }

    #[test]
    fn test_bare_destination() {
        let peer = PeerLine::parse_line("spam\n").unwrap();
        assert_eq!(peer.destination, "spam");
        assert_eq!(peer.from_port, None);
        assert_eq!(peer.to_port, None);
    }

    #[test]
    fn test_split_preamble_is_incomplete() {
        assert_eq!(
            PeerLine::parse(b"spam FROM_PORT=34444 T").unwrap(),
            Parsed::Incomplete
        );
    }

    #[test]
    fn test_invalid_port() {
        assert!(matches!(
            PeerLine::parse_line("spam FROM_PORT=99999"),
            Err(GrammarError::InvalidField { field: "FROM_PORT", .. })
        ));
        assert!(PeerLine::parse_line("\n").is_err());
    }
}
