//! SAM v3 reply grammar
//!
//! Every reply is a single line made of a two-token command name followed by
//! `KEY=VALUE` tokens, values containing spaces being double-quoted. Once a
//! session is in its keepalive phase the router may also interleave bare
//! `PING [token]`/`PONG [token]` lines.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{escaped, is_not, tag, take_while1},
    character::complete::{alpha1, alphanumeric1, char, multispace0},
    combinator::{map, opt, recognize, rest},
    multi::{many0, many0_count},
    sequence::{delimited, pair, preceded, separated_pair, tuple},
    IResult, Parser,
};
use serde::{Deserialize, Serialize};

use crate::error::{GrammarError, Result};
use crate::line::{line_str, next_line, Parsed};

/// A SAM protocol version with trailing `.0` components ignored for ordering
///
/// `3.2` and `3.2.0` compare equal, `3.10` is newer than `3.9`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SamVersion {
    raw: String,
    parts: Vec<u32>,
}

impl SamVersion {
    /// Version from `major.minor`
    pub fn new(major: u32, minor: u32) -> Self {
        let raw = format!("{major}.{minor}");
        let mut parts = vec![major, minor];
        normalize(&mut parts);
        Self { raw, parts }
    }

    /// Version as reported on the wire
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this version is at least `major.minor`
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= SamVersion::new(major, minor)
    }
}

fn normalize(parts: &mut Vec<u32>) {
    while parts.len() > 1 && parts.last() == Some(&0) {
        parts.pop();
    }
}

impl FromStr for SamVersion {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || GrammarError::InvalidField {
            field: "VERSION",
            value: s.to_string(),
        };

        let mut parts = s
            .split('.')
            .map(|part| part.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;
        normalize(&mut parts);

        Ok(Self {
            raw: s.to_string(),
            parts,
        })
    }
}

impl TryFrom<String> for SamVersion {
    type Error = GrammarError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SamVersion> for String {
    fn from(value: SamVersion) -> Self {
        value.raw
    }
}

impl fmt::Display for SamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for SamVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for SamVersion {}

impl Hash for SamVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl PartialOrd for SamVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SamVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

/// `RESULT=` code of a SAM reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamResult {
    Ok,
    CantReachPeer,
    DuplicatedDest,
    DuplicatedId,
    I2pError,
    InvalidKey,
    InvalidId,
    KeyNotFound,
    PeerNotFound,
    Timeout,
    AlreadyAccepting,

    /// Code not known to this library
    Unknown(String),
}

impl SamResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, SamResult::Ok)
    }

    pub fn as_str(&self) -> &str {
        match self {
            SamResult::Ok => "OK",
            SamResult::CantReachPeer => "CANT_REACH_PEER",
            SamResult::DuplicatedDest => "DUPLICATED_DEST",
            SamResult::DuplicatedId => "DUPLICATED_ID",
            SamResult::I2pError => "I2P_ERROR",
            SamResult::InvalidKey => "INVALID_KEY",
            SamResult::InvalidId => "INVALID_ID",
            SamResult::KeyNotFound => "KEY_NOT_FOUND",
            SamResult::PeerNotFound => "PEER_NOT_FOUND",
            SamResult::Timeout => "TIMEOUT",
            SamResult::AlreadyAccepting => "ALREADY_ACCEPTING",
            SamResult::Unknown(code) => code,
        }
    }
}

impl From<&str> for SamResult {
    fn from(code: &str) -> Self {
        match code {
            "OK" => SamResult::Ok,
            "CANT_REACH_PEER" => SamResult::CantReachPeer,
            "DUPLICATED_DEST" => SamResult::DuplicatedDest,
            "DUPLICATED_ID" => SamResult::DuplicatedId,
            "I2P_ERROR" => SamResult::I2pError,
            "INVALID_KEY" => SamResult::InvalidKey,
            "INVALID_ID" => SamResult::InvalidId,
            "KEY_NOT_FOUND" => SamResult::KeyNotFound,
            "PEER_NOT_FOUND" => SamResult::PeerNotFound,
            "TIMEOUT" => SamResult::Timeout,
            "ALREADY_ACCEPTING" => SamResult::AlreadyAccepting,
            other => SamResult::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for SamResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully tokenized SAM reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamReply {
    /// `HELLO REPLY`
    Hello {
        result: SamResult,
        version: Option<SamVersion>,
        message: Option<String>,
    },

    /// `SESSION STATUS`
    SessionStatus {
        result: SamResult,
        destination: Option<String>,
        message: Option<String>,
    },

    /// `STREAM STATUS`
    StreamStatus {
        result: SamResult,
        message: Option<String>,
    },

    /// `NAMING REPLY`
    NamingReply {
        result: SamResult,
        name: Option<String>,
        value: Option<String>,
        message: Option<String>,
    },

    /// `DEST REPLY`; the router only sends `RESULT` on failure
    DestReply {
        result: SamResult,
        public: Option<String>,
        private: Option<String>,
        message: Option<String>,
    },

    /// Keepalive probe from the router
    Ping(Option<String>),

    /// Answer to one of our probes
    Pong(Option<String>),
}

impl SamReply {
    /// `RESULT` code, `None` for keepalive lines
    pub fn result(&self) -> Option<&SamResult> {
        match self {
            SamReply::Hello { result, .. }
            | SamReply::SessionStatus { result, .. }
            | SamReply::StreamStatus { result, .. }
            | SamReply::NamingReply { result, .. }
            | SamReply::DestReply { result, .. } => Some(result),
            SamReply::Ping(_) | SamReply::Pong(_) => None,
        }
    }

    /// `MESSAGE` text, if the router supplied one
    pub fn message(&self) -> Option<&str> {
        match self {
            SamReply::Hello { message, .. }
            | SamReply::SessionStatus { message, .. }
            | SamReply::StreamStatus { message, .. }
            | SamReply::NamingReply { message, .. }
            | SamReply::DestReply { message, .. } => message.as_deref(),
            SamReply::Ping(_) | SamReply::Pong(_) => None,
        }
    }

    /// Whether this is an out-of-band keepalive line
    pub fn is_keepalive(&self) -> bool {
        matches!(self, SamReply::Ping(_) | SamReply::Pong(_))
    }

    /// Parse one reply line from the front of `input`
    pub fn parse(input: &[u8]) -> Result<Parsed<SamReply>> {
        let Some((line, consumed)) = next_line(input, 0) else {
            return Ok(Parsed::Incomplete);
        };

        let text = line_str(line)?;
        let value = SamReply::parse_line(text)?;

        Ok(Parsed::Complete { value, consumed })
    }

    /// Parse a single, already framed reply line
    pub fn parse_line(line: &str) -> Result<SamReply> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Ok((_, (keyword, token))) = parse_keepalive(line) {
            let token = token.map(str::to_string);
            return Ok(match keyword {
                "PING" => SamReply::Ping(token),
                _ => SamReply::Pong(token),
            });
        }

        let (rest, (command, subcommand, pairs)) =
            parse_command(line).map_err(|_| GrammarError::MalformedLine(line.to_string()))?;
        if !rest.trim().is_empty() {
            return Err(GrammarError::MalformedLine(line.to_string()));
        }

        let mut fields = Fields { line, pairs };
        match (command, subcommand) {
            ("HELLO", "REPLY") => Ok(SamReply::Hello {
                result: fields.result()?,
                version: fields
                    .take("VERSION")
                    .map(|v| v.parse::<SamVersion>())
                    .transpose()?,
                message: fields.take("MESSAGE"),
            }),
            ("SESSION", "STATUS") => Ok(SamReply::SessionStatus {
                result: fields.result()?,
                destination: fields.take("DESTINATION"),
                message: fields.take("MESSAGE"),
            }),
            ("STREAM", "STATUS") => Ok(SamReply::StreamStatus {
                result: fields.result()?,
                message: fields.take("MESSAGE"),
            }),
            ("NAMING", "REPLY") => Ok(SamReply::NamingReply {
                result: fields.result()?,
                name: fields.take("NAME"),
                value: fields.take("VALUE"),
                message: fields.take("MESSAGE"),
            }),
            ("DEST", "REPLY") => Ok(SamReply::DestReply {
                result: fields
                    .take("RESULT")
                    .map(|code| SamResult::from(code.as_str()))
                    .unwrap_or(SamResult::Ok),
                public: fields.take("PUB"),
                private: fields.take("PRIV"),
                message: fields.take("MESSAGE"),
            }),
            _ => Err(GrammarError::UnexpectedReply {
                expected: "SAM reply",
                found: line.to_string(),
            }),
        }
    }
}

struct Fields<'a> {
    line: &'a str,
    pairs: HashMap<&'a str, String>,
}

impl Fields<'_> {
    fn take(&mut self, key: &str) -> Option<String> {
        self.pairs.remove(key)
    }

    fn result(&mut self) -> Result<SamResult> {
        self.take("RESULT")
            .map(|code| SamResult::from(code.as_str()))
            .ok_or_else(|| GrammarError::MissingField {
                field: "RESULT",
                line: self.line.to_string(),
            })
    }
}

fn parse_keepalive(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let (input, keyword) = alt((tag("PING"), tag("PONG")))(input)?;
    let (input, token) = alt((
        map(nom::combinator::eof, |_| None),
        map(preceded(char(' '), rest), |token: &str| {
            let token = token.trim();
            (!token.is_empty()).then_some(token)
        }),
    ))(input)?;

    Ok((input, (keyword, token)))
}

type Command<'a> = (&'a str, &'a str, HashMap<&'a str, String>);

fn parse_command(input: &str) -> IResult<&str, Command<'_>> {
    let (input, (command, _, subcommand, pairs)) = tuple((
        alt((
            tag("HELLO"),
            tag("SESSION"),
            tag("STREAM"),
            tag("NAMING"),
            tag("DEST"),
        )),
        char(' '),
        alt((tag("REPLY"), tag("STATUS"))),
        opt(parse_key_value_pairs),
    ))(input)?;

    Ok((input, (command, subcommand, pairs.unwrap_or_default())))
}

/// Parse space separated `KEY=VALUE` tokens, unquoting quoted values
pub fn parse_key_value_pairs(input: &str) -> IResult<&str, HashMap<&str, String>> {
    let (input, pairs) = many0(preceded(multispace0, parse_key_value))(input)?;
    Ok((input, pairs.into_iter().collect()))
}

fn parse_key_value(input: &str) -> IResult<&str, (&str, String)> {
    separated_pair(parse_key, char('='), parse_value)(input)
}

fn parse_key(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_"), tag(".")))),
    ))
    .parse(input)
}

fn parse_value(input: &str) -> IResult<&str, String> {
    alt((
        map(parse_quoted_value, unescape),
        map(take_while1(|c: char| !c.is_whitespace()), str::to_string),
        map(tag(""), str::to_string),
    ))(input)
}

fn parse_quoted_value(input: &str) -> IResult<&str, &str> {
    alt((
        map(tag("\"\""), |_| ""),
        delimited(
            char('"'),
            escaped(is_not("\\\""), '\\', alt((tag("\""), tag("\\")))),
            char('"'),
        ),
    ))(input)
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

/// Quote `value` for use in an outgoing `KEY=VALUE` token when needed
pub fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\t', '"', '\\']) {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
