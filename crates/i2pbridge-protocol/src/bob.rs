//! BOB reply grammar
//!
//! BOB replies are newline-terminated lines framed as:
//! - `OK [info]` for success
//! - `ERROR info` for failure
//! - `DATA payload` for auxiliary items preceding a terminal `OK`/`ERROR`
//!
//! A freshly opened control connection first announces itself with a
//! `BOB <version>` banner followed by `OK`.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_till1},
    character::complete::{char, digit1, multispace0, space0},
    combinator::{eof, map, map_res, rest, value},
    sequence::{preceded, tuple},
    IResult,
};

use crate::error::{GrammarError, Result};
use crate::line::{line_str, next_line, Parsed};

/// Literal used by BOB for an unconfigured port
pub const PORT_NOT_SET: &str = "not_set";

/// Which reply shape the receiver currently expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BobRule {
    /// Version banner followed by `OK`
    Init,

    /// A single `OK`/`ERROR` line
    Reply,

    /// Zero or more `DATA` lines closed by `OK`/`ERROR`
    List,
}

/// A fully tokenized BOB reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BobReply {
    /// Connection banner
    Init { version: String },

    /// Terminal status line
    Status { success: bool, info: String },

    /// `DATA` items plus the terminal status line
    List {
        success: bool,
        info: String,
        data: Vec<String>,
    },
}

impl BobReply {
    /// Whether the router reported success
    pub fn success(&self) -> bool {
        match self {
            BobReply::Init { .. } => true,
            BobReply::Status { success, .. } | BobReply::List { success, .. } => *success,
        }
    }

    /// Freeform info text of the terminal line
    pub fn info(&self) -> &str {
        match self {
            BobReply::Init { version } => version,
            BobReply::Status { info, .. } | BobReply::List { info, .. } => info,
        }
    }

    /// `DATA` items, empty for non-list replies
    pub fn data(&self) -> &[String] {
        match self {
            BobReply::List { data, .. } => data,
            _ => &[],
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Ok(&'a str),
    Error(&'a str),
    Data(&'a str),
}

fn parse_info(input: &str) -> IResult<&str, &str> {
    alt((preceded(char(' '), rest), map(eof, |_| "")))(input)
}

fn parse_line(input: &str) -> IResult<&str, Line<'_>> {
    alt((
        map(preceded(tag("OK"), parse_info), Line::Ok),
        map(preceded(tag("ERROR"), parse_info), Line::Error),
        map(preceded(tag("DATA "), rest), Line::Data),
    ))(input)
}

fn tokenize(line: &[u8]) -> Result<Line<'_>> {
    let text = line_str(line)?;
    match parse_line(text) {
        Ok((_, parsed)) => Ok(parsed),
        Err(_) => Err(GrammarError::MalformedLine(text.to_string())),
    }
}

/// Parse one reply of shape `rule` from the front of `input`.
///
/// Nothing is consumed until a whole reply is buffered, so the caller can
/// append more bytes and call again after [`Parsed::Incomplete`].
pub fn parse(rule: BobRule, input: &[u8]) -> Result<Parsed<BobReply>> {
    match rule {
        BobRule::Init => parse_init(input),
        BobRule::Reply => parse_reply(input),
        BobRule::List => parse_list(input),
    }
}

fn parse_init(input: &[u8]) -> Result<Parsed<BobReply>> {
    let Some((banner, offset)) = next_line(input, 0) else {
        return Ok(Parsed::Incomplete);
    };
    let banner = line_str(banner)?;
    let version = banner
        .strip_prefix("BOB ")
        .ok_or_else(|| GrammarError::UnexpectedReply {
            expected: "BOB banner",
            found: banner.to_string(),
        })?
        .trim()
        .to_string();

    let Some((status, consumed)) = next_line(input, offset) else {
        return Ok(Parsed::Incomplete);
    };
    match tokenize(status)? {
        Line::Ok(_) => Ok(Parsed::Complete {
            value: BobReply::Init { version },
            consumed,
        }),
        other => Err(GrammarError::UnexpectedReply {
            expected: "OK after banner",
            found: format!("{other:?}"),
        }),
    }
}

fn parse_reply(input: &[u8]) -> Result<Parsed<BobReply>> {
    let Some((line, consumed)) = next_line(input, 0) else {
        return Ok(Parsed::Incomplete);
    };

    let (success, info) = match tokenize(line)? {
        Line::Ok(info) => (true, info),
        Line::Error(info) => (false, info),
        Line::Data(payload) => {
            return Err(GrammarError::UnexpectedReply {
                expected: "OK or ERROR",
                found: format!("DATA {payload}"),
            })
        }
    };

    Ok(Parsed::Complete {
        value: BobReply::Status {
            success,
            info: info.to_string(),
        },
        consumed,
    })
}

fn parse_list(input: &[u8]) -> Result<Parsed<BobReply>> {
    let mut data = Vec::new();
    let mut offset = 0;

    while let Some((line, next)) = next_line(input, offset) {
        offset = next;
        let (success, info) = match tokenize(line)? {
            Line::Data(payload) => {
                data.push(payload.to_string());
                continue;
            }
            Line::Ok(info) => (true, info),
            Line::Error(info) => (false, info),
        };

        return Ok(Parsed::Complete {
            value: BobReply::List {
                success,
                info: info.to_string(),
                data,
            },
            consumed: offset,
        });
    }

    Ok(Parsed::Incomplete)
}

/// One tunnel as reported by `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub nickname: String,
    pub starting: bool,
    pub running: bool,
    pub stopping: bool,
    pub keys: bool,
    pub quiet: bool,

    /// `None` when the router reports `not_set`
    pub inport: Option<u16>,
    pub inhost: String,

    /// `None` when the router reports `not_set`
    pub outport: Option<u16>,
    pub outhost: String,
}

fn labeled<'a, O>(
    label: &'static str,
    mut inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    move |input: &'a str| {
        let (input, _) = tuple((multispace0, tag(label), char(':'), space0))(input)?;
        inner(input)
    }
}

fn parse_token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

fn parse_bool(input: &str) -> IResult<&str, bool> {
    alt((value(true, tag("true")), value(false, tag("false"))))(input)
}

fn parse_port(input: &str) -> IResult<&str, Option<u16>> {
    alt((
        value(None, tag(PORT_NOT_SET)),
        map_res(digit1, |digits: &str| digits.parse::<u16>().map(Some)),
    ))(input)
}

impl TunnelStatus {
    /// Parse a tunnel status record, with or without its `DATA ` prefix.
    ///
    /// Fields must appear in the router's fixed order.
    pub fn parse(input: &str) -> Result<Self> {
        let record = input.trim_end_matches(['\r', '\n']);
        let record = record.strip_prefix("DATA ").unwrap_or(record);

        let parsed = tuple((
            labeled("NICKNAME", parse_token),
            labeled("STARTING", parse_bool),
            labeled("RUNNING", parse_bool),
            labeled("STOPPING", parse_bool),
            labeled("KEYS", parse_bool),
            labeled("QUIET", parse_bool),
            labeled("INPORT", parse_port),
            labeled("INHOST", parse_token),
            labeled("OUTPORT", parse_port),
            labeled("OUTHOST", parse_token),
        ))(record);

        match parsed {
            Ok((rest, fields)) if rest.trim().is_empty() => {
                let (nickname, starting, running, stopping, keys, quiet, inport, inhost, outport, outhost) =
                    fields;

                Ok(Self {
                    nickname: nickname.to_string(),
                    starting,
                    running,
                    stopping,
                    keys,
                    quiet,
                    inport,
                    inhost: inhost.to_string(),
                    outport,
                    outhost: outhost.to_string(),
                })
            }
            _ => Err(GrammarError::MalformedLine(record.to_string())),
        }
    }

    /// Ports this tunnel occupies on the local host
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.inport.into_iter().chain(self.outport)
    }
}
