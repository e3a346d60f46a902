//! Wire-level line syntax.
//!
//! The protocol is 8-bit clean and line oriented: every message is one line
//! terminated by `LF` (a single `CR` before the `LF` is tolerated and
//! stripped). Binary payload travels in `D` lines with `%`, `CR` and `LF`
//! percent-escaped, so the three framing-sensitive bytes never appear raw:
//!
//! ```text
//! Command:  VERB[ ARGS]LF
//! Replies:  OK[ INFO] | ERR CODE[ DESC] | S KEYWORD[ ARGS]
//!           | D ENCODED_BYTES | INQUIRE KEYWORD[ ARGS]
//!           | END | CAN | # TEXT
//! ```
//!
//! # Example
//!
//! ```
//! use assuan_ipc::protocol::{decode_percent, Reply};
//!
//! let reply = Reply::parse(b"ERR 275 Unknown command").unwrap();
//! assert!(matches!(reply, Reply::Err { code: 275, .. }));
//!
//! assert_eq!(decode_percent(b"ab%25c%0D").unwrap(), b"ab%c\r");
//! ```

use crate::error::{Error, Result};

/// Maximum length of a line on the wire, including the `CR LF` framing.
pub const MAX_LINELEN: usize = 1002;

/// Maximum line content before the terminator. The writer never starts an
/// escape sequence that would push a line past this bound; it splits into a
/// fresh `D` line instead.
pub const MAX_PAYLOAD: usize = 1000;

/// Number of bytes `byte` occupies inside a `D` line.
#[inline]
pub fn escaped_len(byte: u8) -> usize {
    match byte {
        b'%' | b'\r' | b'\n' => 3,
        _ => 1,
    }
}

/// Append `byte` to `out` in `D`-line encoding.
#[inline]
pub fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    match byte {
        b'%' => out.extend_from_slice(b"%25"),
        b'\r' => out.extend_from_slice(b"%0D"),
        b'\n' => out.extend_from_slice(b"%0A"),
        _ => out.push(byte),
    }
}

/// Decode the percent-escaped payload of a `D` line.
///
/// Any `%XX` hex pair decodes to the corresponding byte; a `%` not followed
/// by two hex digits is a protocol violation.
pub fn decode_percent(src: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if src[i] == b'%' {
            let hi = src.get(i + 1).and_then(|b| (*b as char).to_digit(16));
            let lo = src.get(i + 2).and_then(|b| (*b as char).to_digit(16));
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    out.push(((hi << 4) | lo) as u8);
                    i += 3;
                }
                _ => return Err(Error::InvalidResponse),
            }
        } else {
            out.push(src[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// A parsed reply-stream line.
///
/// `D` payloads are decoded; everything else is carried as text. Multiple
/// consecutive [`Reply::Data`] lines form one logical payload, terminated by
/// the next non-`D` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Terminal success, with optional informational text.
    Ok(Option<String>),
    /// Terminal failure with a numeric code and optional description.
    Err {
        /// Stable numeric error code.
        code: u32,
        /// Optional human-readable description.
        description: Option<String>,
    },
    /// Out-of-band status update; repeatable, never terminal.
    Status {
        /// Status keyword.
        keyword: String,
        /// Remainder of the line after the keyword.
        args: String,
    },
    /// One decoded chunk of inline data.
    Data(Vec<u8>),
    /// The server asks the peer for additional data mid-command.
    Inquire {
        /// Inquiry keyword.
        keyword: String,
        /// Remainder of the line after the keyword.
        args: String,
    },
    /// Terminates a multi-`D` exchange.
    End,
    /// Aborts the current exchange.
    Cancel,
    /// Ignorable comment line.
    Comment(String),
}

impl Reply {
    /// Parse one reply line (without its trailing `LF`).
    ///
    /// Returns [`Error::InvalidResponse`] for an unknown leading token, a
    /// non-decimal `ERR` code, a keyword-less `S`/`INQUIRE`, or a malformed
    /// escape inside a `D` payload.
    pub fn parse(line: &[u8]) -> Result<Reply> {
        if let Some(rest) = line.strip_prefix(b"D ") {
            return decode_percent(rest).map(Reply::Data);
        }
        if line.first() == Some(&b'#') {
            let text = String::from_utf8_lossy(&line[1..]);
            return Ok(Reply::Comment(
                text.strip_prefix(' ').unwrap_or(&text).to_owned(),
            ));
        }

        let text = String::from_utf8_lossy(line);
        let (token, rest) = match text.split_once(' ') {
            Some((token, rest)) => (token, rest),
            None => (text.as_ref(), ""),
        };
        match token {
            "OK" => Ok(Reply::Ok(if rest.is_empty() {
                None
            } else {
                Some(rest.to_owned())
            })),
            "ERR" => {
                let (code, description) = match rest.split_once(' ') {
                    Some((code, desc)) => (code, Some(desc)),
                    None => (rest, None),
                };
                let code = code.parse::<u32>().map_err(|_| Error::InvalidResponse)?;
                Ok(Reply::Err {
                    code,
                    description: description
                        .filter(|d| !d.is_empty())
                        .map(str::to_owned),
                })
            }
            "S" => parse_keyword_line(rest)
                .map(|(keyword, args)| Reply::Status { keyword, args }),
            "INQUIRE" => parse_keyword_line(rest)
                .map(|(keyword, args)| Reply::Inquire { keyword, args }),
            "END" => Ok(Reply::End),
            "CAN" => Ok(Reply::Cancel),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Whether this reply terminates a command (`OK` or `ERR`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Reply::Ok(_) | Reply::Err { .. })
    }
}

fn parse_keyword_line(rest: &str) -> Result<(String, String)> {
    let (keyword, args) = match rest.split_once(' ') {
        Some((keyword, args)) => (keyword, args),
        None => (rest, ""),
    };
    if keyword.is_empty() {
        return Err(Error::InvalidResponse);
    }
    Ok((keyword.to_owned(), args.to_owned()))
}

/// A parsed command line: the verb and the untouched argument string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    /// First whitespace-delimited token, preserved verbatim.
    pub verb: &'a str,
    /// Remainder after exactly one separating space; internal whitespace
    /// is preserved.
    pub args: &'a str,
}

impl<'a> Command<'a> {
    /// Parse a command line. Returns `None` for blank and comment lines,
    /// which the server loop skips.
    pub fn parse(line: &'a str) -> Option<Command<'a>> {
        let line = line.trim_start_matches([' ', '\t']);
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args),
            None => (line, ""),
        };
        Some(Command { verb, args })
    }
}
