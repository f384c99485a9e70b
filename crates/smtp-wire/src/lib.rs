//! SMTP wire-format primitives shared by the proxy's inbound and outbound
//! sessions: reply-line parsing and multi-line reply assembly, command
//! classification, and the DATA-phase dot-stuffing codec.
//!
//! Replies keep their raw line text so that a relay can reproduce what it
//! heard byte for byte; parsing only extracts the code and the
//! final/continuation distinction.

use std::borrow::Cow;
use std::sync::LazyLock;

use memchr::memmem::Finder;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Malformed reply line: {0}")]
    MalformedReplyLine(String),
    #[error("Reply code changed mid-reply: {0}")]
    CodeMismatch(String),
    #[error("Reply ended before its final line")]
    IncompleteReply,
}

/// One parsed line of an SMTP reply. `is_final` distinguishes the
/// `xyz text` form from the `xyz-text` continuation form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

/// Parses a single reply line (without its CRLF terminator).
///
/// A bare three-digit code with no text is accepted as a final line; some
/// servers reply `250` with nothing after the code.
pub fn parse_reply_line(line: &str) -> Result<ReplyLine, WireError> {
    let bytes = line.as_bytes();
    if bytes.len() == 3 {
        return match line.parse::<u16>() {
            Ok(code) => Ok(ReplyLine {
                code,
                is_final: true,
                content: "",
            }),
            Err(_) => Err(WireError::MalformedReplyLine(line.to_string())),
        };
    }
    if bytes.len() < 4 {
        return Err(WireError::MalformedReplyLine(line.to_string()));
    }

    match bytes[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ReplyLine {
                code,
                is_final: bytes[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(WireError::MalformedReplyLine(line.to_string())),
        },
        _ => Err(WireError::MalformedReplyLine(line.to_string())),
    }
}

/// A complete SMTP reply, one or more lines. `lines` holds the raw line
/// text without CRLF terminators, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ReplyBuilder {
    code: Option<u16>,
    lines: Vec<String>,
    complete: bool,
}

impl ReplyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one raw reply line and appends it. Returns true once the
    /// final line of the reply has been consumed.
    pub fn add_line(&mut self, raw: &str) -> Result<bool, WireError> {
        let parsed = parse_reply_line(raw)?;
        match self.code {
            None => self.code = Some(parsed.code),
            Some(code) if code != parsed.code => {
                return Err(WireError::CodeMismatch(raw.to_string()));
            }
            Some(_) => {}
        }
        self.lines.push(raw.to_string());
        self.complete = parsed.is_final;
        Ok(self.complete)
    }

    pub fn build(self) -> Result<Reply, WireError> {
        if !self.complete {
            return Err(WireError::IncompleteReply);
        }
        let code = self.code.ok_or(WireError::IncompleteReply)?;
        Ok(Reply {
            code,
            lines: self.lines,
        })
    }
}

/// The verbs the proxy reacts to. Everything else relays untouched, so
/// there is deliberately no parse of argument syntax here beyond what the
/// relay needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Quit,
    Other,
}

impl Verb {
    pub fn classify(line: &str) -> Self {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            line.len() >= candidate.len() && line[..candidate.len()].eq_ignore_ascii_case(candidate)
        }

        if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if prefix_match(line, "HELO ") {
            Self::Helo
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo
        } else if prefix_match(line, "MAIL FROM:") {
            Self::Mail
        } else if prefix_match(line, "RCPT TO:") {
            Self::Rcpt
        } else {
            Self::Other
        }
    }
}

/// Extracts the envelope address argument from a MAIL FROM / RCPT TO line,
/// with any angle brackets and trailing ESMTP parameters removed.
pub fn envelope_address(line: &str) -> Option<&str> {
    let colon = line.find(':')?;
    let rest = line[colon + 1..].trim();
    let token = rest.split_whitespace().next()?;
    Some(token.trim_start_matches('<').trim_end_matches('>'))
}

/// Removes the stuffing dot from a received body line.
pub fn unstuff_line(line: &[u8]) -> &[u8] {
    match line.first() {
        Some(b'.') => &line[1..],
        _ => line,
    }
}

/// Adds the stuffing dot to a body line about to go on the wire.
pub fn stuff_line(line: &[u8]) -> Cow<'_, [u8]> {
    match line.first() {
        Some(b'.') => {
            let mut stuffed = Vec::with_capacity(line.len() + 1);
            stuffed.push(b'.');
            stuffed.extend_from_slice(line);
            Cow::Owned(stuffed)
        }
        _ => Cow::Borrowed(line),
    }
}

/// Splits a raw line into its content and its terminator. The terminator is
/// CRLF, a bare LF, or empty at end of input.
pub fn split_line_ending(line: &[u8]) -> (&[u8], &[u8]) {
    if line.ends_with(b"\r\n") {
        line.split_at(line.len() - 2)
    } else if line.ends_with(b"\n") {
        line.split_at(line.len() - 1)
    } else {
        (line, &[])
    }
}

/// Strips one trailing CRLF or LF from a command line.
pub fn trim_line_ending(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .unwrap_or(line)
}

/// Byte offset of the first CRLF in `buf`, if any.
pub fn find_crlf(buf: &[u8]) -> Option<usize> {
    static CRLF: LazyLock<Finder> = LazyLock::new(|| Finder::new("\r\n"));
    CRLF.find(buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn parse_reply_lines() {
        assert_equal!(
            parse_reply_line("220 woot").unwrap(),
            ReplyLine {
                code: 220,
                is_final: true,
                content: "woot"
            }
        );
        assert_equal!(
            parse_reply_line("220-woot").unwrap(),
            ReplyLine {
                code: 220,
                is_final: false,
                content: "woot"
            }
        );
        assert_equal!(
            parse_reply_line("250").unwrap(),
            ReplyLine {
                code: 250,
                is_final: true,
                content: ""
            }
        );
        assert_equal!(
            parse_reply_line("220_woot"),
            Err(WireError::MalformedReplyLine("220_woot".to_string()))
        );
        assert_equal!(
            parse_reply_line("not really"),
            Err(WireError::MalformedReplyLine("not really".to_string()))
        );
        assert_equal!(
            parse_reply_line(": 220"),
            Err(WireError::MalformedReplyLine(": 220".to_string()))
        );
    }

    #[test]
    fn assemble_multi_line_reply() {
        let mut builder = ReplyBuilder::new();
        assert_equal!(builder.add_line("250-upstream.example").unwrap(), false);
        assert_equal!(builder.add_line("250-SIZE 10485760").unwrap(), false);
        assert_equal!(builder.add_line("250 HELP").unwrap(), true);
        let reply = builder.build().unwrap();
        assert_equal!(reply.code, 250);
        assert_equal!(
            reply.lines,
            vec![
                "250-upstream.example".to_string(),
                "250-SIZE 10485760".to_string(),
                "250 HELP".to_string(),
            ]
        );
    }

    #[test]
    fn reply_code_must_not_change() {
        let mut builder = ReplyBuilder::new();
        builder.add_line("250-ok").unwrap();
        assert_equal!(
            builder.add_line("550 nope"),
            Err(WireError::CodeMismatch("550 nope".to_string()))
        );
    }

    #[test]
    fn incomplete_reply_does_not_build() {
        let mut builder = ReplyBuilder::new();
        builder.add_line("250-ok").unwrap();
        assert_equal!(builder.build(), Err(WireError::IncompleteReply));
    }

    #[test]
    fn classify_verbs() {
        assert_equal!(Verb::classify("DATA"), Verb::Data);
        assert_equal!(Verb::classify("data"), Verb::Data);
        assert_equal!(Verb::classify("QUIT"), Verb::Quit);
        assert_equal!(Verb::classify("rset"), Verb::Rset);
        assert_equal!(Verb::classify("EHLO laptop"), Verb::Ehlo);
        assert_equal!(Verb::classify("helo laptop"), Verb::Helo);
        assert_equal!(Verb::classify("MAIL FROM:<a@x>"), Verb::Mail);
        assert_equal!(Verb::classify("mail from:<a@x> SIZE=100"), Verb::Mail);
        assert_equal!(Verb::classify("RCPT TO:<b@y>"), Verb::Rcpt);
        assert_equal!(Verb::classify("NOOP"), Verb::Other);
        assert_equal!(Verb::classify("EHLO"), Verb::Other);
        assert_equal!(Verb::classify("DATAx"), Verb::Other);
        assert_equal!(Verb::classify(""), Verb::Other);
    }

    #[test]
    fn extract_envelope_addresses() {
        assert_equal!(envelope_address("MAIL FROM:<a@x>"), Some("a@x"));
        assert_equal!(envelope_address("RCPT TO:<b@y>"), Some("b@y"));
        assert_equal!(envelope_address("MAIL FROM:<a@x> SIZE=100"), Some("a@x"));
        assert_equal!(envelope_address("MAIL FROM:<>"), Some(""));
        assert_equal!(envelope_address("MAIL FROM: a@x"), Some("a@x"));
        assert_equal!(envelope_address("QUIT"), None);
    }

    #[test]
    fn dot_stuffing() {
        assert_equal!(stuff_line(b"foo").as_ref(), &b"foo"[..]);
        assert_equal!(stuff_line(b".foo").as_ref(), &b"..foo"[..]);
        assert_equal!(stuff_line(b".").as_ref(), &b".."[..]);
        assert_equal!(unstuff_line(b"..foo"), &b".foo"[..]);
        assert_equal!(unstuff_line(b".foo"), &b"foo"[..]);
        assert_equal!(unstuff_line(b"foo"), &b"foo"[..]);
        assert_equal!(unstuff_line(b""), &b""[..]);
    }

    #[test]
    fn line_endings() {
        assert_equal!(split_line_ending(b"foo\r\n"), (&b"foo"[..], &b"\r\n"[..]));
        assert_equal!(split_line_ending(b"foo\n"), (&b"foo"[..], &b"\n"[..]));
        assert_equal!(split_line_ending(b"foo"), (&b"foo"[..], &b""[..]));
        assert_equal!(trim_line_ending("foo\r\n"), "foo");
        assert_equal!(trim_line_ending("foo\n"), "foo");
        assert_equal!(trim_line_ending("foo"), "foo");
    }

    #[test]
    fn crlf_scan() {
        assert_equal!(find_crlf(b"250 ok\r\nmore"), Some(6));
        assert_equal!(find_crlf(b"partial"), None);
        assert_equal!(find_crlf(b"\r\n"), Some(0));
    }
}
