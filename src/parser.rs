//! Implements a parser for the datagram protocol.
use std::borrow::Cow;
use std::str::{self, FromStr};

use thiserror::Error;

use crate::types::job::{Job, QueueStats};
use crate::types::protocol::{Message, MAX_KEY_LEN, MAX_MESSAGE_SIZE};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ParsingError {
    #[error("bad format")]
    BadFormat,
    #[error("unknown message type")]
    UnknownMessageType,
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("invalid value for field {0:?}")]
    InvalidValue(&'static str),
    #[error("message exceeds {MAX_MESSAGE_SIZE} bytes")]
    TooLarge,
}

/// Provides a custom, minimal parser of `name=value` pairs that borrows from
/// its input unless a value contains escapes.
struct ParseState<'a> {
    from: &'a str,
}

impl<'a> ParseState<'a> {
    /// Consumes the next `name=value` pair, returning None at the end of the
    /// input.
    fn next_pair(
        &mut self,
    ) -> Result<Option<(&'a str, Cow<'a, str>)>, ParsingError> {
        self.from = self.from.trim_start_matches(' ');
        if self.from.is_empty() {
            return Ok(None);
        }

        let name = self.expect_name()?;
        self.expect_equals()?;
        let value = if self.from.starts_with('"') {
            self.expect_quoted()?
        } else {
            Cow::Borrowed(self.next_bare())
        };

        Ok(Some((name, value)))
    }

    /// Consumes a field name, which must be non-empty and is terminated by
    /// `=`.
    fn expect_name(&mut self) -> Result<&'a str, ParsingError> {
        let from = self.from;
        let idx = from
            .find(|c: char| matches!(c, '=' | ' ' | '"'))
            .unwrap_or(from.len());

        let name = &from[..idx];
        self.from = &from[idx..];

        if name.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(name)
        }
    }

    fn expect_equals(&mut self) -> Result<(), ParsingError> {
        self.from = self
            .from
            .strip_prefix('=')
            .ok_or(ParsingError::BadFormat)?;
        Ok(())
    }

    /// Consumes until reaching a space or the end of the input.
    fn next_bare(&mut self) -> &'a str {
        let from = self.from;
        let idx = from.find(' ').unwrap_or(from.len());
        self.from = &from[idx..];
        &from[..idx]
    }

    /// Consumes a double-quoted value, which must be followed by a space or
    /// the end of the input.
    fn expect_quoted(&mut self) -> Result<Cow<'a, str>, ParsingError> {
        let from = self.from;
        let body = &from[1..];

        // Fast path: nothing to unescape.
        let end = body
            .find(|c: char| matches!(c, '"' | '\\'))
            .ok_or(ParsingError::BadFormat)?;
        if body[end..].starts_with('"') {
            self.from = &body[end + 1..];
            self.expect_separator()?;
            return Ok(Cow::Borrowed(&body[..end]));
        }

        let mut value = String::with_capacity(body.len());
        let mut chars = body.char_indices();
        loop {
            let (idx, c) = chars.next().ok_or(ParsingError::BadFormat)?;
            match c {
                '"' => {
                    self.from = &body[idx + 1..];
                    break;
                },
                '\\' => {
                    let (_, escaped) =
                        chars.next().ok_or(ParsingError::BadFormat)?;
                    value.push(match escaped {
                        '"' => '"',
                        '\\' => '\\',
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        'u' => {
                            let hex = chars.as_str().get(..4);
                            let code = hex
                                .and_then(|h| u32::from_str_radix(h, 16).ok())
                                .and_then(char::from_u32)
                                .ok_or(ParsingError::BadFormat)?;
                            // from_str_radix accepts a leading '+', which
                            // isn't valid here.
                            if hex.is_some_and(|h| h.starts_with('+')) {
                                return Err(ParsingError::BadFormat);
                            }
                            chars.nth(3);
                            code
                        },
                        _ => return Err(ParsingError::BadFormat),
                    });
                },
                c => value.push(c),
            }
        }

        self.expect_separator()?;
        Ok(Cow::Owned(value))
    }

    fn expect_separator(&self) -> Result<(), ParsingError> {
        if self.from.is_empty() || self.from.starts_with(' ') {
            Ok(())
        } else {
            Err(ParsingError::BadFormat)
        }
    }
}

impl<'a> From<&'a str> for ParseState<'a> {
    fn from(from: &'a str) -> Self {
        ParseState { from }
    }
}

/// The fields of a message, consumed by name as the message is built.
struct Fields<'a> {
    pairs: Vec<(&'a str, Cow<'a, str>)>,
}

impl<'a> Fields<'a> {
    fn parse(from: &'a str) -> Result<Self, ParsingError> {
        let mut ps: ParseState = from.into();
        let mut pairs: Vec<(&str, Cow<str>)> = Vec::new();

        while let Some((name, value)) = ps.next_pair()? {
            if pairs.iter().any(|(seen, _)| *seen == name) {
                return Err(ParsingError::BadFormat);
            }
            pairs.push((name, value));
        }

        Ok(Self { pairs })
    }

    fn take(&mut self, name: &'static str) -> Option<Cow<'a, str>> {
        let idx = self.pairs.iter().position(|(n, _)| *n == name)?;
        Some(self.pairs.swap_remove(idx).1)
    }

    fn string(&mut self, name: &'static str) -> Result<String, ParsingError> {
        self.take(name)
            .map(Cow::into_owned)
            .ok_or(ParsingError::MissingField(name))
    }

    /// The message key, which every message carries.
    fn key(&mut self) -> Result<String, ParsingError> {
        let key = self.string("key")?;
        if key.len() > MAX_KEY_LEN {
            return Err(ParsingError::InvalidValue("key"));
        }
        Ok(key)
    }

    fn parsed<T: FromStr>(
        &mut self,
        name: &'static str,
    ) -> Result<T, ParsingError> {
        self.take(name)
            .ok_or(ParsingError::MissingField(name))?
            .parse()
            .map_err(|_| ParsingError::InvalidValue(name))
    }

    fn parsed_or<T: FromStr>(
        &mut self,
        name: &'static str,
        default: T,
    ) -> Result<T, ParsingError> {
        match self.take(name) {
            Some(v) => v.parse().map_err(|_| ParsingError::InvalidValue(name)),
            None => Ok(default),
        }
    }
}

type Builder = fn(&mut Fields) -> Result<Message, ParsingError>;

/// Looks up how to build the message with the given tag.
fn builder_for(tag: &str) -> Option<Builder> {
    let builder: Builder = match tag {
        "ping" => build_ping,
        "job" => build_job,
        "reserve" => build_reserve,
        "peek" => build_peek,
        "delete" => build_delete,
        "stats" => build_stats,
        "queue_stats" => build_queue_stats,
        "success" => build_success,
        "error" => build_error,
        _ => return None,
    };

    Some(builder)
}

fn build_ping(f: &mut Fields) -> Result<Message, ParsingError> {
    Ok(Message::Ping {
        key: f.key()?,
    })
}

fn build_job(f: &mut Fields) -> Result<Message, ParsingError> {
    // Numeric job fields default to zero, which the broker treats as "use
    // the default".
    Ok(Message::Job {
        key: f.key()?,
        job: Job {
            id: f.string("id")?,
            queue: f.string("queue")?,
            priority: f.parsed_or("priority", 0.0)?,
            hold_until: f.parsed_or("hold_until", 0)?,
            ttr: f.parsed_or("ttr", 0)?,
            content: f.string("content")?,
        },
    })
}

fn build_reserve(f: &mut Fields) -> Result<Message, ParsingError> {
    Ok(Message::Reserve {
        key: f.key()?,
        queue: f.string("queue")?,
    })
}

fn build_peek(f: &mut Fields) -> Result<Message, ParsingError> {
    Ok(Message::Peek {
        key: f.key()?,
        queue: f.string("queue")?,
    })
}

fn build_delete(f: &mut Fields) -> Result<Message, ParsingError> {
    Ok(Message::Delete {
        key: f.key()?,
        queue: f.string("queue")?,
        id: f.string("id")?,
    })
}

fn build_stats(f: &mut Fields) -> Result<Message, ParsingError> {
    Ok(Message::Stats {
        key: f.key()?,
        queue: f.string("queue")?,
    })
}

fn build_queue_stats(f: &mut Fields) -> Result<Message, ParsingError> {
    Ok(Message::QueueStats {
        key: f.key()?,
        stats: QueueStats {
            queue: f.string("queue")?,
            total: f.parsed("total")?,
            ready: f.parsed("ready")?,
        },
    })
}

fn build_success(f: &mut Fields) -> Result<Message, ParsingError> {
    let key = f.key()?;
    let action = match f.take("action") {
        Some(v) => {
            Some(v.parse().map_err(|_| ParsingError::InvalidValue("action"))?)
        },
        None => None,
    };

    Ok(Message::Success { key, action })
}

fn build_error(f: &mut Fields) -> Result<Message, ParsingError> {
    Ok(Message::Error {
        key: f.key()?,
        reason: f.string("reason")?,
    })
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for Message {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, ParsingError> {
        if value.len() > MAX_MESSAGE_SIZE {
            return Err(ParsingError::TooLarge);
        }

        let text = str::from_utf8(value)
            .map_err(|_| ParsingError::BadFormat)?
            .trim();

        let (tag, rest) = text.split_once(' ').unwrap_or((text, ""));
        if tag.is_empty() {
            return Err(ParsingError::BadFormat);
        }

        let build = builder_for(tag).ok_or(ParsingError::UnknownMessageType)?;
        let mut fields = Fields::parse(rest)?;

        build(&mut fields)
    }
}
