use std::fmt::{self, Write};

use bytes::{Bytes, BytesMut};
use itertools::Itertools;

use super::job::{Job, PutAction, QueueStats};

/// Largest datagram either side will send or accept, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Longest key, in bytes, either side will accept.
pub const MAX_KEY_LEN: usize = 64;

/// Reason sent when a reserve or peek finds no eligible job.
pub const REASON_EMPTY: &str = "empty";
/// Reason sent when a delete matches no job.
pub const REASON_NOT_FOUND: &str = "not found";
/// Reason sent when the store failed while handling a request.
pub const REASON_INTERNAL: &str = "internal error";
/// Reason sent when the reply to a request wouldn't fit in a datagram.
pub const REASON_TOO_LARGE: &str = "response too large";

/// A single datagram exchanged between a client and the broker.
///
/// Every variant carries a `key`, chosen by the client and copied verbatim
/// into the reply so the client can match replies to requests.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Liveness check. The broker echoes it back unchanged.
    ///
    /// On the wire: `ping key=<key>`
    Ping { key: String },
    /// As a request, puts a job, creating it or merging into the job with the
    /// same ID. As a reply to `reserve` or `peek`, the job that was found.
    ///
    /// On the wire: `job key=<key> id=<id> queue=<queue> priority=<f64>
    /// hold_until=<unix secs> ttr=<secs> content=<content>`
    Job { key: String, job: Job },
    /// Reserves the highest-priority eligible job on a queue, holding it for
    /// its TTR. Replies with `job` or `error reason=empty`.
    ///
    /// On the wire: `reserve key=<key> queue=<queue>`
    Reserve { key: String, queue: String },
    /// As `reserve`, without holding the job.
    ///
    /// On the wire: `peek key=<key> queue=<queue>`
    Peek { key: String, queue: String },
    /// Deletes a job, which must belong to the given queue. Replies with
    /// `success` or `error reason="not found"`.
    ///
    /// On the wire: `delete key=<key> queue=<queue> id=<id>`
    Delete {
        key: String,
        queue: String,
        id: String,
    },
    /// Requests job counts for a queue. Replies with `queue_stats`.
    ///
    /// On the wire: `stats key=<key> queue=<queue>`
    Stats { key: String, queue: String },
    /// Reply to `stats`.
    ///
    /// On the wire: `queue_stats key=<key> queue=<queue> total=<n> ready=<n>`
    QueueStats { key: String, stats: QueueStats },
    /// Reply to a successful put or delete. Puts also say what they did.
    ///
    /// On the wire: `success key=<key> [action=created|updated]`
    Success {
        key: String,
        action: Option<PutAction>,
    },
    /// A request couldn't be satisfied.
    ///
    /// On the wire: `error key=<key> reason=<reason>`
    Error { key: String, reason: String },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Job { .. } => "job",
            Self::Reserve { .. } => "reserve",
            Self::Peek { .. } => "peek",
            Self::Delete { .. } => "delete",
            Self::Stats { .. } => "stats",
            Self::QueueStats { .. } => "queue_stats",
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Ping { key }
            | Self::Job { key, .. }
            | Self::Reserve { key, .. }
            | Self::Peek { key, .. }
            | Self::Delete { key, .. }
            | Self::Stats { key, .. }
            | Self::QueueStats { key, .. }
            | Self::Success { key, .. }
            | Self::Error { key, .. } => key,
        }
    }

    pub fn set_key(&mut self, new_key: impl Into<String>) {
        match self {
            Self::Ping { key }
            | Self::Job { key, .. }
            | Self::Reserve { key, .. }
            | Self::Peek { key, .. }
            | Self::Delete { key, .. }
            | Self::Stats { key, .. }
            | Self::QueueStats { key, .. }
            | Self::Success { key, .. }
            | Self::Error { key, .. } => *key = new_key.into(),
        }
    }

    /// Size of the largest `job` reply that could ever carry this job: one
    /// echoing a key of [`MAX_KEY_LEN`] bytes that all need escaping, with the
    /// widest `hold_until` a reservation can leave behind.
    pub fn max_job_reply_size(job: &Job) -> usize {
        let reply = Self::Job {
            key: "\u{1}".repeat(MAX_KEY_LEN),
            job: Job {
                hold_until: i64::MIN,
                ..job.clone()
            },
        };

        reply.serialise().len()
    }

    /// Encodes this message as a single protocol frame, without a trailing
    /// newline.
    pub fn serialise(&self) -> Bytes {
        let fields = self.fields();
        let mut buf = BytesMut::new();

        // Writing into a BytesMut never fails.
        let _ = write!(
            buf,
            "{} {}",
            self.tag(),
            fields.iter().format_with(" ", |(name, value), f| {
                f(&format_args!("{name}={value}"))
            })
        );

        buf.freeze()
    }

    fn fields(&self) -> Vec<(&'static str, Value<'_>)> {
        use Value::*;

        let mut fields = vec![("key", Str(self.key()))];

        match self {
            Self::Ping { .. } => {},
            Self::Job { job, .. } => fields.extend([
                ("id", Str(&job.id)),
                ("queue", Str(&job.queue)),
                ("priority", Float(job.priority)),
                ("hold_until", Int(job.hold_until)),
                ("ttr", UInt(job.ttr)),
                ("content", Str(&job.content)),
            ]),
            Self::Reserve { queue, .. }
            | Self::Peek { queue, .. }
            | Self::Stats { queue, .. } => fields.push(("queue", Str(queue))),
            Self::Delete { queue, id, .. } => {
                fields.extend([("queue", Str(queue)), ("id", Str(id))])
            },
            Self::QueueStats { stats, .. } => fields.extend([
                ("queue", Str(&stats.queue)),
                ("total", UInt(stats.total)),
                ("ready", UInt(stats.ready)),
            ]),
            Self::Success { action, .. } => {
                if let Some(action) = action {
                    fields.push(("action", Str(action.as_str())));
                }
            },
            Self::Error { reason, .. } => fields.push(("reason", Str(reason))),
        }

        fields
    }
}

/// A field value, formatted for the wire by its `Display` impl.
enum Value<'a> {
    Str(&'a str),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            // f64's Display is the shortest string that parses back to the
            // same value.
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Str(v) if !needs_quoting(v) => f.write_str(v),
            Self::Str(v) => {
                f.write_char('"')?;
                for c in v.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        c if c.is_control() => {
                            write!(f, "\\u{:04x}", c as u32)?
                        },
                        c => f.write_char(c)?,
                    }
                }
                f.write_char('"')
            },
        }
    }
}

fn needs_quoting(v: &str) -> bool {
    v.is_empty()
        || v.chars().any(|c| {
            c.is_whitespace() || c.is_control() || matches!(c, '"' | '=' | '\\')
        })
}
