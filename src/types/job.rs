use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Time to run applied to jobs put with a `ttr` of zero.
pub const DEFAULT_TTR: u64 = 60 * 60;

/// A job as stored by the broker and carried by `job` messages.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Job {
    /// Caller-assigned identifier, unique across every queue.
    pub id: String,
    /// Name of the queue the job belongs to.
    pub queue: String,
    /// Higher priorities are reserved first.
    pub priority: f64,
    /// Unix time in seconds before which the job can't be reserved. Zero on a
    /// put means "now".
    pub hold_until: i64,
    /// Seconds a reservation holds the job for. Zero on a put means
    /// [`DEFAULT_TTR`].
    pub ttr: u64,
    /// Opaque payload.
    pub content: String,
}

impl Job {
    pub fn new(
        queue: impl Into<String>,
        id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            priority: 0.0,
            hold_until: 0,
            ttr: 0,
            content: content.into(),
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_hold_until(mut self, hold_until: DateTime<Utc>) -> Self {
        self.hold_until = hold_until.timestamp();
        self
    }

    pub fn with_ttr(mut self, ttr: Duration) -> Self {
        self.ttr = ttr.as_secs();
        self
    }

    /// `hold_until` as a timestamp, if it's within chrono's range.
    pub fn hold_until_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.hold_until, 0)
    }

    pub fn ttr_duration(&self) -> Duration {
        Duration::from_secs(self.ttr)
    }
}

/// What a put did to the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PutAction {
    Created,
    Updated,
}

impl PutAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

impl fmt::Display for PutAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PutAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            _ => Err(()),
        }
    }
}

/// Job counts for a single queue.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct QueueStats {
    /// queue name
    pub queue: String,
    /// number of jobs stored in the queue
    pub total: u64,
    /// number of jobs that could be reserved right now
    pub ready: u64,
}
