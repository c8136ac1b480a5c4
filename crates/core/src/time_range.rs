//! Time-range collaborator used as query bounds.
//!
//! Calendar arithmetic (weeks, months, ...) lives with the reporting layer; the
//! ledger only needs the `[start, finish)` instants.

use chrono::{DateTime, Utc};

pub trait TimeRange {
    fn start(&self) -> DateTime<Utc>;
    fn finish(&self) -> DateTime<Utc>;
}

/// Plain `[start, finish)` interval.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, finish: DateTime<Utc>) -> Self {
        Self { start, finish }
    }
}

impl TimeRange for Interval {
    fn start(&self) -> DateTime<Utc> {
        self.start
    }

    fn finish(&self) -> DateTime<Utc> {
        self.finish
    }
}

impl<T: TimeRange + ?Sized> TimeRange for &T {
    fn start(&self) -> DateTime<Utc> {
        (**self).start()
    }

    fn finish(&self) -> DateTime<Utc> {
        (**self).finish()
    }
}
