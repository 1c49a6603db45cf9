//! Parent records created so far in a session.
//!
//! The registry is owned by the consumer task and never shared, so it needs
//! no locking. It maps grouping keys to the remote parent id plus the
//! bookkeeping needed to number reruns: the next revision to hand out, how
//! often each test name was reported and, for
//! [`RerunPolicy::PreserveFirstFailure`](crate::grouping::RerunPolicy), a copy
//! of the first attempt.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::tracker::{ParentId, ResultReport, RunId, RunTracker, TrackerResult};

/// First attempt under a parent, kept so it can be copied as a sub-result.
#[derive(Debug, Clone, PartialEq)]
pub struct FirstAttempt {
    pub report: ResultReport,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParentRecord {
    pub remote_id: ParentId,
    pub created_at: DateTime<Utc>,
    revision: u32,
    attempts: HashMap<String, u32>,
    first_attempt: Option<FirstAttempt>,
    first_attempt_copied: bool,
}

impl ParentRecord {
    fn new(remote_id: ParentId, created_at: DateTime<Utc>) -> Self {
        Self {
            remote_id,
            created_at,
            revision: 0,
            attempts: HashMap::new(),
            first_attempt: None,
            first_attempt_copied: false,
        }
    }

    /// Revision the next result under this parent is reported with.
    ///
    /// `0` means nothing has been reported yet; the next result is the
    /// parent's first report. Anything higher is a rerun sub-result.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// How many results named `name` were delivered under this parent.
    pub fn attempts_of(&self, name: &str) -> u32 {
        self.attempts.get(name).copied().unwrap_or(0)
    }

    pub fn first_attempt(&self) -> Option<&FirstAttempt> {
        self.first_attempt.as_ref()
    }

    /// The failed first attempt of `name`, if it still has to be copied as
    /// `#1` before that test's rerun.
    pub fn uncopied_first_failure(&self, name: &str) -> Option<&FirstAttempt> {
        self.first_attempt.as_ref().filter(|a| {
            !self.first_attempt_copied && a.report.name == name && a.report.outcome.is_failure()
        })
    }

    /// Records a delivered report of `name` and moves to the next revision.
    pub(crate) fn commit(&mut self, name: &str, first: Option<FirstAttempt>) {
        if self.revision == 0 {
            self.first_attempt = first;
        }
        self.revision += 1;
        *self.attempts.entry(name.to_string()).or_default() += 1;
    }

    pub(crate) fn mark_first_attempt_copied(&mut self) {
        self.first_attempt_copied = true;
    }
}

#[derive(Debug, Default)]
pub struct ParentRegistry {
    records: HashMap<String, ParentRecord>,
}

impl ParentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ParentRecord> {
        self.records.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut ParentRecord> {
        self.records.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keys with no record yet, deduplicated, in first-seen order.
    pub fn missing<'a, I>(&self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        keys.into_iter()
            .filter(|key| !self.records.contains_key(*key) && seen.insert(*key))
            .map(str::to_string)
            .collect()
    }

    /// Creates records for every key not yet known, in one tracker call.
    ///
    /// Makes no call when nothing is missing. Returns how many records were
    /// created. On error nothing is inserted and the keys stay missing; the
    /// caller decides whether to try again with a later batch.
    pub async fn ensure_parents(
        &mut self,
        tracker: &dyn RunTracker,
        run_id: RunId,
        keys: &[String],
        source: Option<&str>,
    ) -> TrackerResult<usize> {
        let missing = self.missing(keys.iter().map(String::as_str));
        if missing.is_empty() {
            return Ok(0);
        }

        let created_at = Utc::now();
        debug!("Creating {} parent record(s)", missing.len());
        let mut created = tracker
            .create_parents(run_id, &missing, created_at, source)
            .await?;

        let mut count = 0;
        for key in missing {
            match created.remove(&key) {
                Some(remote_id) => {
                    self.records
                        .insert(key, ParentRecord::new(remote_id, created_at));
                    count += 1;
                }
                None => warn!("Tracker did not create a parent for '{}'", key),
            }
        }
        Ok(count)
    }
}
