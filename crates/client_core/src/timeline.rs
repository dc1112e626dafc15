//! Ordered, deduplicated message collection for the active conversation.

use std::{slice, time::Duration as StdDuration};

use chrono::{Duration, NaiveDate, TimeZone};
use tracing::{debug, warn};

use crate::message::{CorrelationId, MessageDraft, MessageOrigin, MessageRecord, RecordError};

pub const DEFAULT_DEDUP_WINDOW: StdDuration = StdDuration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An optimistic record was upgraded in place.
    Confirmed,
    Duplicate,
    Rejected(RecordError),
}

impl InsertOutcome {
    pub fn changed_store(&self) -> bool {
        matches!(self, Self::Inserted | Self::Confirmed)
    }
}

/// Records kept sorted by timestamp; equal timestamps keep insertion order.
#[derive(Debug, Clone)]
pub struct TimelineStore {
    records: Vec<MessageRecord>,
    dedup_window: Duration,
}

impl Default for TimelineStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl TimelineStore {
    pub fn new(dedup_window: StdDuration) -> Self {
        Self {
            records: Vec::new(),
            dedup_window: Duration::from_std(dedup_window).unwrap_or_else(|_| Duration::zero()),
        }
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }

    pub fn get(&self, correlation_id: &CorrelationId) -> Option<&MessageRecord> {
        self.records
            .iter()
            .find(|record| record.correlation_id.as_ref() == Some(correlation_id))
    }

    /// Appends a locally authored record and hands back its correlation id.
    ///
    /// Optimistic inserts skip deduplication: sending the same text twice
    /// shows it twice.
    pub fn insert_optimistic(&mut self, draft: MessageDraft) -> Option<CorrelationId> {
        let correlation_id = CorrelationId::new();
        let record = MessageRecord::from_draft(draft, correlation_id.clone());
        if let Err(err) = record.validate() {
            warn!(error = %err, "timeline: rejected malformed optimistic message");
            return None;
        }
        self.insert_sorted(record);
        Some(correlation_id)
    }

    /// Upgrades the optimistic record for `correlation_id` to confirmed.
    ///
    /// Position and timestamp of the optimistic record are kept. When the
    /// record is gone the server copy is inserted like any other confirmed
    /// record.
    pub fn reconcile(
        &mut self,
        correlation_id: &CorrelationId,
        server_record: MessageRecord,
    ) -> InsertOutcome {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|record| record.correlation_id.as_ref() == Some(correlation_id))
        {
            if existing.origin != MessageOrigin::Optimistic {
                return InsertOutcome::Duplicate;
            }
            existing.origin = MessageOrigin::Confirmed;
            existing.persist_failed = false;
            if server_record.server_id.is_some() {
                existing.server_id = server_record.server_id;
            }
            return InsertOutcome::Confirmed;
        }

        debug!(
            correlation_id = %correlation_id,
            "timeline: optimistic record missing at reconciliation; inserting confirmed copy"
        );
        let mut record = server_record;
        record.correlation_id = Some(correlation_id.clone());
        self.insert_deduplicated(record, MessageOrigin::Confirmed)
    }

    /// Push-originated record authored by someone other than this session.
    pub fn insert_remote(&mut self, record: MessageRecord) -> InsertOutcome {
        self.insert_deduplicated(record, MessageOrigin::Remote)
    }

    /// History record; subject to the same dedup rule as remote inserts.
    pub fn insert_confirmed(&mut self, record: MessageRecord) -> InsertOutcome {
        self.insert_deduplicated(record, MessageOrigin::Confirmed)
    }

    pub fn mark_failed(&mut self, correlation_id: &CorrelationId) -> bool {
        match self.records.iter_mut().find(|record| {
            record.correlation_id.as_ref() == Some(correlation_id)
                && record.origin == MessageOrigin::Optimistic
        }) {
            Some(record) => {
                record.persist_failed = true;
                true
            }
            None => false,
        }
    }

    /// Records ascending by timestamp, ties in insertion order.
    pub fn ordered(&self) -> impl Iterator<Item = &MessageRecord> + Clone + '_ {
        self.records.iter()
    }

    /// Ordered records interleaved with a separator before the first record
    /// of each calendar day in `tz`.
    pub fn entries<Tz: TimeZone>(&self, tz: Tz) -> TimelineEntries<'_, Tz> {
        TimelineEntries {
            records: self.records.iter(),
            tz,
            current_day: None,
            pending: None,
        }
    }

    pub fn day_groups<Tz: TimeZone>(&self, tz: Tz) -> Vec<DayGroup<'_>> {
        let mut groups: Vec<DayGroup<'_>> = Vec::new();
        for entry in self.entries(tz) {
            match entry {
                TimelineEntry::DaySeparator(date) => groups.push(DayGroup {
                    date,
                    records: Vec::new(),
                }),
                TimelineEntry::Message(record) => {
                    if let Some(group) = groups.last_mut() {
                        group.records.push(record);
                    }
                }
            }
        }
        groups
    }

    fn insert_deduplicated(
        &mut self,
        mut record: MessageRecord,
        origin: MessageOrigin,
    ) -> InsertOutcome {
        if let Err(err) = record.validate() {
            warn!(error = %err, sender = %record.sender, "timeline: rejected malformed message");
            return InsertOutcome::Rejected(err);
        }
        if self
            .records
            .iter()
            .any(|existing| existing.is_duplicate_of(&record, self.dedup_window))
        {
            debug!(sender = %record.sender, "timeline: dropped duplicate message");
            return InsertOutcome::Duplicate;
        }
        record.origin = origin;
        record.persist_failed = false;
        self.insert_sorted(record);
        InsertOutcome::Inserted
    }

    fn insert_sorted(&mut self, record: MessageRecord) {
        let position = self
            .records
            .partition_point(|existing| existing.timestamp <= record.timestamp);
        self.records.insert(position, record);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineEntry<'a> {
    DaySeparator(NaiveDate),
    Message(&'a MessageRecord),
}

/// Lazy, restartable (via `Clone`) view produced by [`TimelineStore::entries`].
#[derive(Debug, Clone)]
pub struct TimelineEntries<'a, Tz: TimeZone> {
    records: slice::Iter<'a, MessageRecord>,
    tz: Tz,
    current_day: Option<NaiveDate>,
    pending: Option<&'a MessageRecord>,
}

impl<'a, Tz: TimeZone> Iterator for TimelineEntries<'a, Tz> {
    type Item = TimelineEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.pending.take() {
            return Some(TimelineEntry::Message(record));
        }
        let record = self.records.next()?;
        let day = record.timestamp.with_timezone(&self.tz).date_naive();
        if self.current_day != Some(day) {
            self.current_day = Some(day);
            self.pending = Some(record);
            return Some(TimelineEntry::DaySeparator(day));
        }
        Some(TimelineEntry::Message(record))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup<'a> {
    pub date: NaiveDate,
    pub records: Vec<&'a MessageRecord>,
}

/// Separator label relative to the viewer's current day.
pub fn day_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        "Today".to_string()
    } else if today.pred_opt() == Some(date) {
        "Yesterday".to_string()
    } else {
        date.format("%B %-d, %Y").to_string()
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
