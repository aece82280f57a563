//! In-memory Raft log
//!
//! Holds the entries that were not yet compacted into a snapshot. Indexing
//! uses absolute log positions; anything outside `start_index..=last_index`
//! is a bug in the caller and panics.

use std::collections::VecDeque;

use super::types::{Configuration, EntryPayload, Index, LogEntryPtr, Snapshot, Term};

#[derive(Debug)]
pub struct Log {
    snapshot: Snapshot,
    entries: VecDeque<LogEntryPtr>,
    /// Absolute index of `entries[0]`
    start_index: Index,
    stable_index: Index,
    /// Index of the newest configuration entry, 0 when it lives in the snapshot
    last_conf_index: Index,
}

impl Log {
    /// Build a log from a persisted snapshot and the entries stored after it.
    /// Loaded entries are already durable.
    pub fn new(snapshot: Snapshot, entries: Vec<LogEntryPtr>) -> Self {
        let start_index = entries.first().map_or(snapshot.index + 1, |e| e.index);
        assert!(
            start_index <= snapshot.index + 1,
            "gap between snapshot {} and first log entry {}",
            snapshot.index,
            start_index
        );
        for pair in entries.windows(2) {
            assert_eq!(pair[0].index + 1, pair[1].index, "log entries are not contiguous");
        }

        let mut log = Self {
            snapshot,
            entries: entries.into(),
            start_index,
            stable_index: 0,
            last_conf_index: 0,
        };
        log.stable_index = log.last_index();
        log.last_conf_index = log.find_last_conf_index(log.last_index());
        log
    }

    pub fn start_index(&self) -> Index {
        self.start_index
    }

    pub fn last_index(&self) -> Index {
        self.start_index + self.entries.len() as Index - 1
    }

    pub fn next_index(&self) -> Index {
        self.last_index() + 1
    }

    pub fn stable_index(&self) -> Index {
        self.stable_index
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Term of the last entry, falling back to the snapshot
    pub fn last_term(&self) -> Term {
        self.entries.back().map_or(self.snapshot.term, |e| e.term)
    }

    /// Term of the entry at `index` if it is still known, either from a
    /// materialized entry or from the snapshot boundary.
    pub fn term_for(&self, index: Index) -> Option<Term> {
        if index >= self.start_index && index <= self.last_index() {
            return Some(self[index].term);
        }
        if index == self.snapshot.index {
            return Some(self.snapshot.term);
        }
        None
    }

    pub fn entry(&self, index: Index) -> &LogEntryPtr {
        assert!(
            index >= self.start_index && index <= self.last_index(),
            "log index {} out of range {}..={}",
            index,
            self.start_index,
            self.last_index()
        );
        &self.entries[(index - self.start_index) as usize]
    }

    /// Up to `max` entries starting at `from`
    pub fn entries_from(&self, from: Index, max: usize) -> Vec<LogEntryPtr> {
        if from > self.last_index() {
            return Vec::new();
        }
        let offset = (from - self.start_index) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    /// Entries in `from..=to`
    pub fn entries_between(&self, from: Index, to: Index) -> Vec<LogEntryPtr> {
        if from > to {
            return Vec::new();
        }
        self.entries_from(from, (to - from + 1) as usize)
    }

    pub fn append(&mut self, entry: LogEntryPtr) {
        assert_eq!(entry.index, self.next_index(), "append must extend the tail of the log");
        if let EntryPayload::Configuration(_) = entry.payload {
            self.last_conf_index = entry.index;
        }
        self.entries.push_back(entry);
    }

    /// Remove every entry with index >= `from`
    pub fn truncate_suffix(&mut self, from: Index) {
        assert!(
            from >= self.start_index && from <= self.next_index(),
            "cannot truncate log at {} (start {}, last {})",
            from,
            self.start_index,
            self.last_index()
        );
        self.entries.truncate((from - self.start_index) as usize);
        self.stable_index = self.stable_index.min(from - 1);
        if self.last_conf_index >= from {
            self.last_conf_index = self.find_last_conf_index(self.last_index());
        }
    }

    /// Drop entries below `index`. The caller must have installed a snapshot
    /// covering them.
    pub fn truncate_prefix_to(&mut self, index: Index) {
        if index <= self.start_index {
            return;
        }
        let count = ((index - self.start_index) as usize).min(self.entries.len());
        self.entries.drain(..count);
        self.start_index += count as Index;
        if self.entries.is_empty() {
            self.start_index = self.start_index.max(self.snapshot.index + 1);
        }
        if self.last_conf_index < self.start_index {
            self.last_conf_index = 0;
        }
    }

    /// Replace the log prefix with `snapshot`, keeping `trailing` entries at
    /// or below the snapshot index. If the log does not contain the
    /// snapshot's last entry every entry is discarded. Returns whether that
    /// happened.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot, trailing: usize) -> bool {
        assert!(
            snapshot.index > self.snapshot.index,
            "snapshot {} is not newer than {}",
            snapshot.index,
            self.snapshot.index
        );
        let keeps_suffix = self.term_for(snapshot.index) == Some(snapshot.term);
        let index = snapshot.index;
        self.snapshot = snapshot;

        if !keeps_suffix {
            self.entries.clear();
            self.start_index = index + 1;
            self.stable_index = index;
            self.last_conf_index = 0;
            return true;
        }

        self.truncate_prefix_to(index.saturating_sub(trailing as Index) + 1);
        self.stable_index = self.stable_index.max(index);
        if self.last_conf_index <= index {
            self.last_conf_index = 0;
        }
        false
    }

    pub fn mark_stable(&mut self, index: Index) {
        assert!(
            index <= self.last_index(),
            "stable index {} past last index {}",
            index,
            self.last_index()
        );
        self.stable_index = index;
    }

    /// Configuration in effect: the newest one in the log, or the snapshot's
    pub fn configuration(&self) -> &Configuration {
        if self.last_conf_index > 0 {
            if let EntryPayload::Configuration(config) = &self[self.last_conf_index].payload {
                return config;
            }
        }
        &self.snapshot.config
    }

    pub fn last_conf_index(&self) -> Index {
        self.last_conf_index
    }

    /// Configuration that was in effect at `index`
    pub fn configuration_at(&self, index: Index) -> Configuration {
        let conf_index = self.find_last_conf_index(index.min(self.last_index()));
        match conf_index {
            0 => self.snapshot.config.clone(),
            i => match &self[i].payload {
                EntryPayload::Configuration(config) => config.clone(),
                _ => unreachable!("configuration index points at a non-configuration entry"),
            },
        }
    }

    /// First index of the run of entries sharing the term at `index`
    pub fn first_index_of_term_at(&self, index: Index) -> Index {
        let term = self[index].term;
        let mut first = index;
        while first > self.start_index && self[first - 1].term == term {
            first -= 1;
        }
        first
    }

    /// Newest index holding an entry of `term`
    pub fn last_index_of_term(&self, term: Term) -> Option<Index> {
        for entry in self.entries.iter().rev() {
            if entry.term == term {
                return Some(entry.index);
            }
            if entry.term < term {
                break;
            }
        }
        (self.snapshot.term == term && self.snapshot.index > 0).then_some(self.snapshot.index)
    }

    fn find_last_conf_index(&self, upto: Index) -> Index {
        let mut index = upto;
        while index >= self.start_index && index > 0 {
            if let EntryPayload::Configuration(_) = self[index].payload {
                return index;
            }
            index -= 1;
        }
        0
    }
}

impl std::ops::Index<Index> for Log {
    type Output = LogEntryPtr;

    fn index(&self, index: Index) -> &Self::Output {
        self.entry(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{LogEntry, NodeId};
    use bytes::Bytes;
    use std::sync::Arc;

    fn entry(term: Term, index: Index) -> LogEntryPtr {
        Arc::new(LogEntry {
            term,
            index,
            payload: EntryPayload::Command(Bytes::from(format!("cmd{index}"))),
        })
    }

    fn conf_entry(term: Term, index: Index, ids: &[u128]) -> LogEntryPtr {
        Arc::new(LogEntry {
            term,
            index,
            payload: EntryPayload::Configuration(Configuration::from_ids(
                ids.iter().map(|&i| NodeId::from_u128(i)),
            )),
        })
    }

    fn log_with_terms(terms: &[Term]) -> Log {
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| entry(t, i as Index + 1))
            .collect();
        Log::new(Snapshot::default(), entries)
    }

    #[test]
    fn test_empty_log() {
        let log = Log::new(Snapshot::default(), vec![]);
        assert_eq!(log.start_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.next_index(), 1);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_for(0), Some(0));
        assert_eq!(log.term_for(1), None);
    }

    #[test]
    fn test_append_and_index() {
        let mut log = Log::new(Snapshot::default(), vec![]);
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log[2].term, 1);
        // appended entries are not durable yet
        assert_eq!(log.stable_index(), 0);
    }

    #[test]
    #[should_panic(expected = "append must extend the tail")]
    fn test_append_with_gap_panics() {
        let mut log = Log::new(Snapshot::default(), vec![]);
        log.append(entry(1, 2));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_past_end_panics() {
        let log = log_with_terms(&[1, 1]);
        let _ = &log[3];
    }

    #[test]
    fn test_truncate_suffix_clamps_stable_index() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        assert_eq!(log.stable_index(), 4);

        log.truncate_suffix(3);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.stable_index(), 2);

        log.append(entry(3, 3));
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    fn test_truncate_prefix_to() {
        let mut log = log_with_terms(&[1, 1, 1, 2, 2]);
        log.apply_snapshot(
            Snapshot {
                index: 3,
                term: 1,
                ..Default::default()
            },
            0,
        );
        assert_eq!(log.start_index(), 4);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_for(3), Some(1));
        assert_eq!(log.term_for(2), None);
    }

    #[test]
    fn test_apply_snapshot_keeps_trailing_entries() {
        let mut log = log_with_terms(&[1, 1, 1, 2, 2, 2]);
        let discarded = log.apply_snapshot(
            Snapshot {
                index: 5,
                term: 2,
                ..Default::default()
            },
            2,
        );
        assert!(!discarded);
        assert_eq!(log.start_index(), 4);
        assert_eq!(log.last_index(), 6);
    }

    #[test]
    fn test_apply_snapshot_with_conflicting_log_discards_everything() {
        let mut log = log_with_terms(&[1, 1, 1]);
        let discarded = log.apply_snapshot(
            Snapshot {
                index: 10,
                term: 4,
                ..Default::default()
            },
            5,
        );
        assert!(discarded);
        assert!(log.is_empty());
        assert_eq!(log.start_index(), 11);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
        assert_eq!(log.stable_index(), 10);
    }

    #[test]
    fn test_configuration_tracks_truncation() {
        let boot = Configuration::from_ids([NodeId::from_u128(1)]);
        let mut log = Log::new(Snapshot::bootstrap(boot.clone()), vec![]);
        log.append(entry(1, 1));
        log.append(conf_entry(1, 2, &[1, 2]));
        log.append(entry(1, 3));

        assert_eq!(log.last_conf_index(), 2);
        assert_eq!(log.configuration().current.len(), 2);
        assert_eq!(log.configuration_at(1), boot);

        log.truncate_suffix(2);
        assert_eq!(log.last_conf_index(), 0);
        assert_eq!(log.configuration(), &boot);
    }

    #[test]
    fn test_conflict_hint_helpers() {
        let log = log_with_terms(&[1, 1, 2, 2, 2, 3]);
        assert_eq!(log.first_index_of_term_at(5), 3);
        assert_eq!(log.first_index_of_term_at(2), 1);
        assert_eq!(log.last_index_of_term(2), Some(5));
        assert_eq!(log.last_index_of_term(4), None);
    }

    #[test]
    fn test_new_from_snapshot_and_trailing_entries() {
        let snapshot = Snapshot {
            index: 5,
            term: 2,
            ..Default::default()
        };
        let log = Log::new(snapshot, vec![entry(2, 4), entry(2, 5), entry(3, 6)]);
        assert_eq!(log.start_index(), 4);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.stable_index(), 6);
    }
}
