//! Append-only change log (spec §4.7). Grounded on the semantics tested in
//! the original implementation's `JournalTest.cpp`: consecutive `Changed`
//! records for the same path compact into one entry, a `memory_limit` byte
//! budget evicts the oldest entries but always keeps at least one, and
//! `accumulate_range` reports a `truncated` flag once the caller's requested
//! sequence number has fallen off the retained window. Subscriber
//! notification uses `tokio::sync::watch`, the same primitive the teacher's
//! `castore::composition` module uses to fan a single state change out to
//! however many waiters are currently parked on it.

use std::collections::{HashMap, HashSet, VecDeque};

use edenfs_castore::RelativePathBuf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A root transition recorded alongside a batch of path changes (spec §4.7's
/// `root_from?`/`root_to?`).
pub type RootId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Changed(RelativePathBuf),
    Created(RelativePathBuf),
    Removed(RelativePathBuf),
    HashUpdate { from: RootId, to: RootId },
    UncleanPaths { from: RootId, to: RootId, paths: Vec<RelativePathBuf> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub seq_id: u64,
    pub kind: Kind,
    pub timestamp: i64,
}

impl Entry {
    fn estimated_size(&self) -> u64 {
        let path_bytes = match &self.kind {
            Kind::Changed(p) | Kind::Created(p) | Kind::Removed(p) => p.as_bytes().len(),
            Kind::HashUpdate { from, to } => from.len() + to.len(),
            Kind::UncleanPaths { from, to, paths } => {
                from.len() + to.len() + paths.iter().map(|p| p.as_bytes().len()).sum::<usize>()
            }
        };
        (path_bytes + 64) as u64
    }

    fn path(&self) -> Option<&RelativePathBuf> {
        match &self.kind {
            Kind::Changed(p) | Kind::Created(p) | Kind::Removed(p) => Some(p),
            _ => None,
        }
    }
}

/// The union of everything that happened across a range of sequence numbers
/// (spec §4.7 `accumulate_range`'s `Summary`).
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub from_sequence: u64,
    pub to_sequence: u64,
    /// Path -> (existed_before, existed_after), folding create/remove/change
    /// history across the range into a single before/after pair.
    pub changed_files_in_overlay: HashMap<RelativePathBuf, (bool, bool)>,
    pub unclean_paths: HashSet<RelativePathBuf>,
    pub root_from: Option<RootId>,
    pub root_to: Option<RootId>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub entry_count: u64,
    pub earliest_ts: Option<i64>,
    pub latest_ts: Option<i64>,
    pub memory_bytes: u64,
    pub max_files_accumulated: u64,
}

struct State {
    entries: VecDeque<Entry>,
    next_seq: u64,
    memory_bytes: u64,
    memory_limit: u64,
    max_files_accumulated: u64,
}

/// The per-mount journal (spec §4.7). `subscribe()` hands out a
/// `tokio::sync::watch` receiver that fires once per batch of appended
/// records; callers re-check with `latest()`/`accumulate_range` rather than
/// trying to read the changed value out of the channel itself.
pub struct Journal {
    state: Mutex<State>,
    notify: watch::Sender<u64>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

impl Journal {
    pub fn new(memory_limit: u64) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                next_seq: 1,
                memory_bytes: 0,
                memory_limit,
                max_files_accumulated: 0,
            }),
            notify,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    pub fn latest(&self) -> Option<Entry> {
        self.state.lock().entries.back().cloned()
    }

    pub fn memory_limit(&self) -> u64 {
        self.state.lock().memory_limit
    }

    pub fn set_memory_limit(&self, limit: u64) {
        let mut state = self.state.lock();
        state.memory_limit = limit;
        Self::evict(&mut state);
    }

    pub fn record_changed(&self, path: RelativePathBuf) {
        self.append(Kind::Changed(path), true);
    }

    pub fn record_created(&self, path: RelativePathBuf) {
        self.append(Kind::Created(path), false);
    }

    pub fn record_removed(&self, path: RelativePathBuf) {
        self.append(Kind::Removed(path), false);
    }

    pub fn record_hash_update(&self, from: RootId, to: RootId) {
        self.append(Kind::HashUpdate { from, to }, false);
    }

    pub fn record_unclean_paths(&self, from: RootId, to: RootId, paths: Vec<RelativePathBuf>) {
        self.append(Kind::UncleanPaths { from, to, paths }, false);
    }

    fn append(&self, kind: Kind, compactable: bool) {
        let seq = {
            let mut state = self.state.lock();

            // Compaction: a `Changed(p)` immediately following another
            // `Changed(p)` just bumps the existing entry's sequence number
            // rather than growing the log.
            if compactable {
                if let Kind::Changed(path) = &kind {
                    let matches_last = matches!(
                        state.entries.back(),
                        Some(last) if matches!(&last.kind, Kind::Changed(p) if p == path)
                    );
                    if matches_last {
                        let bumped = state.next_seq;
                        state.next_seq += 1;
                        let last = state.entries.back_mut().expect("checked above");
                        last.seq_id = bumped;
                        last.timestamp = now_ts();
                        return_notify(&self.notify, bumped);
                        return;
                    }
                }
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let entry = Entry { seq_id: seq, kind, timestamp: now_ts() };
            state.memory_bytes += entry.estimated_size();
            state.entries.push_back(entry);
            Self::evict(&mut state);
            seq
        };
        return_notify(&self.notify, seq);
    }

    fn evict(state: &mut State) {
        while state.entries.len() > 1 && state.memory_bytes > state.memory_limit {
            if let Some(oldest) = state.entries.pop_front() {
                state.memory_bytes = state.memory_bytes.saturating_sub(oldest.estimated_size());
            }
        }
    }

    /// Returns the union of everything recorded with `seq_id >= from_seq`
    /// (spec §4.7). `None` only when the journal is empty and `from_seq` is
    /// unspecified; a `from_seq` beyond the latest entry yields an empty,
    /// non-truncated summary per the original's "nullptr for empty ranges"
    /// behavior translated to `Some(Summary::default())` when entries exist.
    pub fn accumulate_range(&self, from_seq: Option<u64>) -> Option<Summary> {
        let mut state = self.state.lock();
        let oldest_seq = state.entries.front()?.seq_id;
        let latest_seq = state.entries.back()?.seq_id;
        let from_seq = from_seq.unwrap_or(oldest_seq);

        if from_seq > latest_seq + 1 {
            return None;
        }

        let truncated = from_seq < oldest_seq;
        let mut summary = Summary {
            from_sequence: from_seq.max(oldest_seq),
            to_sequence: latest_seq,
            truncated,
            ..Default::default()
        };

        let mut files_touched = 0u64;
        for entry in state.entries.iter().filter(|e| e.seq_id >= from_seq) {
            match &entry.kind {
                Kind::Changed(path) | Kind::Created(path) | Kind::Removed(path) => {
                    let existed_after = !matches!(entry.kind, Kind::Removed(_));
                    let slot = summary
                        .changed_files_in_overlay
                        .entry(path.clone())
                        .or_insert((!matches!(entry.kind, Kind::Created(_)), existed_after));
                    slot.1 = existed_after;
                    files_touched += 1;
                }
                Kind::HashUpdate { from, to } => {
                    if summary.root_from.is_none() {
                        summary.root_from = Some(from.clone());
                    }
                    summary.root_to = Some(to.clone());
                }
                Kind::UncleanPaths { from, to, paths } => {
                    if summary.root_from.is_none() {
                        summary.root_from = Some(from.clone());
                    }
                    summary.root_to = Some(to.clone());
                    summary.unclean_paths.extend(paths.iter().cloned());
                }
            }
        }

        state.max_files_accumulated = state.max_files_accumulated.max(files_touched);
        Some(summary)
    }

    pub fn stats(&self) -> Stats {
        let state = self.state.lock();
        Stats {
            entry_count: state.entries.len() as u64,
            earliest_ts: state.entries.front().map(|e| e.timestamp),
            latest_ts: state.entries.back().map(|e| e.timestamp),
            memory_bytes: state.memory_bytes,
            max_files_accumulated: state.max_files_accumulated,
        }
    }

    /// Drops every retained entry (spec §4.7 `flush`): the next
    /// `accumulate_range` call will report `truncated` for any `from_seq`
    /// below what gets appended afterward.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.memory_bytes = 0;
    }
}

fn return_notify(notify: &watch::Sender<u64>, seq: u64) {
    let _ = notify.send(seq);
}

fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edenfs_castore::RelativePath;

    fn path(s: &str) -> RelativePathBuf {
        RelativePath::ROOT.join(&edenfs_castore::PathComponent::new(s.to_string()).unwrap())
    }

    #[test]
    fn accumulate_range_all_changes() {
        let journal = Journal::default();
        assert!(journal.latest().is_none());
        assert!(journal.accumulate_range(None).is_none());

        journal.record_changed(path("foo"));
        assert_eq!(journal.latest().unwrap().seq_id, 1);
        journal.record_changed(path("baz"));
        assert_eq!(journal.latest().unwrap().seq_id, 2);

        let summed = journal.accumulate_range(None).unwrap();
        assert_eq!(summed.from_sequence, 1);
        assert_eq!(summed.to_sequence, 2);
        assert_eq!(summed.changed_files_in_overlay.len(), 2);

        let summed = journal.accumulate_range(Some(2)).unwrap();
        assert_eq!(summed.from_sequence, 2);
        assert_eq!(summed.changed_files_in_overlay.len(), 1);
    }

    #[test]
    fn remove_create_update_reports_existed_before_and_after() {
        let journal = Journal::default();
        journal.record_removed(path("test.txt"));
        journal.record_created(path("test.txt"));
        journal.record_changed(path("test.txt"));

        assert_eq!(journal.latest().unwrap().seq_id, 3);

        let summed = journal.accumulate_range(None).unwrap();
        assert_eq!(summed.from_sequence, 1);
        let (before, after) = summed.changed_files_in_overlay[&path("test.txt")];
        assert!(before);
        assert!(after);

        let summed = journal.accumulate_range(Some(2)).unwrap();
        let (before, after) = summed.changed_files_in_overlay[&path("test.txt")];
        assert!(!before);
        assert!(after);
    }

    #[test]
    fn consecutive_changed_compacts() {
        let journal = Journal::default();
        journal.record_created(path("file1.txt"));
        assert_eq!(journal.stats().entry_count, 1);

        journal.record_changed(path("file1.txt"));
        assert_eq!(journal.stats().entry_count, 2);
        assert_eq!(journal.latest().unwrap().seq_id, 2);

        journal.record_changed(path("file1.txt"));
        assert_eq!(journal.stats().entry_count, 2);
        assert_eq!(journal.latest().unwrap().seq_id, 3);
    }

    #[test]
    fn memory_limit_of_zero_still_holds_one_entry() {
        let journal = Journal::new(0);
        journal.record_created(path("file1.txt"));
        let summed = journal.accumulate_range(Some(1)).unwrap();
        assert!(!summed.truncated);

        journal.record_created(path("file2.txt"));
        let summed = journal.accumulate_range(Some(1)).unwrap();
        assert!(summed.truncated);
        let summed = journal.accumulate_range(Some(2)).unwrap();
        assert!(!summed.truncated);
    }

    #[test]
    fn flush_truncates_subsequent_reads() {
        let journal = Journal::default();
        journal.record_created(path("file1.txt"));
        journal.record_created(path("file2.txt"));
        let summed = journal.accumulate_range(Some(1)).unwrap();
        assert!(!summed.truncated);

        journal.flush();
        journal.record_created(path("file3.txt"));
        let summed = journal.accumulate_range(Some(1)).unwrap();
        assert!(summed.truncated);
    }

    #[test]
    fn set_get_memory_limit() {
        let journal = Journal::default();
        journal.set_memory_limit(500);
        assert_eq!(journal.memory_limit(), 500);
        journal.set_memory_limit(0);
        assert_eq!(journal.memory_limit(), 0);
    }

    #[tokio::test]
    async fn subscriber_observes_append() {
        let journal = Journal::default();
        let mut rx = journal.subscribe();
        journal.record_created(path("file1.txt"));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
