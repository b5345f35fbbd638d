//! The replicated log.  Entries are stored sparsely so slots that are still in flight leave
//! representable gaps, and a snapshot truncates the prefix it covers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use biometrics::{Collector, Counter};

use scooter_pb::LogEntry;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static APPEND: Counter = Counter::new("scooterd.log.append");
static TRUNCATE: Counter = Counter::new("scooterd.log.truncate");
static SLOTS_RESERVED: Counter = Counter::new("scooterd.log.slots_reserved");

pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&APPEND);
    collector.register_counter(&TRUNCATE);
    collector.register_counter(&SLOTS_RESERVED);
}

/////////////////////////////////////////// ReplicatedLog //////////////////////////////////////////

struct LogState {
    entries: BTreeMap<i64, Vec<u8>>,
    next_index: i64,
    commit_index: i64,
    stored_index: i64,
}

/// An in-memory log of decided commands with three watermarks:  `next_index` is the smallest slot
/// not yet handed to a proposer, `commit_index` the highest slot known decided, and
/// `stored_index` the fence left behind by the last truncation.  One mutex serializes everything;
/// throughput is bounded by consensus, not by this lock.
pub struct ReplicatedLog {
    state: Mutex<LogState>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        let state = LogState {
            entries: BTreeMap::new(),
            next_index: 0,
            commit_index: -1,
            stored_index: -1,
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Store a decided command at `index` and advance the watermarks.  Re-appending an identical
    /// entry is harmless.
    pub fn append(&self, index: i64, command: Vec<u8>) {
        APPEND.click();
        let mut state = self.state.lock().unwrap();
        state.entries.insert(index, command);
        if index + 1 > state.next_index {
            state.next_index = index + 1;
        }
        if index > state.commit_index {
            state.commit_index = index;
        }
    }

    /// The command at `index`, or None if it was never appended or has been truncated away.
    pub fn get_entry(&self, index: i64) -> Option<Vec<u8>> {
        self.state.lock().unwrap().entries.get(&index).cloned()
    }

    /// Reserve the next free slot:  returns the current `next_index` and advances it.
    pub fn take_next_index(&self) -> i64 {
        SLOTS_RESERVED.click();
        let mut state = self.state.lock().unwrap();
        let index = state.next_index;
        state.next_index += 1;
        index
    }

    pub fn next_index(&self) -> i64 {
        self.state.lock().unwrap().next_index
    }

    pub fn commit_index(&self) -> i64 {
        self.state.lock().unwrap().commit_index
    }

    pub fn stored_index(&self) -> i64 {
        self.state.lock().unwrap().stored_index
    }

    /// Align `next_index` with an imported snapshot.  Recovery only.
    pub fn set_next_index(&self, index: i64) {
        self.state.lock().unwrap().next_index = index;
    }

    /// Align `commit_index` with a recovery response.  Recovery only.
    pub fn set_commit_index(&self, index: i64) {
        self.state.lock().unwrap().commit_index = index;
    }

    /// Align `stored_index` with an imported snapshot.  Recovery only.
    pub fn set_stored_index(&self, index: i64) {
        self.state.lock().unwrap().stored_index = index;
    }

    /// Drop every entry up to and including `up_to`.  The caller must hold a snapshot covering
    /// that prefix.  Leaves `stored_index` one past the truncated range.
    pub fn store(&self, up_to: i64) {
        let mut state = self.state.lock().unwrap();
        let from = if state.stored_index < 0 {
            0
        } else {
            state.stored_index
        };
        for index in from..=up_to {
            state.entries.remove(&index);
        }
        if up_to + 1 > state.stored_index {
            state.stored_index = up_to + 1;
        }
        TRUNCATE.click();
    }

    /// Every retained entry with index >= `start`, in index order.
    pub fn entries_from(&self, start: i64) -> Vec<LogEntry> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .range(start..)
            .map(|(index, command)| LogEntry {
                index: *index,
                command: command.clone(),
            })
            .collect()
    }
}

impl Default for ReplicatedLog {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_log_watermarks() {
        let log = ReplicatedLog::new();
        assert_eq!(0, log.next_index());
        assert_eq!(-1, log.commit_index());
        assert_eq!(-1, log.stored_index());
        assert_eq!(None, log.get_entry(0));
    }

    #[test]
    fn append_raises_watermarks() {
        let log = ReplicatedLog::new();
        log.append(0, b"zero".to_vec());
        assert_eq!(1, log.next_index());
        assert_eq!(0, log.commit_index());
        log.append(5, b"five".to_vec());
        assert_eq!(6, log.next_index());
        assert_eq!(5, log.commit_index());
        // Out-of-order observation of an earlier slot never regresses them.
        log.append(2, b"two".to_vec());
        assert_eq!(6, log.next_index());
        assert_eq!(5, log.commit_index());
        assert_eq!(Some(b"two".to_vec()), log.get_entry(2));
        assert_eq!(None, log.get_entry(3));
    }

    #[test]
    fn append_is_idempotent() {
        let log = ReplicatedLog::new();
        log.append(0, b"zero".to_vec());
        log.append(0, b"zero".to_vec());
        assert_eq!(1, log.next_index());
        assert_eq!(0, log.commit_index());
        assert_eq!(Some(b"zero".to_vec()), log.get_entry(0));
    }

    #[test]
    fn take_next_index_reserves_distinct_slots() {
        let log = ReplicatedLog::new();
        assert_eq!(0, log.take_next_index());
        assert_eq!(1, log.take_next_index());
        assert_eq!(2, log.next_index());
    }

    #[test]
    fn store_truncates_the_prefix() {
        let log = ReplicatedLog::new();
        for index in 0..10 {
            log.append(index, format!("cmd{}", index).into_bytes());
        }
        log.store(4);
        assert_eq!(5, log.stored_index());
        for index in 0..5 {
            assert_eq!(None, log.get_entry(index));
        }
        assert_eq!(Some(b"cmd5".to_vec()), log.get_entry(5));
        assert_eq!(9, log.commit_index());
        // A second truncation starts from the fence, not from zero.
        log.store(7);
        assert_eq!(8, log.stored_index());
        assert_eq!(None, log.get_entry(6));
        assert_eq!(Some(b"cmd8".to_vec()), log.get_entry(8));
    }

    #[test]
    fn entries_from_returns_the_suffix_in_order() {
        let log = ReplicatedLog::new();
        log.append(3, b"three".to_vec());
        log.append(1, b"one".to_vec());
        log.append(2, b"two".to_vec());
        let entries = log.entries_from(2);
        assert_eq!(2, entries.len());
        assert_eq!(2, entries[0].index);
        assert_eq!(3, entries[1].index);
        let all = log.entries_from(-1);
        assert_eq!(3, all.len());
        assert_eq!(1, all[0].index);
    }
}
