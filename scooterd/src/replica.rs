//! The replica facade:  everything the boundary needs, in one place.  Writes become commands,
//! commands become slots, and the decided slot's apply outcome becomes the caller's answer.

use std::sync::Arc;

use biometrics::{Collector, Counter};
use indicio::{clue, DEBUG};
use zerror_core::ErrorCore;

use scooter_pb::Error;

use crate::acceptor::Acceptor;
use crate::log::ReplicatedLog;
use crate::machine::{Command, Scooter, StateMachine};
use crate::proposer::Proposer;
use crate::COLLECTOR;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// How many slots a command will chase before the boundary gives up.  Each lost slot means the
/// cluster decided someone else's command there, so retrying also walks a lagging replica up to
/// the frontier.
pub const MAX_PROPOSE_ATTEMPTS: u64 = 64;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static COMMANDS: Counter = Counter::new("scooterd.replica.commands");
static SLOTS_LOST: Counter = Counter::new("scooterd.replica.slots_lost");
static BARRIERS: Counter = Counter::new("scooterd.replica.barriers");
static SNAPSHOTS: Counter = Counter::new("scooterd.replica.snapshots");

pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&COMMANDS);
    collector.register_counter(&SLOTS_LOST);
    collector.register_counter(&BARRIERS);
    collector.register_counter(&SNAPSHOTS);
}

////////////////////////////////////////////// Replica /////////////////////////////////////////////

pub struct Replica {
    machine: Arc<StateMachine>,
    log: Arc<ReplicatedLog>,
    acceptor: Arc<Acceptor>,
    proposer: Proposer,
}

impl Replica {
    pub fn new(
        machine: Arc<StateMachine>,
        log: Arc<ReplicatedLog>,
        acceptor: Arc<Acceptor>,
        proposer: Proposer,
    ) -> Self {
        Self {
            machine,
            log,
            acceptor,
            proposer,
        }
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn log(&self) -> &Arc<ReplicatedLog> {
        &self.log
    }

    pub fn acceptor(&self) -> &Arc<Acceptor> {
        &self.acceptor
    }

    /// Drive `command` into the log and return the slot it decided in.  A quorum failure retries
    /// the same slot under a fresh ballot; losing the slot to a competing proposer moves on to a
    /// fresh slot.  Either way the ballot counter advances, so attempts make progress.
    pub fn propose_command(&self, command: &Command) -> Result<i64, Error> {
        COMMANDS.click();
        let bytes = command.encode()?;
        let mut slot = self.log.take_next_index();
        let mut last_err = Error::ProposalLost {
            core: ErrorCore::default(),
            attempts: MAX_PROPOSE_ATTEMPTS,
        };
        for _ in 0..MAX_PROPOSE_ATTEMPTS {
            match self.proposer.propose(bytes.clone(), slot) {
                Ok(decided) => {
                    if decided == bytes {
                        return Ok(slot);
                    }
                    SLOTS_LOST.click();
                    clue!(COLLECTOR, DEBUG, {
                        slot_lost: {
                            slot: slot,
                        },
                    });
                    slot = self.log.take_next_index();
                }
                Err(err @ Error::QuorumFailure { .. }) => {
                    last_err = err;
                }
                Err(err) => {
                    return Err(err);
                }
            }
        }
        Err(last_err)
    }

    /// CREATE.  The command goes through consensus even when it will be rejected, so every
    /// replica's log carries the same slots.
    pub fn create(&self, id: &str) -> Result<Scooter, Error> {
        let command = Command::Create { id: id.to_owned() };
        let slot = self.propose_command(&command)?;
        if let Some(err) = self.acceptor.apply_error(slot) {
            return Err(err);
        }
        self.scooter_or_logic_error(id)
    }

    /// RESERVE.
    pub fn reserve(&self, id: &str, reservation_id: &str) -> Result<Scooter, Error> {
        let command = Command::Reserve {
            id: id.to_owned(),
            reservation_id: reservation_id.to_owned(),
        };
        let slot = self.propose_command(&command)?;
        if let Some(err) = self.acceptor.apply_error(slot) {
            return Err(err);
        }
        self.scooter_or_logic_error(id)
    }

    /// RELEASE.  A negative distance is malformed input, not a domain decision, so it is refused
    /// before consensus ever sees it.
    pub fn release(&self, id: &str, distance: f64) -> Result<Scooter, Error> {
        if distance < 0.0 {
            return Err(Error::InvalidDistance {
                core: ErrorCore::default(),
                distance,
            });
        }
        let command = Command::Release {
            id: id.to_owned(),
            distance,
        };
        let slot = self.propose_command(&command)?;
        if let Some(err) = self.acceptor.apply_error(slot) {
            return Err(err);
        }
        self.scooter_or_logic_error(id)
    }

    /// Read one scooter, optionally behind a linearizability barrier.
    pub fn scooter(&self, id: &str, linearizable: bool) -> Result<Option<Scooter>, Error> {
        if linearizable {
            self.barrier()?;
        }
        Ok(self.machine.get_scooter(id))
    }

    /// Read every scooter, optionally behind a linearizability barrier.
    pub fn scooters(&self, linearizable: bool) -> Result<Vec<Scooter>, Error> {
        if linearizable {
            self.barrier()?;
        }
        Ok(self.machine.scooters())
    }

    /// Decide a NOOP at the frontier.  Once it decides, every command committed before the call
    /// began has been applied here, so a following read is linearizable.
    pub fn barrier(&self) -> Result<(), Error> {
        BARRIERS.click();
        self.propose_command(&Command::Noop).map(|_| ())
    }

    /// Capture a snapshot through the commit watermark and truncate the log prefix it covers.
    pub fn snapshot(&self) -> Result<i64, Error> {
        SNAPSHOTS.click();
        let commit_index = self.log.commit_index();
        self.machine.take_snapshot(commit_index)?;
        self.log.store(commit_index);
        Ok(commit_index)
    }

    fn scooter_or_logic_error(&self, id: &str) -> Result<Scooter, Error> {
        self.machine.get_scooter(id).ok_or_else(|| Error::LogicError {
            core: ErrorCore::default(),
            what: format!("scooter {} missing after a successful command", id),
        })
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use scooter_pb::ReplicaID;

    use super::*;

    fn solo() -> Replica {
        let machine = Arc::new(StateMachine::new());
        let log = Arc::new(ReplicatedLog::new());
        let acceptor = Arc::new(Acceptor::new(Arc::clone(&log), Arc::clone(&machine)));
        let proposer = Proposer::new(ReplicaID::new([1; 16]), Arc::clone(&acceptor), Vec::new());
        Replica::new(machine, log, acceptor, proposer)
    }

    #[test]
    fn create_goes_through_consensus() {
        let replica = solo();
        let scooter = replica.create("x").unwrap();
        assert!(scooter.is_available);
        assert_eq!(0, replica.log().commit_index());
        assert!(replica.log().get_entry(0).is_some());
    }

    #[test]
    fn duplicate_create_consumes_a_slot_and_reports_conflict() {
        let replica = solo();
        replica.create("x").unwrap();
        let err = replica.create("x").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        // The rejected command still occupies slot 1 on every replica.
        assert_eq!(1, replica.log().commit_index());
        assert!(replica.log().get_entry(1).is_some());
        assert_eq!(1, replica.machine().scooters().len());
    }

    #[test]
    fn reserve_release_cycle() {
        let replica = solo();
        replica.create("x").unwrap();
        let scooter = replica.reserve("x", "r1").unwrap();
        assert!(!scooter.is_available);
        assert_eq!("r1", scooter.reservation_id);
        let scooter = replica.release("x", 500.0).unwrap();
        assert!(scooter.is_available);
        assert_eq!(500.0, scooter.total_distance);
        assert_eq!("", scooter.reservation_id);
    }

    #[test]
    fn negative_distance_never_reaches_the_log() {
        let replica = solo();
        replica.create("x").unwrap();
        replica.reserve("x", "r1").unwrap();
        let next_before = replica.log().next_index();
        let err = replica.release("x", -3.0).unwrap_err();
        assert!(matches!(err, Error::InvalidDistance { .. }));
        assert_eq!(next_before, replica.log().next_index());
    }

    #[test]
    fn linearizable_read_decides_a_noop_first() {
        let replica = solo();
        replica.create("x").unwrap();
        let commit_before = replica.log().commit_index();
        let scooter = replica.scooter("x", true).unwrap().unwrap();
        assert_eq!("x", scooter.id);
        assert_eq!(commit_before + 1, replica.log().commit_index());
        // A plain read decides nothing.
        let commit_before = replica.log().commit_index();
        let _ = replica.scooters(false).unwrap();
        assert_eq!(commit_before, replica.log().commit_index());
    }

    #[test]
    fn snapshot_truncates_the_log() {
        let replica = solo();
        for i in 0..10 {
            replica.create(&format!("s{}", i)).unwrap();
        }
        let index = replica.snapshot().unwrap();
        assert_eq!(9, index);
        assert_eq!(None, replica.log().get_entry(5));
        let (data, snapshot_index) = replica.machine().snapshot();
        assert_eq!(9, snapshot_index);
        assert!(!data.is_empty());
        // The map survives in the snapshot.
        let restored = StateMachine::new();
        restored.load_snapshot(&data, snapshot_index).unwrap();
        assert_eq!(10, restored.scooters().len());
    }
}
