//! Log and snapshot recovery.  The server side hands out a snapshot plus the log suffix; the
//! client side runs once at startup and pulls from the first peer that answers.  There is no
//! background reconciliation:  consensus on writes prevents divergence, recovery only closes the
//! gap a restart or partition opened.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use biometrics::{Collector, Counter};
use indicio::{clue, DEBUG, INFO, WARNING};
use rpc_pb::Context;
use zerror::Z;

use scooter_pb::{
    Error, GetLogRequest, GetLogResponse, RecoveryClient, RecoveryService,
    RECOVERY_TIMEOUT_MILLIS,
};

use crate::log::ReplicatedLog;
use crate::machine::StateMachine;
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static GET_LOG: Counter = Counter::new("scooterd.recovery.get_log");
static CATCH_UP: Counter = Counter::new("scooterd.recovery.catch_up");
static CATCH_UP_EMPTY: Counter = Counter::new("scooterd.recovery.catch_up.empty");
static SNAPSHOTS_SERVED: Counter = Counter::new("scooterd.recovery.snapshots_served");
static SNAPSHOTS_LOADED: Counter = Counter::new("scooterd.recovery.snapshots_loaded");

pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&GET_LOG);
    collector.register_counter(&CATCH_UP);
    collector.register_counter(&CATCH_UP_EMPTY);
    collector.register_counter(&SNAPSHOTS_SERVED);
    collector.register_counter(&SNAPSHOTS_LOADED);
}

///////////////////////////////////////////// Recovery /////////////////////////////////////////////

/// The server side:  answers GetLog for peers that are starting or lagging.
pub struct Recovery {
    log: Arc<ReplicatedLog>,
    machine: Arc<StateMachine>,
}

impl Recovery {
    pub fn new(log: Arc<ReplicatedLog>, machine: Arc<StateMachine>) -> Self {
        Self { log, machine }
    }

    /// Everything from `starting_index` forward.  When the request starts below our snapshot the
    /// response carries the snapshot and only the entries strictly after it; the requester cannot
    /// replay a prefix we truncated.
    pub fn get_log(&self, starting_index: i64) -> GetLogResponse {
        GET_LOG.click();
        let (snapshot_data, snapshot_index) = self.machine.snapshot();
        let mut resp = GetLogResponse {
            entries: Vec::new(),
            commit_index: self.log.commit_index(),
            snapshot_data: Vec::new(),
            snapshot_index: -1,
        };
        if snapshot_index >= 0 && starting_index <= snapshot_index {
            SNAPSHOTS_SERVED.click();
            resp.entries = self.log.entries_from(snapshot_index + 1);
            resp.snapshot_data = snapshot_data;
            resp.snapshot_index = snapshot_index;
        } else {
            resp.entries = self.log.entries_from(starting_index);
        }
        resp
    }
}

impl RecoveryService for Arc<Recovery> {
    fn get_log(&self, _: &Context, req: GetLogRequest) -> Result<GetLogResponse, Error> {
        Ok(Recovery::get_log(self, req.starting_index))
    }
}

///////////////////////////////////////////// catch_up /////////////////////////////////////////////

/// Pull state from the first peer that answers within the deadline.  Returns true if a peer was
/// consulted; false means every peer was silent and the replica starts empty.
pub fn catch_up(
    log: &Arc<ReplicatedLog>,
    machine: &Arc<StateMachine>,
    peers: &[Arc<RecoveryClient>],
    timeout: Duration,
) -> bool {
    let local_next = log.next_index();
    for peer in peers.iter() {
        let resp = match call_get_log(peer, local_next, timeout) {
            Ok(resp) => resp,
            Err(err) => {
                clue!(COLLECTOR, DEBUG, {
                    catch_up_peer_failed: err.to_string(),
                });
                continue;
            }
        };
        if resp.has_snapshot() && resp.snapshot_index >= local_next {
            SNAPSHOTS_LOADED.click();
            if let Err(err) = machine.load_snapshot(&resp.snapshot_data, resp.snapshot_index) {
                clue!(COLLECTOR, WARNING, {
                    catch_up_snapshot_rejected: err.to_string(),
                });
                continue;
            }
            log.set_stored_index(resp.snapshot_index);
            log.set_commit_index(resp.snapshot_index);
            log.set_next_index(resp.snapshot_index + 1);
        }
        for entry in resp.entries.iter() {
            log.append(entry.index, entry.command.clone());
            // A command the cluster rejected at apply time is rejected here too; that is the
            // replay working, not a failure.
            let _ = machine.apply(&entry.command);
        }
        log.set_commit_index(resp.commit_index);
        CATCH_UP.click();
        clue!(COLLECTOR, INFO, {
            catch_up: {
                entries: resp.entries.len() as u64,
                commit_index: resp.commit_index,
                snapshot_index: resp.snapshot_index,
            },
        });
        return true;
    }
    CATCH_UP_EMPTY.click();
    clue!(COLLECTOR, INFO, {
        catch_up: {
            empty_start: true,
        },
    });
    false
}

/// The default catch-up deadline.
pub fn default_timeout() -> Duration {
    Duration::from_millis(RECOVERY_TIMEOUT_MILLIS)
}

fn call_get_log(
    peer: &Arc<RecoveryClient>,
    starting_index: i64,
    timeout: Duration,
) -> Result<GetLogResponse, Error> {
    let (tx, rx) = mpsc::channel();
    let peer = Arc::clone(peer);
    thread::spawn(move || {
        let req = GetLogRequest { starting_index };
        let _ = tx.send(peer.get_log(&Context::default(), req));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(Error::RpcError {
            core: zerror_core::ErrorCore::default(),
            what: rpc_pb::Error::TransportFailure {
                core: zerror_core::ErrorCore::default(),
                what: "recovery deadline elapsed".to_owned(),
            },
        }
        .with_info("starting_index", starting_index)),
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use crate::machine::Command;

    use super::*;

    fn populated() -> (Arc<ReplicatedLog>, Arc<StateMachine>) {
        let log = Arc::new(ReplicatedLog::new());
        let machine = Arc::new(StateMachine::new());
        for (index, id) in ["a", "b", "c", "d"].iter().enumerate() {
            let command = Command::Create { id: id.to_string() }.encode().unwrap();
            log.append(index as i64, command.clone());
            machine.apply(&command).unwrap();
        }
        (log, machine)
    }

    #[test]
    fn get_log_returns_the_requested_suffix() {
        let (log, machine) = populated();
        let recovery = Recovery::new(log, machine);
        let resp = recovery.get_log(2);
        assert!(!resp.has_snapshot());
        assert_eq!(3, resp.commit_index);
        assert_eq!(2, resp.entries.len());
        assert_eq!(2, resp.entries[0].index);
        assert_eq!(3, resp.entries[1].index);
    }

    #[test]
    fn get_log_sends_the_snapshot_to_laggards() {
        let (log, machine) = populated();
        machine.take_snapshot(2).unwrap();
        log.store(2);
        let recovery = Recovery::new(Arc::clone(&log), Arc::clone(&machine));
        // A requester starting below the snapshot gets it plus the suffix after it.
        let resp = recovery.get_log(0);
        assert!(resp.has_snapshot());
        assert_eq!(2, resp.snapshot_index);
        assert_eq!(1, resp.entries.len());
        assert_eq!(3, resp.entries[0].index);
        // A requester already past the snapshot gets entries only.
        let resp = recovery.get_log(3);
        assert!(!resp.has_snapshot());
        assert_eq!(1, resp.entries.len());
    }
}
