//! The Paxos passive role.  One [Acceptor] holds every slot's instance under a single mutex;
//! handlers are O(1) and short, so serializing them across slots costs less than the RPCs that
//! reach them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};
use indicio::{clue, DEBUG, INFO};
use rpc_pb::Context;

use scooter_pb::{
    AcceptorService, Ballot, CommitRequest, CommitResponse, Error, PValue, Phase1A, Phase1B,
    Phase2A, Phase2B,
};

use crate::log::ReplicatedLog;
use crate::machine::StateMachine;
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROMISES: Counter = Counter::new("scooterd.acceptor.promises");
static PROMISES_REFUSED: Counter = Counter::new("scooterd.acceptor.promises.refused");
static ACCEPTS: Counter = Counter::new("scooterd.acceptor.accepts");
static ACCEPTS_REFUSED: Counter = Counter::new("scooterd.acceptor.accepts.refused");
static COMMITS: Counter = Counter::new("scooterd.acceptor.commits");
static COMMITS_REPEATED: Counter = Counter::new("scooterd.acceptor.commits.repeated");

pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&PROMISES);
    collector.register_counter(&PROMISES_REFUSED);
    collector.register_counter(&ACCEPTS);
    collector.register_counter(&ACCEPTS_REFUSED);
    collector.register_counter(&COMMITS);
    collector.register_counter(&COMMITS_REPEATED);
}

///////////////////////////////////////////// Instance /////////////////////////////////////////////

#[derive(Default)]
struct Instance {
    last_round: Ballot,
    last_good: Ballot,
    value: Vec<u8>,
    decided: bool,
    decided_value: Vec<u8>,
    apply_error: Option<Error>,
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

/// The acceptor for every slot on this replica.  Commit feeds the log and the state machine, so
/// application order on a replica is the order in which commits first arrive here.
pub struct Acceptor {
    instances: Mutex<BTreeMap<i64, Instance>>,
    log: Arc<ReplicatedLog>,
    machine: Arc<StateMachine>,
}

impl Acceptor {
    pub fn new(log: Arc<ReplicatedLog>, machine: Arc<StateMachine>) -> Self {
        Self {
            instances: Mutex::new(BTreeMap::new()),
            log,
            machine,
        }
    }

    /// Promise `ballot` for `slot` iff it supersedes the highest ballot seen there.  The reply
    /// always echoes the last accepted (round, value) pair so the proposer can adopt it.
    pub fn prepare(&self, ballot: Ballot, slot: i64) -> Phase1B {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.entry(slot).or_default();
        let ack = ballot > instance.last_round;
        if ack {
            PROMISES.click();
            instance.last_round = ballot;
        } else {
            PROMISES_REFUSED.click();
        }
        Phase1B {
            ballot,
            ack,
            last_good: instance.last_good,
            value: instance.value.clone(),
            slot,
        }
    }

    /// Accept the pvalue iff its ballot is at least the one promised, or the instance has never
    /// seen a ballot at all.  The untouched-instance escape keeps first-writer-wins semantics on
    /// slots no prepare ever reached.
    pub fn accept(&self, pvalue: &PValue) -> Phase2B {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.entry(pvalue.slot).or_default();
        let ack = pvalue.ballot >= instance.last_round || instance.last_round == Ballot::BOTTOM;
        if ack {
            ACCEPTS.click();
            instance.last_round = pvalue.ballot;
            instance.last_good = pvalue.ballot;
            instance.value = pvalue.command.clone();
        } else {
            ACCEPTS_REFUSED.click();
        }
        Phase2B {
            ballot: pvalue.ballot,
            ack,
        }
    }

    /// Learn that `slot` was decided.  The first delivery appends to the log and applies to the
    /// state machine; repeats are no-ops.  Empty command bytes mark the slot decided without
    /// touching the log or the machine.
    pub fn learn(&self, slot: i64, command: &[u8]) {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.entry(slot).or_default();
        if instance.decided {
            COMMITS_REPEATED.click();
            return;
        }
        COMMITS.click();
        instance.decided = true;
        instance.decided_value = command.to_vec();
        if command.is_empty() {
            return;
        }
        self.log.append(slot, command.to_vec());
        if let Err(err) = self.machine.apply(command) {
            clue!(COLLECTOR, DEBUG, {
                apply_rejected: {
                    slot: slot,
                    error: err.to_string(),
                },
            });
            instance.apply_error = Some(err);
        }
        clue!(COLLECTOR, INFO, {
            decided: {
                slot: slot,
            },
        });
    }

    /// The decided value for `slot`, if this replica has learned one.
    pub fn decided_value(&self, slot: i64) -> Option<Vec<u8>> {
        let instances = self.instances.lock().unwrap();
        instances
            .get(&slot)
            .filter(|instance| instance.decided)
            .map(|instance| instance.decided_value.clone())
    }

    /// The domain error the decided command at `slot` drew when it was applied, if any.  This is
    /// what lets the boundary answer 409 for a command that committed but changed nothing.
    pub fn apply_error(&self, slot: i64) -> Option<Error> {
        let instances = self.instances.lock().unwrap();
        instances
            .get(&slot)
            .and_then(|instance| instance.apply_error.clone())
    }
}

impl AcceptorService for Arc<Acceptor> {
    fn phase1(&self, _: &Context, req: Phase1A) -> Result<Phase1B, Error> {
        Ok(self.prepare(req.ballot, req.slot))
    }

    fn phase2(&self, _: &Context, req: Phase2A) -> Result<Phase2B, Error> {
        Ok(self.accept(&req.pvalue))
    }

    fn commit(&self, _: &Context, req: CommitRequest) -> Result<CommitResponse, Error> {
        self.learn(req.slot, &req.command);
        Ok(CommitResponse {})
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
