//! The Paxos active role.  A [Proposer] drives one command to decision in one slot:  rally a
//! ballot, adopt the highest previously-accepted value, get the pvalue accepted, then broadcast
//! the decision.  Peers that stay silent past the deadline count as refusals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use biometrics::{Collector, Counter};
use indicio::{clue, DEBUG, INFO};
use rpc_pb::Context;
use zerror_core::ErrorCore;

use scooter_pb::{
    AcceptorClient, AcceptorService, Ballot, CommitRequest, Error, PValue, Phase1A, Phase1B,
    Phase2A, Phase2B, ReplicaID, PAXOS_TIMEOUT_MILLIS,
};

use crate::acceptor::Acceptor;
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROPOSALS: Counter = Counter::new("scooterd.proposer.proposals");
static PROPOSALS_DECIDED: Counter = Counter::new("scooterd.proposer.proposals.decided");
static VALUES_ADOPTED: Counter = Counter::new("scooterd.proposer.values_adopted");
static QUORUM_FAILURES: Counter = Counter::new("scooterd.proposer.quorum_failures");
static PEER_ERRORS: Counter = Counter::new("scooterd.proposer.peer_errors");

pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&PROPOSALS);
    collector.register_counter(&PROPOSALS_DECIDED);
    collector.register_counter(&VALUES_ADOPTED);
    collector.register_counter(&QUORUM_FAILURES);
    collector.register_counter(&PEER_ERRORS);
}

///////////////////////////////////////////// Proposer /////////////////////////////////////////////

/// A proposer bound to this replica's acceptor and its peers.  Any replica may propose; competing
/// proposers resolve through ballot order.
pub struct Proposer {
    us: ReplicaID,
    counter: AtomicU64,
    local: Arc<Acceptor>,
    peers: Vec<Arc<AcceptorClient>>,
    timeout: Duration,
}

impl Proposer {
    pub fn new(us: ReplicaID, local: Arc<Acceptor>, peers: Vec<Arc<AcceptorClient>>) -> Self {
        Self {
            us,
            counter: AtomicU64::new(0),
            local,
            peers,
            timeout: Duration::from_millis(PAXOS_TIMEOUT_MILLIS),
        }
    }

    /// Override the per-phase deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The number of acceptors that must answer yes:  a majority of peers plus ourselves.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Drive `command` to decision in `slot`.  The returned bytes are whatever the slot decided;
    /// callers that find someone else's command there retry at a fresh slot.
    pub fn propose(&self, command: Vec<u8>, slot: i64) -> Result<Vec<u8>, Error> {
        PROPOSALS.click();
        let number = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let ballot = Ballot {
            number,
            leader: self.us,
        };
        let quorum = self.quorum();
        // Phase 1:  rally the ballot.
        let local = self.local.prepare(ballot, slot);
        let needed = quorum - usize::from(local.ack);
        let mut promises = self.fan_out(
            move |peer| peer.phase1(&Context::default(), Phase1A { ballot, slot }),
            |resp: &Phase1B| resp.ack,
            needed,
        );
        promises.push(local);
        let acks = promises.iter().filter(|p| p.ack).count();
        if acks < quorum {
            QUORUM_FAILURES.click();
            // Fast-forward the counter past any round the refusals revealed so the next attempt
            // does not lose the same race.
            if let Some(best) = promises.iter().map(|p| p.last_good.number).max() {
                self.counter.fetch_max(best, Ordering::Relaxed);
            }
            return Err(Error::QuorumFailure {
                core: ErrorCore::default(),
                phase: 1,
                acks: acks as u64,
                quorum: quorum as u64,
            });
        }
        // Adopt the value from the highest round already accepted, if there is one.  Equal rounds
        // carry equal values, so ties need no breaking.
        let mut chosen = command;
        let mut best = Ballot::BOTTOM;
        for promise in promises.iter().filter(|p| p.ack) {
            if promise.last_good > best {
                best = promise.last_good;
                chosen = promise.value.clone();
            }
        }
        if best > Ballot::BOTTOM {
            VALUES_ADOPTED.click();
            clue!(COLLECTOR, DEBUG, {
                adopted: {
                    slot: slot,
                    from_ballot: best.number,
                },
            });
        }
        // Phase 2:  get the pvalue accepted.
        let pvalue = PValue {
            slot,
            ballot,
            command: chosen.clone(),
        };
        let local = self.local.accept(&pvalue);
        let needed = quorum - usize::from(local.ack);
        let accepts = self.fan_out(
            {
                let pvalue = pvalue.clone();
                move |peer| {
                    peer.phase2(
                        &Context::default(),
                        Phase2A {
                            pvalue: pvalue.clone(),
                        },
                    )
                }
            },
            |resp: &Phase2B| resp.ack,
            needed,
        );
        let acks = accepts.iter().filter(|a| a.ack).count() + usize::from(local.ack);
        if acks < quorum {
            QUORUM_FAILURES.click();
            return Err(Error::QuorumFailure {
                core: ErrorCore::default(),
                phase: 2,
                acks: acks as u64,
                quorum: quorum as u64,
            });
        }
        // Commit:  synchronous locally, fire-and-forget to peers.  A peer that misses this learns
        // the slot from recovery or from a later phase 1.
        self.local.learn(slot, &chosen);
        for peer in self.peers.iter() {
            let peer = Arc::clone(peer);
            let req = CommitRequest {
                slot,
                command: chosen.clone(),
            };
            thread::spawn(move || {
                let _ = peer.commit(&Context::default(), req);
            });
        }
        PROPOSALS_DECIDED.click();
        clue!(COLLECTOR, INFO, {
            decided: {
                slot: slot,
                ballot: ballot.number,
            },
        });
        Ok(chosen)
    }

    /// Issue `call` against every peer in parallel and gather responses until `needed` acks
    /// arrive, every peer has answered, or the deadline passes.  Errors and timeouts are silent
    /// refusals.
    fn fan_out<R, F, P>(&self, call: F, is_ack: P, needed: usize) -> Vec<R>
    where
        R: Send + 'static,
        F: Fn(&AcceptorClient) -> Result<R, Error> + Clone + Send + 'static,
        P: Fn(&R) -> bool,
    {
        let (tx, rx) = mpsc::channel();
        for peer in self.peers.iter() {
            let tx = tx.clone();
            let peer = Arc::clone(peer);
            let call = call.clone();
            thread::spawn(move || {
                let _ = tx.send(call(&peer));
            });
        }
        drop(tx);
        let deadline = Instant::now() + self.timeout;
        let mut responses = Vec::new();
        let mut acks = 0;
        while acks < needed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(Ok(resp)) => {
                    if is_ack(&resp) {
                        acks += 1;
                    }
                    responses.push(resp);
                }
                Ok(Err(err)) => {
                    PEER_ERRORS.click();
                    clue!(COLLECTOR, DEBUG, {
                        peer_error: err.to_string(),
                    });
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
        responses
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use crate::log::ReplicatedLog;
    use crate::loopback::LoopbackClient;
    use crate::machine::StateMachine;

    use super::*;

    struct Node {
        acceptor: Arc<Acceptor>,
        log: Arc<ReplicatedLog>,
        loopback: Arc<LoopbackClient>,
    }

    fn node() -> Node {
        let log = Arc::new(ReplicatedLog::new());
        let machine = Arc::new(StateMachine::new());
        let acceptor = Arc::new(Acceptor::new(Arc::clone(&log), Arc::clone(&machine)));
        let loopback = Arc::new(LoopbackClient::new(
            Arc::clone(&acceptor),
            Arc::clone(&log),
            machine,
        ));
        Node {
            acceptor,
            log,
            loopback,
        }
    }

    fn replica(byte: u8) -> ReplicaID {
        ReplicaID::new([byte; 16])
    }

    fn proposer_for(us: u8, local: &Node, peers: &[&Node]) -> Proposer {
        let clients = peers
            .iter()
            .map(|node| {
                Arc::new(AcceptorClient::new(
                    Arc::clone(&node.loopback) as Arc<dyn rpc_pb::Client + Send + Sync>
                ))
            })
            .collect();
        Proposer::new(replica(us), Arc::clone(&local.acceptor), clients)
            .with_timeout(Duration::from_millis(100))
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !cond() {
            if Instant::now() >= deadline {
                panic!("condition never held");
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn single_node_cluster_decides_alone() {
        let a = node();
        let proposer = proposer_for(1, &a, &[]);
        assert_eq!(1, proposer.quorum());
        let decided = proposer.propose(b"cmd".to_vec(), 0).unwrap();
        assert_eq!(b"cmd".to_vec(), decided);
        assert_eq!(Some(b"cmd".to_vec()), a.acceptor.decided_value(0));
    }

    #[test]
    fn three_node_cluster_decides_and_broadcasts() {
        let a = node();
        let b = node();
        let c = node();
        let proposer = proposer_for(1, &a, &[&b, &c]);
        assert_eq!(2, proposer.quorum());
        let decided = proposer.propose(b"cmd".to_vec(), 0).unwrap();
        assert_eq!(b"cmd".to_vec(), decided);
        // Commit is fire-and-forget to peers; wait for delivery.
        wait_until(|| b.acceptor.decided_value(0).is_some());
        wait_until(|| c.acceptor.decided_value(0).is_some());
        assert_eq!(Some(b"cmd".to_vec()), b.acceptor.decided_value(0));
        assert_eq!(Some(b"cmd".to_vec()), c.acceptor.decided_value(0));
        assert_eq!(Some(b"cmd".to_vec()), b.log.get_entry(0));
    }

    #[test]
    fn survives_a_minority_of_silent_peers() {
        let a = node();
        let b = node();
        let c = node();
        c.loopback.sever();
        let proposer = proposer_for(1, &a, &[&b, &c]);
        let decided = proposer.propose(b"cmd".to_vec(), 0).unwrap();
        assert_eq!(b"cmd".to_vec(), decided);
        wait_until(|| b.acceptor.decided_value(0).is_some());
        assert_eq!(None, c.acceptor.decided_value(0));
    }

    #[test]
    fn fails_without_a_quorum() {
        let a = node();
        let b = node();
        let c = node();
        b.loopback.sever();
        c.loopback.sever();
        let proposer = proposer_for(1, &a, &[&b, &c]);
        let err = proposer.propose(b"cmd".to_vec(), 0).unwrap_err();
        assert!(matches!(err, Error::QuorumFailure { phase: 1, .. }));
    }

    #[test]
    fn adopts_a_previously_accepted_value() {
        let a = node();
        let b = node();
        let c = node();
        // Someone already got "theirs" accepted at slot 0 on b and c.
        let pvalue = PValue {
            slot: 0,
            ballot: Ballot {
                number: 1,
                leader: replica(9),
            },
            command: b"theirs".to_vec(),
        };
        assert!(b.acceptor.accept(&pvalue).ack);
        assert!(c.acceptor.accept(&pvalue).ack);
        let proposer = proposer_for(1, &a, &[&b, &c]);
        // The first ballot (1, us) is superseded by the accepted (1, them); the retry rallies a
        // fresh ballot and adopts their value.
        let err = proposer.propose(b"ours".to_vec(), 0).unwrap_err();
        assert!(matches!(err, Error::QuorumFailure { phase: 1, .. }));
        let decided = proposer.propose(b"ours".to_vec(), 0).unwrap();
        assert_eq!(b"theirs".to_vec(), decided);
    }

    #[test]
    fn competing_proposers_agree_on_one_value() {
        let a = node();
        let b = node();
        let c = node();
        let proposer_a = proposer_for(1, &a, &[&b, &c]);
        let proposer_c = proposer_for(3, &c, &[&a, &b]);
        let first = proposer_a.propose(b"from-a".to_vec(), 0);
        let second = proposer_c.propose(b"from-c".to_vec(), 0);
        // Whatever each proposer reports, the decided slot holds exactly one value everywhere.
        let decided = a.acceptor.decided_value(0).unwrap();
        wait_until(|| b.acceptor.decided_value(0).is_some());
        wait_until(|| c.acceptor.decided_value(0).is_some());
        assert_eq!(Some(decided.clone()), b.acceptor.decided_value(0));
        assert_eq!(Some(decided.clone()), c.acceptor.decided_value(0));
        for result in [first, second].into_iter().flatten() {
            assert_eq!(decided, result);
        }
    }

    #[test]
    fn ballots_increase_across_attempts() {
        let a = node();
        let b = node();
        let c = node();
        b.loopback.sever();
        c.loopback.sever();
        let proposer = proposer_for(1, &a, &[&b, &c]);
        let _ = proposer.propose(b"one".to_vec(), 0);
        b.loopback.restore();
        c.loopback.restore();
        let decided = proposer.propose(b"two".to_vec(), 0).unwrap();
        // The first attempt promised (1, us) locally; the second superseded it with (2, us).
        assert_eq!(b"two".to_vec(), decided);
    }
}
