//! scooterd is a replicated, strongly-consistent scooter store.  Every replica runs the same
//! stack:  a per-slot Paxos acceptor and proposer, an in-memory replicated log with snapshot
//! truncation, a deterministic state machine over the scooter map, startup recovery from peers,
//! and an HTTP boundary that turns domain verbs into log proposals.

use biometrics::Collector;

pub mod acceptor;
pub mod coordination;
pub mod http;
pub mod log;
pub mod loopback;
pub mod machine;
pub mod proposer;
pub mod recovery;
pub mod replica;

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &mut Collector) {
    acceptor::register_biometrics(collector);
    coordination::register_biometrics(collector);
    log::register_biometrics(collector);
    machine::register_biometrics(collector);
    proposer::register_biometrics(collector);
    recovery::register_biometrics(collector);
    replica::register_biometrics(collector);
}
