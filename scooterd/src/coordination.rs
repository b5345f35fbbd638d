//! Cluster membership through the coordination service.  Replicas register at startup and keep
//! their lease alive; the member set and the deterministic leader (smallest live ReplicaID) fall
//! out of whoever holds a live lease.  Replication never depends on the leader; it exists for
//! operators and for the front end.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use biometrics::{Collector, Counter};
use indicio::{clue, INFO, WARNING};
use rpc_pb::Context;
use zerror_core::ErrorCore;

use scooter_pb::{
    CoordinationClient, CoordinationService, Error, Member, MembersRequest, MembersResponse,
    RegisterRequest, RegisterResponse, ReplicaID,
};

use crate::COLLECTOR;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// How long a registration lives without a refresh.
pub const DEFAULT_TIME_TO_LIVE_SECS: u64 = 60;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static REGISTRATIONS: Counter = Counter::new("scooterd.coordination.registrations");
static EXPIRATIONS: Counter = Counter::new("scooterd.coordination.expirations");
static KEEPALIVE_FAILURES: Counter = Counter::new("scooterd.coordination.keepalive_failures");

pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&REGISTRATIONS);
    collector.register_counter(&EXPIRATIONS);
    collector.register_counter(&KEEPALIVE_FAILURES);
}

////////////////////////////////////// MemoryCoordination //////////////////////////////////////////

/// The in-memory coordination service hosted by scooter-coordinator.  All state is a member map
/// with lease expiries; expired members get pruned whenever the map is read.
pub struct MemoryCoordination {
    ttl: Duration,
    members: Mutex<BTreeMap<ReplicaID, (Member, Instant)>>,
}

impl MemoryCoordination {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            members: Mutex::default(),
        }
    }

    /// The live member set and the elected leader.  Leader is ReplicaID::BOTTOM when nobody is
    /// registered.
    pub fn live_members(&self) -> (Vec<Member>, ReplicaID) {
        let mut members = self.members.lock().unwrap();
        let now = Instant::now();
        let before = members.len();
        members.retain(|_, (_, expiry)| *expiry > now);
        for _ in members.len()..before {
            EXPIRATIONS.click();
        }
        let leader = members
            .keys()
            .next()
            .copied()
            .unwrap_or(ReplicaID::BOTTOM);
        let members = members.values().map(|(member, _)| member.clone()).collect();
        (members, leader)
    }

    fn check_member(member: &Member) -> Result<(), Error> {
        if member.replica == ReplicaID::BOTTOM || member.replica == ReplicaID::TOP {
            return Err(Error::CoordinationFailure {
                core: ErrorCore::default(),
                what: "replica id must not be bottom or top".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TIME_TO_LIVE_SECS))
    }
}

impl CoordinationService for Arc<MemoryCoordination> {
    fn register(&self, _: &Context, req: RegisterRequest) -> Result<RegisterResponse, Error> {
        MemoryCoordination::check_member(&req.member)?;
        REGISTRATIONS.click();
        let expiry = Instant::now() + self.ttl;
        {
            let mut members = self.members.lock().unwrap();
            members.insert(req.member.replica, (req.member.clone(), expiry));
        }
        clue!(COLLECTOR, INFO, {
            register: {
                replica: req.member.replica.human_readable(),
                connect: req.member.connect,
            },
        });
        Ok(RegisterResponse {
            time_to_live_secs: self.ttl.as_secs(),
        })
    }

    fn members(&self, _: &Context, _: MembersRequest) -> Result<MembersResponse, Error> {
        let (members, leader) = self.live_members();
        Ok(MembersResponse { members, leader })
    }
}

//////////////////////////////////////////// Membership ////////////////////////////////////////////

/// The replica side of membership:  register once at startup (failure there is fatal), then
/// refresh from a keepalive thread.  A replica that stops refreshing ages out of the member set.
pub struct Membership {
    client: CoordinationClient,
    member: Member,
}

impl Membership {
    pub fn new(client: CoordinationClient, member: Member) -> Self {
        Self { client, member }
    }

    /// Register (or refresh) this replica.  Returns the lease duration in seconds.
    pub fn register(&self) -> Result<u64, Error> {
        let req = RegisterRequest {
            member: self.member.clone(),
        };
        let resp = self
            .client
            .register(&Context::default(), req)
            .map_err(|err| Error::CoordinationFailure {
                core: ErrorCore::default(),
                what: err.to_string(),
            })?;
        Ok(resp.time_to_live_secs)
    }

    /// The live member set.
    pub fn members(&self) -> Result<Vec<Member>, Error> {
        let resp = self.client.members(&Context::default(), MembersRequest {})?;
        Ok(resp.members)
    }

    /// The deterministically elected leader.
    pub fn leader(&self) -> Result<ReplicaID, Error> {
        let resp = self.client.members(&Context::default(), MembersRequest {})?;
        Ok(resp.leader)
    }

    /// Refresh the lease forever from a background thread.
    pub fn start_keepalive(membership: Arc<Membership>, time_to_live_secs: u64) {
        let interval = Duration::from_secs(std::cmp::max(1, time_to_live_secs / 3));
        thread::spawn(move || loop {
            thread::sleep(interval);
            if let Err(err) = membership.register() {
                KEEPALIVE_FAILURES.click();
                clue!(COLLECTOR, WARNING, {
                    keepalive_failed: err.to_string(),
                });
            }
        });
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
