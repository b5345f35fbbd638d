//! scooter_pb provides the wire protocol for the replicated scooter store:  the per-slot Paxos
//! messages, the log-recovery messages, the coordination-service messages, and the error type
//! shared by every service.

use one_two_eight::{generate_id, generate_id_prototk};
use prototk_derive::Message;
use rpc_pb::service;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The deadline for a single Paxos message exchange.
pub const PAXOS_TIMEOUT_MILLIS: u64 = 2_000;
/// The deadline for a single recovery exchange.
pub const RECOVERY_TIMEOUT_MILLIS: u64 = 5_000;

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

generate_id!(ReplicaID, "replica:");
generate_id_prototk!(ReplicaID);

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type shared by every scooter service.  Domain errors (NotFound, AlreadyExists,
/// NotAvailable, NotReserved) are returned by the state machine and surfaced at the boundary; a
/// command that draws one has still consumed its log slot.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(565248, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while packing or unpacking a message.
    #[prototk(565249, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: prototk::Error,
    },
    /// An error at the RPC layer.
    #[prototk(565250, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// Command or snapshot bytes that did not decode.
    #[prototk(565251, message)]
    CodecError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// A Paxos phase fell below its quorum.
    #[prototk(565252, message)]
    QuorumFailure {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The phase that failed (1 or 2).
        #[prototk(2, uint64)]
        phase: u64,
        /// The number of acks gathered.
        #[prototk(3, uint64)]
        acks: u64,
        /// The number of acks required.
        #[prototk(4, uint64)]
        quorum: u64,
    },
    /// Every proposal attempt decided someone else's command.
    #[prototk(565253, message)]
    ProposalLost {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The number of slots tried.
        #[prototk(2, uint64)]
        attempts: u64,
    },
    /// The scooter does not exist.
    #[prototk(565254, message)]
    NotFound {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The scooter in question.
        #[prototk(2, string)]
        id: String,
    },
    /// The scooter already exists.
    #[prototk(565255, message)]
    AlreadyExists {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The scooter in question.
        #[prototk(2, string)]
        id: String,
    },
    /// The scooter is reserved by someone else.
    #[prototk(565256, message)]
    NotAvailable {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The scooter in question.
        #[prototk(2, string)]
        id: String,
    },
    /// The scooter has no reservation to release.
    #[prototk(565257, message)]
    NotReserved {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The scooter in question.
        #[prototk(2, string)]
        id: String,
    },
    /// A ride reported a negative distance.
    #[prototk(565258, message)]
    InvalidDistance {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The distance reported.
        #[prototk(2, double)]
        distance: f64,
    },
    /// The coordination service could not be reached.
    #[prototk(565259, message)]
    CoordinationFailure {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// A logic error in the replica.
    #[prototk(565260, message)]
    LogicError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(what: buffertk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
}

impl From<rpc_pb::Error> for Error {
    fn from(what: rpc_pb::Error) -> Self {
        Self::RpcError {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Self {
        Self::LogicError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

iotoz! {Error}

////////////////////////////////////////////// Ballot //////////////////////////////////////////////

/// A Ballot uniquely identifies one Paxos attempt.  It is the ordered pair (number, leader);
/// comparison is lexicographic, so a proposer whose ballot gets superseded can always pick a
/// number that supersedes the competition in turn.  No two replicas ever drive the same ballot
/// because the leader component is theirs alone.
#[derive(Clone, Copy, Debug, Eq, Hash, Message, PartialEq, PartialOrd, Ord)]
pub struct Ballot {
    #[prototk(1, uint64)]
    pub number: u64,
    #[prototk(2, message)]
    pub leader: ReplicaID,
}

impl Ballot {
    /// The smallest possible ballot.  Every acceptor instance starts here, and phase two treats
    /// an instance still at BOTTOM as writable by any ballot.
    pub const BOTTOM: Ballot = Ballot {
        number: 0,
        leader: ReplicaID::BOTTOM,
    };

    /// The largest possible ballot.
    pub const TOP: Ballot = Ballot {
        number: u64::MAX,
        leader: ReplicaID::TOP,
    };
}

impl Default for Ballot {
    fn default() -> Self {
        Self::BOTTOM
    }
}

////////////////////////////////////////////// PValue //////////////////////////////////////////////

/// A proposed value:  the proposer championing `ballot` proposes putting `command` into `slot`.
/// The command bytes are the Paxos value itself, so a decided slot yields identical bytes on
/// every replica that learns it.
#[derive(Clone, Debug, Eq, Message, PartialEq)]
pub struct PValue {
    #[prototk(1, sint64)]
    pub slot: i64,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, bytes)]
    pub command: Vec<u8>,
}

impl Default for PValue {
    fn default() -> Self {
        Self {
            slot: 0,
            ballot: Ballot::BOTTOM,
            command: Vec::new(),
        }
    }
}

////////////////////////////////////////////// Phase1A /////////////////////////////////////////////

/// Phase1A messages rally support for a ballot in one slot.  Answered with [Phase1B].
#[derive(Clone, Debug, Default, Message)]
pub struct Phase1A {
    #[prototk(1, message)]
    pub ballot: Ballot,
    #[prototk(2, sint64)]
    pub slot: i64,
}

////////////////////////////////////////////// Phase1B /////////////////////////////////////////////

/// Phase1B messages say whether the acceptor promised the ballot, and echo the last value the
/// acceptor accepted so the proposer can adopt it.
#[derive(Clone, Debug, Default, Message)]
pub struct Phase1B {
    #[prototk(1, message)]
    pub ballot: Ballot,
    #[prototk(2, Bool)]
    pub ack: bool,
    #[prototk(3, message)]
    pub last_good: Ballot,
    #[prototk(4, bytes)]
    pub value: Vec<u8>,
    #[prototk(5, sint64)]
    pub slot: i64,
}

////////////////////////////////////////////// Phase2A /////////////////////////////////////////////

/// Phase2A messages ask the acceptor to accept a [PValue] under a previously rallied ballot.
#[derive(Clone, Debug, Default, Message)]
pub struct Phase2A {
    #[prototk(1, message)]
    pub pvalue: PValue,
}

////////////////////////////////////////////// Phase2B /////////////////////////////////////////////

/// Phase2B messages say whether the [Phase2A] was accepted.
#[derive(Clone, Debug, Default, Message)]
pub struct Phase2B {
    #[prototk(1, message)]
    pub ballot: Ballot,
    #[prototk(2, Bool)]
    pub ack: bool,
}

//////////////////////////////////////////// CommitRequest /////////////////////////////////////////

/// CommitRequest teaches an acceptor that a slot was decided.  It is out of protocol:  losing it
/// is safe because recovery or a later Phase1B teaches the slot again.
#[derive(Clone, Debug, Default, Message)]
pub struct CommitRequest {
    #[prototk(1, sint64)]
    pub slot: i64,
    #[prototk(2, bytes)]
    pub command: Vec<u8>,
}

/// The empty response to a [CommitRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct CommitResponse {}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

service! {
    name = AcceptorService;
    server = AcceptorServer;
    client = AcceptorClient;
    error = Error;

    rpc phase1(Phase1A) -> Phase1B;
    rpc phase2(Phase2A) -> Phase2B;
    rpc commit(CommitRequest) -> CommitResponse;
}

///////////////////////////////////////////// LogEntry /////////////////////////////////////////////

/// One slot of the replicated log.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct LogEntry {
    #[prototk(1, sint64)]
    pub index: i64,
    #[prototk(2, bytes)]
    pub command: Vec<u8>,
}

/////////////////////////////////////////// GetLogRequest //////////////////////////////////////////

/// GetLogRequest asks a peer for everything from `starting_index` forward.
#[derive(Clone, Debug, Default, Message)]
pub struct GetLogRequest {
    #[prototk(1, sint64)]
    pub starting_index: i64,
}

/////////////////////////////////////////// GetLogResponse /////////////////////////////////////////

/// GetLogResponse carries a log suffix, the responder's commit watermark, and, when the request
/// started below the responder's snapshot, the snapshot itself.  `snapshot_index` is -1 when no
/// snapshot rides along.
#[derive(Clone, Debug, Message)]
pub struct GetLogResponse {
    #[prototk(1, message)]
    pub entries: Vec<LogEntry>,
    #[prototk(2, sint64)]
    pub commit_index: i64,
    #[prototk(3, bytes)]
    pub snapshot_data: Vec<u8>,
    #[prototk(4, sint64)]
    pub snapshot_index: i64,
}

impl GetLogResponse {
    /// Does this response carry a snapshot?
    pub fn has_snapshot(&self) -> bool {
        self.snapshot_index >= 0
    }
}

impl Default for GetLogResponse {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            commit_index: -1,
            snapshot_data: Vec::new(),
            snapshot_index: -1,
        }
    }
}

///////////////////////////////////////////// Recovery /////////////////////////////////////////////

service! {
    name = RecoveryService;
    server = RecoveryServer;
    client = RecoveryClient;
    error = Error;

    rpc get_log(GetLogRequest) -> GetLogResponse;
}

////////////////////////////////////////////// Member //////////////////////////////////////////////

/// One member of the cluster as known to the coordination service.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Member {
    #[prototk(1, message)]
    pub replica: ReplicaID,
    #[prototk(2, string)]
    pub connect: String,
}

//////////////////////////////////////////// Coordination //////////////////////////////////////////

/// RegisterRequest announces a member and refreshes its lease.
#[derive(Clone, Debug, Default, Message)]
pub struct RegisterRequest {
    #[prototk(1, message)]
    pub member: Member,
}

/// RegisterResponse carries the lease duration; re-register before it elapses or be forgotten.
#[derive(Clone, Debug, Default, Message)]
pub struct RegisterResponse {
    #[prototk(1, uint64)]
    pub time_to_live_secs: u64,
}

/// MembersRequest asks for the live membership.
#[derive(Clone, Debug, Default, Message)]
pub struct MembersRequest {}

/// MembersResponse lists the live members and the deterministically elected leader (the smallest
/// live ReplicaID).
#[derive(Clone, Debug, Default, Message)]
pub struct MembersResponse {
    #[prototk(1, message)]
    pub members: Vec<Member>,
    #[prototk(2, message)]
    pub leader: ReplicaID,
}

service! {
    name = CoordinationService;
    server = CoordinationServer;
    client = CoordinationClient;
    error = Error;

    rpc register(RegisterRequest) -> RegisterResponse;
    rpc members(MembersRequest) -> MembersResponse;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
