//! An in-process [rpc_pb::Client] that dispatches straight into this replica's servers.  The
//! test harness wires whole clusters with it, and the sever/restore switch stands in for a
//! network partition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rpc_pb::{Client, Context, Server, Status};
use zerror_core::ErrorCore;

use scooter_pb::{AcceptorServer, CoordinationServer, RecoveryServer};

use crate::acceptor::Acceptor;
use crate::coordination::MemoryCoordination;
use crate::log::ReplicatedLog;
use crate::machine::StateMachine;
use crate::recovery::Recovery;

////////////////////////////////////////// LoopbackClient //////////////////////////////////////////

pub struct LoopbackClient {
    acceptor: AcceptorServer<Arc<Acceptor>>,
    recovery: RecoveryServer<Arc<Recovery>>,
    coordination: Option<CoordinationServer<Arc<MemoryCoordination>>>,
    severed: AtomicBool,
}

impl LoopbackClient {
    pub fn new(
        acceptor: Arc<Acceptor>,
        log: Arc<ReplicatedLog>,
        machine: Arc<StateMachine>,
    ) -> Self {
        let recovery = Arc::new(Recovery::new(log, machine));
        Self {
            acceptor: AcceptorServer::bind(acceptor),
            recovery: RecoveryServer::bind(recovery),
            coordination: None,
            severed: AtomicBool::new(false),
        }
    }

    /// Route CoordinationService calls to the given coordinator as well.
    pub fn with_coordination(mut self, coordination: Arc<MemoryCoordination>) -> Self {
        self.coordination = Some(CoordinationServer::bind(coordination));
        self
    }

    /// Drop every call until [LoopbackClient::restore].
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    /// Heal the partition.
    pub fn restore(&self) {
        self.severed.store(false, Ordering::SeqCst);
    }
}

impl Client for LoopbackClient {
    fn call(&self, ctx: &Context, server: &str, method: &str, req: &[u8]) -> Status {
        if self.severed.load(Ordering::SeqCst) {
            return Err(rpc_pb::Error::TransportFailure {
                core: ErrorCore::default(),
                what: "link severed".to_owned(),
            });
        }
        match server {
            "AcceptorService" => self.acceptor.call(ctx, method, req),
            "RecoveryService" => self.recovery.call(ctx, method, req),
            "CoordinationService" => match &self.coordination {
                Some(coordination) => coordination.call(ctx, method, req),
                None => Err(rpc_pb::Error::UnknownServerName {
                    core: ErrorCore::default(),
                    name: server.to_owned(),
                }),
            },
            _ => Err(rpc_pb::Error::UnknownServerName {
                core: ErrorCore::default(),
                name: server.to_owned(),
            }),
        }
    }
}
