use std::fs::File;
use std::sync::Arc;
use std::time::SystemTime;

use arrrg::CommandLine;
use biometrics::{Collector, PlainTextEmitter};
use busyrpc::{
    new_client, ClientOptions, Server, ServerOptions, ServiceRegistry, SslOptions, StringResolver,
};
use indicio::{
    clue,
    stdio::StdioEmitter,
    {ALWAYS, INFO},
};

use scooter_pb::{
    AcceptorClient, AcceptorServer, CoordinationClient, IoToZ, Member, RecoveryClient,
    RecoveryServer, ReplicaID,
};

use scooterd::acceptor::Acceptor;
use scooterd::COLLECTOR;
use scooterd::coordination::Membership;
use scooterd::log::ReplicatedLog;
use scooterd::machine::StateMachine;
use scooterd::proposer::Proposer;
use scooterd::recovery::{self, Recovery};
use scooterd::replica::Replica;

#[derive(Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(nested)]
    ssl: SslOptions,
    #[arrrg(nested)]
    server: ServerOptions,
    #[arrrg(nested)]
    client: ClientOptions,
    #[arrrg(required, "Replica identity in replica:UUID form.")]
    replica_id: ReplicaID,
    #[arrrg(optional, "Comma-separated peer list in host:ID=hostname:port form.")]
    peers: String,
    #[arrrg(optional, "Port to serve the scooter HTTP API on.")]
    http_port: u16,
    #[arrrg(
        required,
        "Coordination service connection string in host:ID=hostname:port form."
    )]
    coordination: StringResolver,
    #[arrrg(flag, "Emit biometrics to stdout.")]
    biometrics: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ssl: SslOptions::default(),
            server: ServerOptions::default(),
            client: ClientOptions::default(),
            replica_id: ReplicaID::default(),
            peers: String::new(),
            http_port: 8080,
            coordination: StringResolver::default(),
            biometrics: false,
        }
    }
}

fn main() {
    minimal_signals::block();
    let (options, free) = Options::from_command_line("Usage: scooterd [OPTIONS]");
    if !free.is_empty() {
        eprintln!("command takes no arguments");
        std::process::exit(1);
    }
    // indicio
    let emitter = Arc::new(StdioEmitter);
    COLLECTOR.register(emitter);
    COLLECTOR.set_verbosity(INFO);
    clue!(COLLECTOR, ALWAYS, {
        new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
    // biometrics
    if options.biometrics {
        std::thread::spawn(|| {
            let mut collector = Collector::new();
            scooterd::register_biometrics(&mut collector);
            busyrpc::register_biometrics(&mut collector);
            let fout = File::create("/dev/stdout").unwrap();
            let mut emit = PlainTextEmitter::new(fout);
            loop {
                let now = SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .expect("clock should never fail")
                    .as_millis()
                    .try_into()
                    .expect("millis since epoch should fit u64");
                if let Err(e) = collector.emit(&mut emit, now) {
                    eprintln!("collector error: {}", e);
                }
                std::thread::sleep(std::time::Duration::from_millis(249));
            }
        });
    }
    // replication core
    let machine = Arc::new(StateMachine::new());
    let log = Arc::new(ReplicatedLog::new());
    let acceptor = Arc::new(Acceptor::new(Arc::clone(&log), Arc::clone(&machine)));
    // peer clients
    let mut acceptors = Vec::new();
    let mut recoveries = Vec::new();
    for peer in options.peers.split(',').filter(|p| !p.is_empty()) {
        let resolver = StringResolver::new(peer).as_z().pretty_unwrap();
        let client = new_client(options.client.clone(), resolver);
        acceptors.push(Arc::new(AcceptorClient::new(Arc::clone(&client))));
        recoveries.push(Arc::new(RecoveryClient::new(client)));
    }
    // membership:  a replica that cannot reach the coordination service does not come up.
    let coordination = new_client(options.client.clone(), options.coordination.clone());
    let membership = Arc::new(Membership::new(
        CoordinationClient::new(coordination),
        Member {
            replica: options.replica_id,
            connect: options.server.bind_to.connect().to_owned(),
        },
    ));
    let time_to_live_secs = membership.register().as_z().pretty_unwrap();
    Membership::start_keepalive(Arc::clone(&membership), time_to_live_secs);
    // best-effort catch-up before serving
    recovery::catch_up(&log, &machine, &recoveries, recovery::default_timeout());
    // replica facade + HTTP boundary
    let proposer = Proposer::new(options.replica_id, Arc::clone(&acceptor), acceptors);
    let replica = Arc::new(Replica::new(
        Arc::clone(&machine),
        Arc::clone(&log),
        Arc::clone(&acceptor),
        proposer,
    ));
    let http_port = options.http_port;
    let _ = std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(scooterd::http::serve(replica, http_port));
    });
    // peer-facing services
    let mut services = ServiceRegistry::new();
    services.register("AcceptorService", AcceptorServer::bind(Arc::clone(&acceptor)));
    services.register(
        "RecoveryService",
        RecoveryServer::bind(Arc::new(Recovery::new(Arc::clone(&log), Arc::clone(&machine)))),
    );
    // server
    let (server, cancel) = Server::new(options.ssl, options.server, services)
        .as_z()
        .pretty_unwrap();
    let _ = std::thread::spawn(move || {
        loop {
            let signal_set = minimal_signals::SignalSet::new().fill();
            let signal = minimal_signals::wait(signal_set);
            if signal != Some(minimal_signals::SIGCHLD) {
                break;
            }
        }
        cancel();
    });
    server.serve().as_z().pretty_unwrap();
    // log goodbye
    clue!(COLLECTOR, ALWAYS, {
        goodbye: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
}
