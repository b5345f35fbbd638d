use std::sync::Arc;
use std::time::Duration;

use arrrg::CommandLine;
use busyrpc::{Server, ServerOptions, ServiceRegistry, SslOptions};
use indicio::{
    clue,
    stdio::StdioEmitter,
    {ALWAYS, INFO},
};

use scooter_pb::{CoordinationServer, IoToZ};

use scooterd::coordination::{MemoryCoordination, DEFAULT_TIME_TO_LIVE_SECS};
use scooterd::COLLECTOR;

#[derive(Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(nested)]
    ssl: SslOptions,
    #[arrrg(nested)]
    server: ServerOptions,
    #[arrrg(optional, "Seconds a registration lives without a refresh.")]
    time_to_live_secs: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ssl: SslOptions::default(),
            server: ServerOptions::default(),
            time_to_live_secs: DEFAULT_TIME_TO_LIVE_SECS,
        }
    }
}

fn main() {
    minimal_signals::block();
    let (options, free) = Options::from_command_line("Usage: scooter-coordinator [OPTIONS]");
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
    // coordination service
    let coordination = Arc::new(MemoryCoordination::new(Duration::from_secs(
        options.time_to_live_secs,
    )));
    let mut services = ServiceRegistry::new();
    services.register("CoordinationService", CoordinationServer::bind(coordination));
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
    clue!(COLLECTOR, ALWAYS, {
        goodbye: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
}
