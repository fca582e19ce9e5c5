use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::{ArgAction, Parser};
use tactoe_server::client_registry::ClientRegistry;
use tactoe_server::logger::Logger;
use tactoe_server::player_registry::PlayerRegistry;
use tactoe_server::protocol::Clock;
use tactoe_server::session_loop::run_session;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name    = "server",
    version,
    about   = "Tic-Tac-Toe network game server",
    long_about = "Accepts many concurrent clients over TCP, each speaking a small \n\
                  binary-framed protocol (login, invite, accept, move, resign). \n\
                  See spec.md / SPEC_FULL.md for the protocol and state machine."
)]
struct Args {
    /// Address to listen on. `-p`/`--port` overrides just the port.
    #[arg(short = 'b', long, default_value = "0.0.0.0:7878")]
    bind: String,

    /// Port to listen on; overrides the port component of --bind.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Increase output verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Maximum number of simultaneously registered client sessions (§4.5, §5)
    #[arg(short = 'm', long, default_value_t = 64)]
    max_sessions: u32,
}

impl Args {
    fn effective_bind(&self) -> String {
        match self.port {
            Some(port) => {
                let host = self
                    .bind
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(&self.bind);
                format!("{host}:{port}")
            }
            None => self.bind.clone(),
        }
    }
}

// ── DISPLAY EVENTS ────────────────────────────────────────────────────────────

enum Event {
    Listening { addr: String },
    AcceptError { reason: String },
    ShuttingDown,
    ShutdownComplete,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Listening { addr } => write!(f, "Server listening on {addr}"),
            Event::AcceptError { reason } => write!(f, "Accept error: {reason}"),
            Event::ShuttingDown => write!(f, "SIGHUP received, shutting down gracefully"),
            Event::ShutdownComplete => write!(f, "All sessions drained, exiting"),
        }
    }
}

// ── ENTRY POINT ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log = Arc::new(Logger::new(args.verbose));

    let bind_addr = args.effective_bind();
    let max_sessions = args.max_sessions.max(1) as usize;

    let listener = TcpListener::bind(&bind_addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {bind_addr}: {e}");
        std::process::exit(1);
    });

    log.info(Event::Listening { addr: bind_addr });
    log.verbose(format!("Max concurrent sessions: {max_sessions}"));

    let client_registry = Arc::new(ClientRegistry::new(max_sessions));
    let player_registry = Arc::new(PlayerRegistry::new());
    let clock = Arc::new(Clock::new());
    let session_counter = Arc::new(AtomicU64::new(0));

    let accept_shutdown: CancellationToken = client_registry.shutdown_token();
    let accept_registry = client_registry.clone();
    let accept_players = player_registry.clone();
    let accept_clock = clock.clone();
    let accept_log = log.clone();

    let accept_loop = tokio::spawn(async move {
        loop {
            let (stream, _addr) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        accept_log.warn(Event::AcceptError { reason: e.to_string() });
                        continue;
                    }
                },
                _ = accept_shutdown.cancelled() => break,
            };

            let id = session_counter.fetch_add(1, Ordering::Relaxed);
            let registry = accept_registry.clone();
            let players = accept_players.clone();
            let clock = accept_clock.clone();
            let shutdown = accept_registry.shutdown_token();
            let log = accept_log.clone();

            tokio::spawn(async move {
                run_session(stream, id, registry, players, clock, shutdown, log).await;
            });
        }
    });

    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    // SIGPIPE needs no explicit handling in Rust: writes to a closed socket
    // surface as an `io::Error`, never a process-wide signal (SPEC_FULL.md A.5).
    sighup.recv().await;

    log.info(Event::ShuttingDown);
    client_registry.shutdown_all();
    accept_loop.abort();
    client_registry.wait_for_empty().await;
    log.info(Event::ShutdownComplete);
}
