//! ascii-server: prints ASCII data received over TCP to the console.
//!
//! One listening socket, many clients, one thread: a readiness loop accepts
//! connections and hands every received chunk to the console-echo handler
//! below. SIGINT requests a cooperative shutdown.

mod config;
mod registry;
mod server;
mod sock;

use config::Config;
use server::{DataOutcome, EventHandler, Server, ServerError, ShutdownHandle};
use sock::Connection;
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Acknowledgement written back to the client for every received chunk.
const RESPONSE: &[u8] = b"Message received\n";

static SHUTDOWN: OnceLock<ShutdownHandle> = OnceLock::new();

/// SIGINT handler. Only async-signal-safe work is allowed here: an atomic
/// store and an eventfd write through the poll waker.
extern "C" fn on_interrupt(_signum: libc::c_int) {
    if let Some(handle) = SHUTDOWN.get() {
        handle.request_stop();
    }
}

fn install_interrupt_handler() -> std::io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_interrupt as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        // sa_flags stays zero: no SA_RESTART, so a blocked poll returns
        // EINTR and the loop re-checks its running flag.
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Console echo: print what arrived, acknowledge every chunk.
struct ConsoleEcho;

impl EventHandler for ConsoleEcho {
    fn on_connected(&mut self, client: &mut Connection) {
        info!(addr = ?client.peer_addr(), port = ?client.peer_port(), "client connected");
    }

    fn on_data(&mut self, client: &mut Connection, data: &[u8]) -> DataOutcome {
        print!(" > {}", String::from_utf8_lossy(data));

        let outcome = match client.send(RESPONSE) {
            Ok(_) => {
                print!(" < {}", String::from_utf8_lossy(RESPONSE));
                DataOutcome::SUCCESS
            }
            Err(e) => {
                warn!(error = %e, "failed to send response to client");
                DataOutcome::DISCONNECT.with_client_error()
            }
        };

        let _ = std::io::stdout().flush();
        outcome
    }

    fn on_error(&mut self, client: &mut Connection, err: &ServerError) {
        warn!(peer = ?client.peer(), error = %err, "client error");
    }

    fn on_disconnected(&mut self, peer: Option<SocketAddr>) {
        info!(?peer, "client disconnected");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let default_level = if config.verbose {
        "debug"
    } else {
        &config.log_level
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    debug!(
        port = config.port,
        verbose = config.verbose,
        host = %config.host,
        "options parsed"
    );

    let server = Server::bind(&config, ConsoleEcho)?;
    let _ = SHUTDOWN.set(server.shutdown_handle());
    install_interrupt_handler()?;

    server.run()?;
    info!("server stopped");
    Ok(())
}
