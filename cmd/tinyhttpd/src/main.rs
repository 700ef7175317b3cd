//! # tinyhttpd server binary
//!
//! Usage:
//!
//!     tinyhttpd <port>
//!
//! Serves world-readable regular files under the compiled-in document root
//! over HTTP/1.1, GET only. `RUST_LOG` controls log verbosity.

use std::process;

use log::error;

use tinyhttpd::{Server, ServerConfig};

fn main() {
    env_logger::init();

    let port = match parse_port() {
        Some(port) => port,
        None => {
            let argv0 = std::env::args().next().unwrap_or_else(|| "tinyhttpd".into());
            eprintln!("usage: {} port_number", argv0);
            process::exit(1);
        }
    };

    // A peer that vanishes mid-write must surface as an error return on the
    // socket, not kill the process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let server = match Server::bind(ServerConfig::new(port)) {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("event loop failed: {}", e);
        process::exit(1);
    }
}

fn parse_port() -> Option<u16> {
    std::env::args().nth(1)?.parse().ok()
}
