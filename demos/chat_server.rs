//! Standalone chat server example with in-memory collaborators
//!
//! Run with: cargo run --example chat_server [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example chat_server                  # binds to 0.0.0.0:8090
//!   cargo run --example chat_server localhost:9000   # binds to 127.0.0.1:9000
//!
//! Seeds two rooms and three sessions, so a WebSocket client can connect
//! right away with one of the seeded cookies:
//!
//! ```text
//! GET /ws HTTP/1.1
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: <key>
//! Cookie: sid=sid-alice        (also sid-bob, sid-carol)
//! ```
//!
//! The cross-node broadcast endpoint listens on the next port up; drive it
//! with `comet_rs::rpc::BroadcastClient`.

use std::net::SocketAddr;

use comet_rs::server::{
    CometServer, MemoryRoomDirectory, MemorySessionAuth, ServerConfig, UserIdentity,
};
use comet_rs::store::MemoryStreamStore;

/// Parse bind address from command line argument.
///
/// Accepts "localhost", "IP", "IP:PORT" and "localhost:PORT".
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 8090;

    let normalized = arg.replace("localhost", "127.0.0.1");
    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let bind_addr = match args.get(1) {
        Some(arg) => parse_bind_addr(arg).map_err(std::io::Error::other)?,
        None => "0.0.0.0:8090".parse().unwrap(),
    };
    let rpc_addr = SocketAddr::new(bind_addr.ip(), bind_addr.port() + 1);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("comet_rs=debug".parse()?)
                .add_directive("chat_server=debug".parse()?),
        )
        .init();

    // In-memory collaborators seeded the way provisioning would
    let auth = MemorySessionAuth::new();
    auth.insert(
        "sid-alice",
        UserIdentity {
            user_id: "u-alice".into(),
            username: "alice".into(),
        },
    );
    auth.insert(
        "sid-bob",
        UserIdentity {
            user_id: "u-bob".into(),
            username: "bob".into(),
        },
    );
    auth.insert(
        "sid-carol",
        UserIdentity {
            user_id: "u-carol".into(),
            username: "carol".into(),
        },
    );

    let directory = MemoryRoomDirectory::new();
    directory.seed("room-general", "general", "u-alice");
    directory.seed("room-random", "random", "u-bob");

    let config = ServerConfig::default().bind(bind_addr).rpc_bind(rpc_addr);

    println!("Starting chat server on {bind_addr}");
    println!("Broadcast endpoint on {rpc_addr}");
    println!("Seeded cookies: sid-alice, sid-bob, sid-carol");
    println!("Seeded rooms:   general, random");
    println!();

    let server = CometServer::new(config, auth, directory, MemoryStreamStore::new());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                eprintln!("Server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    Ok(())
}
