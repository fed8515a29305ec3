//! Meshroom Relay Server
//!
//! Runs the signaling relay on a TCP port:
//!
//! 1. **Room registry**: sessions join named rooms, created on first join and
//!    dropped when the last member leaves or disconnects.
//!
//! 2. **Signal relay**: SDP offers/answers and trickled ICE candidates are
//!    forwarded between members of the same room.
//!
//! 3. **Introspection**: `/health`, `/rooms`, `/rooms/{id}` and `/stats`.

use clap::Parser;

use meshroom_relay::{router, RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "meshroom-relay", version, about = "Meshroom signaling relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 5000, env = "RELAY_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_HOST")]
    host: String,

    /// Maximum members per room
    #[arg(long, default_value_t = 50, env = "MAX_ROOM_MEMBERS")]
    max_room_members: usize,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "RELAY_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            host: self.host,
            port: self.port,
            max_room_members: self.max_room_members,
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "meshroom_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = args.into_config();
    let addr = config.bind_addr();
    tracing::info!(
        max_room_members = config.max_room_members,
        "Meshroom relay server starting on {}",
        addr
    );

    let app = router(RelayState::new(config));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
