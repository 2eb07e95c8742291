use clap::Parser;
use log::{debug, info, warn};
use server::network::{ServerConfig, ServerSession};
use server::state_store::StoreConfig;
use shared::{UdpDriver, DEFAULT_PORT};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (all IPv4 interfaces)
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Ticks per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Evict connection records not updated for this many seconds
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// Keep at most this many connection records
    #[arg(long)]
    max_connections: Option<usize>,

    /// Drop a connection's record as soon as it disconnects
    #[arg(long)]
    evict_on_disconnect: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        port: args.port,
        store: StoreConfig {
            ttl: args.ttl_secs.map(Duration::from_secs),
            max_connections: args.max_connections,
            evict_on_disconnect: args.evict_on_disconnect,
        },
    };

    info!("Starting server on port {}...", config.port);
    let mut server = ServerSession::bind(config, Arc::new(UdpDriver::default()))?;

    let tick_rate = args.tick_rate.max(1);
    let mut tick_interval = interval(Duration::from_secs_f32(1.0 / tick_rate as f32));
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_tick = Instant::now();

    // Cap the maximum delta time to 50ms
    let max_delta_time = 1.0 / 20.0;

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                let now = Instant::now();
                let mut delta_time = now.duration_since(last_tick).as_secs_f32();
                last_tick = now;

                if delta_time > max_delta_time {
                    warn!(
                        "Large delta time detected ({:.3}s), capping to {:.3}s",
                        delta_time, max_delta_time
                    );
                    delta_time = max_delta_time;
                }

                server.on_tick(delta_time);

                // Periodic monitoring
                let stats = server.stats();
                if stats.ticks % (tick_rate as u64 * 10) == 0 {
                    debug!(
                        "Tick {}: {} connections, {} records, {} frames, {} dropped",
                        stats.ticks,
                        server.connection_count(),
                        server.store().len(),
                        stats.frames_received,
                        stats.decode_failures
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    server.dispose();
    Ok(())
}
