use clap::Parser;
use client::network::{ClientConfig, ClientSession};
use log::{debug, info, warn};
use shared::{MessageKind, UdpDriver, DEFAULT_IP, DEFAULT_PORT};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address
    #[arg(short, long, default_value = DEFAULT_IP)]
    ip: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Ticks per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Delay between connection checks while a send is pending
    #[arg(long, default_value = "100")]
    retry_interval_ms: u64,

    /// Send a Ping this often
    #[arg(long, default_value = "1000")]
    ping_interval_ms: u64,

    /// Payload attached to each Ping
    #[arg(long)]
    payload: Option<String>,

    /// Connect attempts per send before giving up (unbounded when unset)
    #[arg(long)]
    max_connect_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ClientConfig {
        ip: args.ip,
        port: args.port,
        retry_interval: Duration::from_millis(args.retry_interval_ms),
        max_connect_attempts: args.max_connect_attempts,
    };

    info!("Starting client for {}:{}...", config.ip, config.port);
    let mut client = ClientSession::new(config, Arc::new(UdpDriver::default()));

    let tick_rate = args.tick_rate.max(1);
    let mut tick_interval = interval(Duration::from_secs_f32(1.0 / tick_rate as f32));
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ping_interval = interval(Duration::from_millis(args.ping_interval_ms.max(1)));
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

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

                for message in client.on_tick(delta_time) {
                    match message.snapshot() {
                        Some(snapshot) => info!("{} -> {:?}", message.kind, snapshot),
                        None => info!("{} -> {:?}", message.kind, message.payload),
                    }
                }
            }
            _ = ping_interval.tick() => {
                debug!("Sending Ping ({:?})", client.state());
                client.send(MessageKind::Ping, args.payload.clone());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    let stats = client.stats();
    info!(
        "Sent {} frames, received {} messages, {} connect attempts",
        stats.frames_sent, stats.messages_received, stats.connect_attempts
    );

    client.dispose();
    Ok(())
}
