/// Modbus TCP Test Server
///
/// Reference device for trying the master without hardware. Serves 100 holding
/// registers, the first ten preloaded with known values.

use std::time::Duration;

use clap::Parser;
use log::info;
use tokio::signal;
use tokio::time::interval;

use modbus_master::server::DEFAULT_INITIAL_VALUES;
use modbus_master::{ModbusTcpServer, ServerConfig, DEFAULT_TEST_PORT};

#[derive(Parser, Debug)]
#[command(name = "test_server", version, about = "Modbus TCP test server with preloaded holding registers")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// TCP port
    #[arg(long, default_value_t = DEFAULT_TEST_PORT)]
    port: u16,

    /// Pause before every response, in milliseconds
    #[arg(long, default_value_t = 0)]
    response_delay_ms: u64,

    /// Seconds between statistics reports, 0 to disable
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    println!("🚀 Modbus TCP Test Server");
    println!("=========================");
    println!("Initial register values:");
    for (address, value) in DEFAULT_INITIAL_VALUES.iter().enumerate() {
        println!("  Register {}: {} (0x{:04X})", address, value, value);
    }
    println!();

    let config = ServerConfig {
        bind_address: format!("{}:{}", cli.host, cli.port),
        response_delay: Duration::from_millis(cli.response_delay_ms),
        ..ServerConfig::default()
    };
    let mut server = ModbusTcpServer::with_config(config);
    let addr = server.start().await?;

    println!("✅ Listening on {}", addr);
    println!("Press Ctrl+C to stop the server");

    if cli.stats_interval > 0 {
        let bank = server.register_bank();
        let period = Duration::from_secs(cli.stats_interval);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = bank.get_stats();
                info!("📊 Registers: {} reads, {} writes", stats.reads, stats.writes);
            }
        });
    }

    signal::ctrl_c().await?;
    println!("\n🛑 Shutting down...");
    server.stop().await;

    let stats = server.get_stats().await;
    println!("📈 Final statistics:");
    println!("  Connections: {}", stats.connections_count);
    println!("  Requests: {} total, {} ok, {} failed",
             stats.total_requests, stats.successful_requests, stats.failed_requests);
    println!("  Bytes: {} received, {} sent", stats.bytes_received, stats.bytes_sent);
    println!("  Uptime: {}s", stats.uptime_seconds);

    Ok(())
}
