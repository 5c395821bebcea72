//! iKVM server entry point.
//!
//! ```text
//! ikvm-server                     Run with ikvm.toml (or defaults)
//! ikvm-server --config <path>     Load a custom config TOML
//! ikvm-server --port 5901         Override the listener port
//! ikvm-server --simulate          Serve a synthetic screen, no hardware
//! ikvm-server --gen-config        Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ikvm_server::config::IkvmConfig;
use ikvm_server::service::IkvmService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ikvm-server", about = "BMC KVM-over-IP RFB server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "ikvm.toml")]
    config: PathBuf,

    /// TCP port for viewers.
    #[arg(short, long)]
    port: Option<u16>,

    /// Target frames per second.
    #[arg(short = 'f', long)]
    frame_rate: Option<u32>,

    /// Serve a synthetic test pattern instead of opening the video devices.
    #[arg(long)]
    simulate: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&IkvmConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = IkvmConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(rate) = cli.frame_rate {
        config.video.frame_rate = rate;
    }
    if cli.simulate {
        config.video.simulate = true;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("ikvm-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listening on {}", config.listen_addr());
    info!("target FPS: {}", config.video.frame_rate.clamp(1, 60));
    info!("max clients: {}", config.network.max_clients.max(1));
    if config.video.simulate {
        info!("simulation mode");
    }

    let service = IkvmService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
