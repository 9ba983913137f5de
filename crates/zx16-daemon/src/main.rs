//! zx16-daemon: HTTP front end for the ZX16 simulator.
//!
//! Serves the simulator API and keeps idle sessions in check until Ctrl-C,
//! then tears every session down before exiting.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use zx16_core::config::READY_MARKER;
use zx16_core::{LocalToolchain, SimulatorConfig, Supervisor};
use zx16_http::SharedState;

#[derive(Parser, Debug)]
#[command(name = "zx16-daemon", version, about = "Serve the ZX16 simulator over HTTP")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Path to the compiled simulator
    #[arg(long, default_value = "./z16sim")]
    simulator: PathBuf,

    /// Simulator source used by POST /build
    #[arg(long, default_value = "./z16sim.cpp")]
    source: PathBuf,

    /// C++ compiler used by POST /build
    #[arg(long, default_value = "g++")]
    compiler: String,

    /// Directory for uploaded images (system temp dir by default)
    #[arg(long)]
    upload_dir: Option<PathBuf>,

    /// Write per-session transcripts to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Serve static files from this directory for unknown paths
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Frame steps by output silence instead of the ready marker
    #[arg(long)]
    quiescence: bool,

    /// Silence that ends a step in quiescence mode (ms)
    #[arg(long, default_value_t = 200)]
    quiet_ms: u64,

    /// Deadline for the simulator to become ready (ms)
    #[arg(long, default_value_t = 5_000)]
    spawn_timeout_ms: u64,

    /// Deadline for a single step (ms)
    #[arg(long, default_value_t = 5_000)]
    step_timeout_ms: u64,

    /// Deadline for a full run (ms)
    #[arg(long, default_value_t = 30_000)]
    run_timeout_ms: u64,

    /// Most output kept for one step or one full run (bytes)
    #[arg(long, default_value_t = 1024 * 1024)]
    max_output_bytes: usize,

    /// Grace period before a stopping simulator is killed (ms)
    #[arg(long, default_value_t = 1_000)]
    grace_ms: u64,

    /// Evict sessions idle longer than this (s)
    #[arg(long, default_value_t = 300)]
    idle_timeout_secs: u64,

    /// How often to look for idle sessions (s)
    #[arg(long, default_value_t = 30)]
    sweep_secs: u64,
}

impl Args {
    fn addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("Invalid address: {}", e))
    }

    fn config(&self) -> SimulatorConfig {
        let marker = (!self.quiescence).then(|| READY_MARKER.to_string());

        let mut config = SimulatorConfig::new(&self.simulator)
            .source_path(&self.source)
            .compiler(&self.compiler)
            .ready_marker(marker)
            .quiet_period(Duration::from_millis(self.quiet_ms))
            .command_timeouts(
                Duration::from_millis(self.spawn_timeout_ms),
                Duration::from_millis(self.step_timeout_ms),
            )
            .run_timeout(Duration::from_millis(self.run_timeout_ms))
            .max_output_bytes(self.max_output_bytes)
            .grace_period(Duration::from_millis(self.grace_ms))
            .idle_timeout(
                Duration::from_secs(self.idle_timeout_secs),
                Duration::from_secs(self.sweep_secs),
            );

        if let Some(dir) = &self.upload_dir {
            config = config.upload_dir(dir);
        }
        if let Some(dir) = &self.log_dir {
            config = config.log_dir(dir);
        }
        config
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let addr = match args.addr() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(2);
        }
    };

    let config = args.config();
    let gateway = Arc::new(LocalToolchain::from_config(&config));
    let supervisor = Arc::new(Supervisor::new(config, gateway));

    let capability = supervisor.capability();
    if !capability.capability.executable_found {
        log::warn!(
            "Simulator not found at {}; POST /build can compile it",
            capability.capability.executable_path
        );
    }

    let sweeper = supervisor.spawn_eviction_loop();
    let state = Arc::new(SharedState::new(Arc::clone(&supervisor)));

    let result = zx16_http::serve(state, addr, args.static_dir.clone(), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", err);
        }
    })
    .await;

    supervisor.shutdown().await;
    let _ = sweeper.await;

    if let Err(err) = result {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
