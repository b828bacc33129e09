//! Headless coordinator CLI.
//!
//! `master` hosts a model and distributes layers to workers; `worker` serves
//! this device's memory and compute to a master on the network.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use llama_cpp_mesh::{
    AppPaths, MeshCoordinator, ModelInfo, ServerRole, ServerSettings, ServerState,
    WorkerDescriptor, WorkerOptions, WorkerRegistry, RPC_DEFAULT_PORT,
};

#[derive(Parser)]
#[command(name = "llama_mesh_app", about = "Distributed llama.cpp inference coordinator")]
struct Cli {
    /// Base directory for app-owned data/cache paths.
    #[arg(long, default_value = ".")]
    home: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a model and distribute layers to workers.
    Master {
        /// Path to the GGUF model file.
        #[arg(long)]
        model: String,
        /// Worker spec `host:port:ram_mb[:load%]`, repeatable.
        #[arg(long = "worker")]
        workers: Vec<String>,
        /// RAM budget kept for this device (MB). Defaults to available memory.
        #[arg(long)]
        master_ram_mb: Option<u64>,
        #[arg(long)]
        threads: Option<u32>,
        #[arg(long)]
        ctx: Option<u32>,
        #[arg(long)]
        temp: Option<f32>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Serve this device's compute to a master.
    Worker {
        #[arg(long, default_value_t = RPC_DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value_t = 4096)]
        ram_mb: u64,
        #[arg(long, default_value_t = 4)]
        threads: u32,
        /// Cache transferred layers on disk for warm restarts.
        #[arg(long)]
        cache: bool,
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
}

/// Parse `host:port:ram_mb[:load%]`. The load part accepts either a
/// percentage (25) or a fraction (0.25).
fn parse_worker_spec(spec: &str) -> Result<WorkerDescriptor, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(format!(
            "Invalid worker spec '{spec}' (want host:port:ram_mb[:load%])"
        ));
    }
    let host = parts[0].to_string();
    let port: u16 = parts[1]
        .parse()
        .map_err(|_| format!("Invalid port in worker spec '{spec}'"))?;
    let ram_mb: u64 = parts[2]
        .parse()
        .map_err(|_| format!("Invalid RAM in worker spec '{spec}'"))?;
    let proportion = match parts.get(3) {
        None => None,
        Some(raw) => {
            let value: f32 = raw
                .parse()
                .map_err(|_| format!("Invalid load proportion in worker spec '{spec}'"))?;
            Some(if value > 1.0 { value / 100.0 } else { value })
        }
    };
    Ok(WorkerDescriptor::new(host, port, "Worker", ram_mb).with_proportion(proportion))
}

/// Model metadata, degrading to a size-only record when the GGUF metadata is
/// unreadable (the planner then falls back to its documented layer default).
fn load_model_info(path: &str) -> Result<ModelInfo, String> {
    match llama_cpp_mesh::model_info::read_model_info(path) {
        Ok(info) => Ok(info),
        Err(e) => {
            let size_bytes = std::fs::metadata(path)
                .map_err(|_| format!("Model file not found: {path}"))?
                .len();
            eprintln!("warning: {e}; continuing with layer-count default");
            Ok(ModelInfo {
                path: path.to_string(),
                architecture: "unknown".to_string(),
                total_layers: None,
                context_length: None,
                size_bytes,
            })
        }
    }
}

fn describe(state: &ServerState) -> String {
    match state {
        ServerState::Stopped => "stopped".to_string(),
        ServerState::Starting => "starting".to_string(),
        ServerState::Loading { status, .. } => format!("loading: {status}"),
        ServerState::Running { port } => format!("running on port {port}"),
        ServerState::Error { message } => format!("error: {message}"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let registry = Arc::new(WorkerRegistry::new());
    let coordinator = MeshCoordinator::new(AppPaths::in_dir(&cli.home), registry.clone());

    if let Some(ip) = coordinator.local_ip() {
        println!("Local address: {ip}");
    }

    let role = match cli.command {
        Commands::Master {
            model,
            workers,
            master_ram_mb,
            threads,
            ctx,
            temp,
            host,
            port,
        } => {
            for spec in &workers {
                match parse_worker_spec(spec) {
                    Ok(worker) => {
                        registry.add(worker);
                    }
                    Err(e) => {
                        eprintln!("{e}");
                        std::process::exit(1);
                    }
                }
            }
            if let Some(ram) = master_ram_mb {
                coordinator.set_master_ram_mb(ram);
            }

            let mut settings = ServerSettings::default();
            if let Some(threads) = threads {
                settings.threads = threads;
            }
            if let Some(ctx) = ctx {
                settings.context_size = ctx;
            }
            if let Some(temp) = temp {
                settings.temperature = temp;
            }
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }

            let model = match load_model_info(&model) {
                Ok(info) => info,
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            };

            if let Err(e) = coordinator.start_master(&model, &settings).await {
                eprintln!("Failed to start master: {e}");
                std::process::exit(1);
            }
            ServerRole::LocalServer
        }
        Commands::Worker {
            port,
            ram_mb,
            threads,
            cache,
            bind,
        } => {
            let options = WorkerOptions {
                bind_host: bind,
                port,
                ram_mb,
                threads,
                cache_enabled: cache,
            };
            if let Err(e) = coordinator.start_worker(&options).await {
                eprintln!("Failed to start worker: {e}");
                std::process::exit(1);
            }
            ServerRole::RpcWorker
        }
    };

    // Narrate state transitions until the session ends or we get ctrl-c.
    let mut state_rx = coordinator.state(role);
    let mut running_rx = coordinator.running();
    loop {
        let state = state_rx.borrow_and_update().clone();
        println!("[{}] {}", role.tag(), describe(&state));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = running_rx.changed() => {
                if changed.is_err() || !*running_rx.borrow_and_update() {
                    println!("Session ended");
                    break;
                }
            }
        }
    }

    coordinator.stop_all().await;
}
