//! Launch argument rendering for the wrapped binaries.
//!
//! Flag names, ordering, and the two-decimal `-ts` formatting are the
//! compatibility surface with the inference engine and must not drift.

use std::path::{Path, PathBuf};

use crate::planner::DistributionPlan;
use crate::settings::ServerSettings;

pub const SERVER_BINARY: &str = "llama-server";
pub const RPC_BINARY: &str = "rpc-server";
pub const SERVER_BINARY_ENV: &str = "LLAMA_SERVER_BIN";
pub const RPC_BINARY_ENV: &str = "RPC_SERVER_BIN";

/// Options for one rpc-server launch.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub bind_host: String,
    pub port: u16,
    pub ram_mb: u64,
    pub threads: u32,
    /// `-c`: cache transferred layers on disk for warm restarts.
    pub cache_enabled: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: crate::registry::RPC_DEFAULT_PORT,
            ram_mb: 4096,
            threads: 4,
            cache_enabled: false,
        }
    }
}

/// Fully resolved spawn parameters for one supervised process.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
}

impl LaunchCommand {
    /// Human-readable command line for logs and diagnostics.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Writable application-owned directories the child processes are pointed
/// at. Some platforms probe restricted system paths unless HOME/TMPDIR are
/// redirected somewhere the process can actually touch.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub files_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl AppPaths {
    pub fn new(files_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            files_dir,
            cache_dir,
        }
    }

    /// `<base>/data` and `<base>/cache`, created on demand.
    pub fn in_dir(base: &Path) -> Self {
        Self::new(base.join("data"), base.join("cache"))
    }

    pub fn ensure_exist(&self) -> Result<(), String> {
        std::fs::create_dir_all(&self.files_dir)
            .map_err(|e| format!("Failed to create {}: {e}", self.files_dir.display()))?;
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| format!("Failed to create {}: {e}", self.cache_dir.display()))?;
        Ok(())
    }

    /// Environment shared by both roles.
    fn base_env(&self, binary: &Path) -> Vec<(String, String)> {
        let files = self.files_dir.display().to_string();
        let cache = self.cache_dir.display().to_string();
        let lib_dir = binary
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        vec![
            ("HOME".to_string(), files.clone()),
            ("PWD".to_string(), files.clone()),
            ("TMPDIR".to_string(), cache.clone()),
            ("XDG_CACHE_HOME".to_string(), cache),
            ("XDG_DATA_HOME".to_string(), files.clone()),
            ("XDG_CONFIG_HOME".to_string(), files),
            ("LD_LIBRARY_PATH".to_string(), lib_dir),
        ]
    }
}

/// Ordered argument list for the local inference server.
pub fn build_server_args(
    model_path: &str,
    settings: &ServerSettings,
    plan: Option<&DistributionPlan>,
    worker_addresses: &[String],
) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        model_path.to_string(),
        "-c".to_string(),
        settings.context_size.to_string(),
        "-t".to_string(),
        settings.threads.to_string(),
        "--port".to_string(),
        settings.port.to_string(),
        "--host".to_string(),
        settings.host.clone(),
    ];

    if let Some(mmproj) = &settings.mmproj_path {
        args.push("--mmproj".to_string());
        args.push(mmproj.clone());
    }

    if settings.is_embedding {
        args.push("--embedding".to_string());
    } else {
        args.push("--temp".to_string());
        args.push(settings.temperature.to_string());
    }

    if settings.kv_cache_enabled {
        args.push("--cache-type-k".to_string());
        args.push(settings.kv_cache_type_k.clone());
        args.push("--cache-type-v".to_string());
        args.push(settings.kv_cache_type_v.clone());
        if settings.kv_cache_reuse > 0 {
            args.push("--cache-reuse".to_string());
            args.push(settings.kv_cache_reuse.to_string());
        }
    }

    if let (Some(plan), false) = (plan, worker_addresses.is_empty()) {
        args.push("--rpc".to_string());
        args.push(worker_addresses.join(","));
        // Automatic memory fitting miscounts under distributed layouts and
        // can crash the server; turn it off whenever workers are present.
        args.push("--fit".to_string());
        args.push("off".to_string());
        if plan.remote_layers > 0 {
            args.push("-ngl".to_string());
            args.push(plan.remote_layers.to_string());
        }
        if worker_addresses.len() > 1 {
            if let Some(split) = plan.tensor_split_string() {
                args.push("-ts".to_string());
                args.push(split);
            }
        }
    }

    args
}

/// Ordered argument list for the remote compute worker.
pub fn build_rpc_args(options: &WorkerOptions) -> Vec<String> {
    let mut args = vec![
        "-H".to_string(),
        options.bind_host.clone(),
        "-p".to_string(),
        options.port.to_string(),
        "-t".to_string(),
        options.threads.to_string(),
    ];
    if options.cache_enabled {
        args.push("-c".to_string());
    }
    args
}

/// Assemble the full launch command for the local server role.
pub fn master_launch(
    paths: &AppPaths,
    model_path: &str,
    settings: &ServerSettings,
    plan: Option<&DistributionPlan>,
    worker_addresses: &[String],
) -> Result<LaunchCommand, String> {
    let program = find_binary(SERVER_BINARY, SERVER_BINARY_ENV)?;
    let env = paths.base_env(&program);
    Ok(LaunchCommand {
        args: build_server_args(model_path, settings, plan, worker_addresses),
        env,
        working_dir: paths.files_dir.clone(),
        program,
    })
}

/// Assemble the full launch command for the worker role.
pub fn worker_launch(paths: &AppPaths, options: &WorkerOptions) -> Result<LaunchCommand, String> {
    let program = find_binary(RPC_BINARY, RPC_BINARY_ENV)?;
    let mut env = paths.base_env(&program);
    env.push(("GGML_RPC_DEBUG".to_string(), "1".to_string()));
    Ok(LaunchCommand {
        args: build_rpc_args(options),
        env,
        working_dir: paths.files_dir.clone(),
        program,
    })
}

/// Locate a wrapped binary: env override, then `bin/` beside the executable,
/// then beside the executable, then `$PATH`.
pub fn find_binary(name: &str, env_var: &str) -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var(env_var) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(format!(
            "{env_var} points at {}, which does not exist",
            path.display()
        ));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            for candidate in [dir.join("bin").join(name), dir.join(name)] {
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(format!(
        "{name} binary not found (set {env_var} or place it next to the executable)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan_distribution;
    use crate::registry::WorkerDescriptor;

    fn settings() -> ServerSettings {
        ServerSettings {
            threads: 6,
            context_size: 4096,
            port: 8080,
            temperature: 0.8,
            host: "127.0.0.1".to_string(),
            ..ServerSettings::default()
        }
    }

    #[test]
    fn test_local_server_args_baseline() {
        let args = build_server_args("/models/m.gguf", &settings(), None, &[]);
        assert_eq!(
            args,
            vec![
                "-m", "/models/m.gguf", "-c", "4096", "-t", "6", "--port", "8080", "--host",
                "127.0.0.1", "--temp", "0.8",
            ]
        );
    }

    #[test]
    fn test_embedding_replaces_temperature() {
        let mut s = settings();
        s.is_embedding = true;
        let args = build_server_args("/models/m.gguf", &s, None, &[]);
        assert!(args.contains(&"--embedding".to_string()));
        assert!(!args.contains(&"--temp".to_string()));
    }

    #[test]
    fn test_kv_cache_flags() {
        let mut s = settings();
        s.kv_cache_enabled = true;
        s.kv_cache_type_k = "q8_0".to_string();
        s.kv_cache_type_v = "q4_0".to_string();
        s.kv_cache_reuse = 256;
        let args = build_server_args("/models/m.gguf", &s, None, &[]);
        let tail: Vec<&str> = args.iter().map(String::as_str).collect();
        let pos = tail.iter().position(|a| *a == "--cache-type-k").unwrap();
        assert_eq!(
            &tail[pos..pos + 6],
            &["--cache-type-k", "q8_0", "--cache-type-v", "q4_0", "--cache-reuse", "256"]
        );
    }

    #[test]
    fn test_distributed_args_single_worker_has_no_split() {
        let workers = [WorkerDescriptor::new("192.168.1.5", 50052, "w", 4096)];
        let plan = plan_distribution(Some(32), 4000, 4096, &workers).unwrap();
        let addresses = vec!["192.168.1.5:50052".to_string()];
        let args = build_server_args("/models/m.gguf", &settings(), Some(&plan), &addresses);
        let tail: Vec<&str> = args.iter().map(String::as_str).collect();
        let pos = tail.iter().position(|a| *a == "--rpc").unwrap();
        assert_eq!(
            &tail[pos..],
            &["--rpc", "192.168.1.5:50052", "--fit", "off", "-ngl", "16"]
        );
    }

    #[test]
    fn test_distributed_args_two_workers_include_split() {
        let workers = [
            WorkerDescriptor::new("192.168.1.5", 50052, "a", 1000),
            WorkerDescriptor::new("192.168.1.6", 50052, "b", 3000),
        ];
        let plan = plan_distribution(Some(32), 4000, 4096, &workers).unwrap();
        let addresses = vec![
            "192.168.1.5:50052".to_string(),
            "192.168.1.6:50052".to_string(),
        ];
        let args = build_server_args("/models/m.gguf", &settings(), Some(&plan), &addresses);
        let tail: Vec<&str> = args.iter().map(String::as_str).collect();
        let pos = tail.iter().position(|a| *a == "--rpc").unwrap();
        assert_eq!(
            &tail[pos..],
            &[
                "--rpc",
                "192.168.1.5:50052,192.168.1.6:50052",
                "--fit",
                "off",
                "-ngl",
                "15",
                "-ts",
                "0.25,0.75",
            ]
        );
    }

    #[test]
    fn test_rpc_worker_args() {
        let mut options = WorkerOptions {
            port: 50052,
            threads: 4,
            ..WorkerOptions::default()
        };
        assert_eq!(
            build_rpc_args(&options),
            vec!["-H", "0.0.0.0", "-p", "50052", "-t", "4"]
        );
        options.cache_enabled = true;
        assert_eq!(
            build_rpc_args(&options),
            vec!["-H", "0.0.0.0", "-p", "50052", "-t", "4", "-c"]
        );
    }

    #[test]
    fn test_worker_launch_env_enables_rpc_debug() {
        let tmp = std::env::temp_dir().join("llama_mesh_cfg_test");
        let paths = AppPaths::in_dir(&tmp);
        // Point the binary override at a real file so discovery succeeds.
        let fake = tmp.join("rpc-server");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(&fake, b"").unwrap();
        std::env::set_var(RPC_BINARY_ENV, &fake);
        let launch = worker_launch(&paths, &WorkerOptions::default()).unwrap();
        std::env::remove_var(RPC_BINARY_ENV);
        assert!(launch
            .env
            .iter()
            .any(|(k, v)| k == "GGML_RPC_DEBUG" && v == "1"));
        assert!(launch.env.iter().any(|(k, _)| k == "XDG_CACHE_HOME"));
        assert_eq!(launch.working_dir, paths.files_dir);
    }
}
