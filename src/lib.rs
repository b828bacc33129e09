//! Distributed inference coordination for llama.cpp.
//!
//! One master device hosts the model and offloads a planned share of its
//! layers to remote workers running the engine's RPC compute server. This
//! crate owns the worker registry, the layer-distribution planner, the
//! launch-argument rendering for both wrapped binaries, and the supervision
//! of the resulting processes.

pub mod coordinator;
pub mod logger;
pub mod model_info;
pub mod planner;
pub mod registry;
pub mod server_config;
pub mod settings;
pub mod supervisor;

// Re-export the types callers wire together
pub use coordinator::{DistributedMode, MeshCoordinator};
pub use model_info::ModelInfo;
pub use planner::{plan_distribution, DistributionPlan};
pub use registry::{WorkerDescriptor, WorkerFilter, WorkerRegistry, RPC_DEFAULT_PORT};
pub use server_config::{AppPaths, WorkerOptions};
pub use settings::ServerSettings;
pub use supervisor::{ServerRole, ServerState};
