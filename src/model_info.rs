//! GGUF model metadata needed for layer planning.
//!
//! Reads just enough of the GGUF header to know how many layers the model
//! has and how big it is; everything else about model management belongs to
//! the embedding application.

use std::fs;
use std::io::BufReader;

use gguf_llms::{GgufHeader, GgufReader, Value};

use crate::log_info;

pub const BYTES_PER_MB: u64 = 1_048_576;

// Model size thresholds for layer estimation when metadata is unreadable
pub const SMALL_MODEL_GB: f64 = 8.0;
pub const SMALL_MODEL_LAYERS: u32 = 32;
pub const MEDIUM_MODEL_GB: f64 = 15.0;
pub const MEDIUM_MODEL_LAYERS: u32 = 48;
pub const LARGE_MODEL_GB: f64 = 25.0;
pub const LARGE_MODEL_LAYERS: u32 = 60;
pub const XLARGE_MODEL_LAYERS: u32 = 80;

const BYTES_TO_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Metadata the planner needs about one model file.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub path: String,
    pub architecture: String,
    /// Block count + 1 output layer, matching how the server binary reports
    /// "offloaded N/M layers". `None` when the metadata had no block count.
    pub total_layers: Option<u32>,
    pub context_length: Option<u32>,
    pub size_bytes: u64,
}

impl ModelInfo {
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / BYTES_PER_MB
    }
}

/// Read layer count and size from a GGUF file.
pub fn read_model_info(path: &str) -> Result<ModelInfo, String> {
    let file_metadata =
        fs::metadata(path).map_err(|e| format!("Failed to read model file metadata: {e}"))?;
    let size_bytes = file_metadata.len();

    let file = fs::File::open(path).map_err(|e| format!("Failed to open model file: {e}"))?;
    let mut reader = BufReader::new(file);

    let header = GgufHeader::parse(&mut reader)
        .map_err(|e| format!("Failed to parse GGUF header: {e}"))?;
    let metadata = GgufReader::read_metadata(&mut reader, header.n_kv)
        .map_err(|e| format!("Failed to read GGUF metadata: {e}"))?;

    let get_u32 = |key: &str| -> Option<u32> {
        metadata.get(key).and_then(|v| match v {
            Value::Uint32(n) => Some(*n),
            Value::Uint64(n) => u32::try_from(*n).ok(),
            Value::Int32(n) => u32::try_from(*n).ok(),
            _ => None,
        })
    };
    let get_string = |key: &str| -> Option<String> {
        metadata.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
    };

    let architecture = get_string("general.architecture").unwrap_or_else(|| "llama".to_string());

    // The server binary counts the output layer separately, so a model with
    // N transformer blocks offloads up to N+1 layers.
    let total_layers = get_u32(&format!("{architecture}.block_count"))
        .or_else(|| get_u32("llama.block_count"))
        .map(|blocks| blocks + 1);

    let context_length = get_u32(&format!("{architecture}.context_length"))
        .or_else(|| get_u32("llama.context_length"));

    log_info!(
        "Model {path}: arch={architecture}, layers={total_layers:?}, ctx={context_length:?}, {} MB",
        size_bytes / BYTES_PER_MB
    );

    Ok(ModelInfo {
        path: path.to_string(),
        architecture,
        total_layers,
        context_length,
        size_bytes,
    })
}

/// Estimate total layer count from file size when GGUF metadata is missing.
pub fn estimate_layers_from_size(size_bytes: u64) -> u32 {
    let size_gb = size_bytes as f64 / BYTES_TO_GB;
    if size_gb < SMALL_MODEL_GB {
        SMALL_MODEL_LAYERS
    } else if size_gb < MEDIUM_MODEL_GB {
        MEDIUM_MODEL_LAYERS
    } else if size_gb < LARGE_MODEL_GB {
        LARGE_MODEL_LAYERS
    } else {
        XLARGE_MODEL_LAYERS
    }
}
