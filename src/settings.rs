//! User-facing inference settings.
//!
//! These are supplied by whatever settings layer the embedding application
//! uses (UI, config file, CLI flags). The JSON helpers here are a thin
//! file-backed store for headless use.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::log_warn;

/// Settings applied to the local inference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub threads: u32,
    pub context_size: u32,
    pub port: u16,
    pub temperature: f32,
    /// Bind address: `127.0.0.1` unless remote access is wanted.
    pub host: String,
    /// Vision model projector path, when the model has one.
    pub mmproj_path: Option<String>,
    /// Run as an embedding server instead of a chat server.
    pub is_embedding: bool,
    // KV cache quantization
    pub kv_cache_enabled: bool,
    pub kv_cache_type_k: String, // f16, q8_0, q4_0
    pub kv_cache_type_v: String,
    /// 0 = disabled, >0 = number of tokens to reuse.
    pub kv_cache_reuse: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            threads: 4,
            context_size: 8192,
            port: 8080,
            temperature: 0.8,
            host: "0.0.0.0".to_string(),
            mmproj_path: None,
            is_embedding: false,
            kv_cache_enabled: false,
            kv_cache_type_k: "f16".to_string(),
            kv_cache_type_v: "f16".to_string(),
            kv_cache_reuse: 0,
        }
    }
}

impl ServerSettings {
    /// Load settings from a JSON file, falling back to defaults on any error.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                log_warn!("Settings file {} unreadable: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist settings as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings dir: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write settings: {e}"))
    }
}
