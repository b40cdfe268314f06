//! ONNX Runtime session setup shared by the plate detector and the OCR engine
use anyhow::{Context, Result};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxRuntimeConfig {
    /// Execution provider preference (CPU, CUDA, TensorRT)
    #[serde(default = "default_execution_provider")]
    pub execution_provider: String,

    /// GPU device ID (0, 1, 2, etc.)
    #[serde(default)]
    pub device_id: i32,

    /// Number of intra-operation threads
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    /// Number of inter-operation threads
    #[serde(default = "default_inter_threads")]
    pub inter_threads: usize,
}

fn default_execution_provider() -> String {
    "CPU".to_string()
}

fn default_intra_threads() -> usize {
    4
}

fn default_inter_threads() -> usize {
    1
}

impl Default for OnnxRuntimeConfig {
    fn default() -> Self {
        Self {
            execution_provider: default_execution_provider(),
            device_id: 0,
            intra_threads: default_intra_threads(),
            inter_threads: default_inter_threads(),
        }
    }
}

impl OnnxRuntimeConfig {
    /// Override provider and device from `LPR_EXECUTION_PROVIDER` / `LPR_DEVICE_ID`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(provider) = std::env::var("LPR_EXECUTION_PROVIDER") {
            self.execution_provider = provider;
        }
        if let Some(id) = std::env::var("LPR_DEVICE_ID")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
        {
            self.device_id = id;
        }
        self
    }

    fn builder(&self) -> Result<SessionBuilder> {
        Session::builder()
            .context("Failed to create session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("Failed to set optimization level")?
            .with_intra_threads(self.intra_threads)
            .context("Failed to set intra threads")?
            .with_inter_threads(self.inter_threads)
            .context("Failed to set inter threads")
    }
}

/// Load a model, falling back TensorRT -> CUDA -> CPU.
///
/// Returns the session and the name of the provider that was configured.
pub fn create_session(model_path: &str, config: &OnnxRuntimeConfig) -> Result<(Session, String)> {
    match config.execution_provider.to_uppercase().as_str() {
        "TENSORRT" => {
            tracing::info!(model = model_path, "attempting TensorRT execution provider");
            let result = config
                .builder()?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .context("Failed to set execution providers")?
                .commit_from_file(model_path);

            match result {
                Ok(session) => Ok((session, "TensorRT".to_string())),
                Err(e) => {
                    tracing::warn!(model = model_path, error = %e, "TensorRT failed, trying CUDA");
                    try_cuda(model_path, config)
                }
            }
        }
        "CUDA" => try_cuda(model_path, config),
        _ => try_cpu(model_path, config),
    }
}

fn try_cuda(model_path: &str, config: &OnnxRuntimeConfig) -> Result<(Session, String)> {
    let result = config
        .builder()?
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .context("Failed to set execution providers")?
        .commit_from_file(model_path);

    match result {
        Ok(session) => Ok((session, "CUDA".to_string())),
        Err(e) => {
            tracing::warn!(model = model_path, error = %e, "CUDA failed, using CPU");
            try_cpu(model_path, config)
        }
    }
}

fn try_cpu(model_path: &str, config: &OnnxRuntimeConfig) -> Result<(Session, String)> {
    let session = config
        .builder()?
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load model from {}", model_path))?;
    Ok((session, "CPU".to_string()))
}
