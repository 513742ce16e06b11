//! Writing deployed models to disk
//!
//! Text formats (JSON, YAML) serialize a [`ModelState`] with f32 tensor
//! data; safetensors writes the standard binary layout. The deployment mode
//! the model was saved under travels in the metadata, since packed tensors
//! are dequantized to f32 for export.

use crate::blockwise::DeployMode;
use crate::error::{Error, Result};
use crate::model::Transformer;
use safetensors::tensor::{Dtype, TensorView};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Supported export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Human-readable JSON
    Json,
    /// Human-readable YAML
    Yaml,
    /// HuggingFace-compatible binary
    SafeTensors,
}

impl ExportFormat {
    /// File extension for this format
    pub fn extension(&self) -> &str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Yaml => "yaml",
            ExportFormat::SafeTensors => "safetensors",
        }
    }

    /// Detect format from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "yaml" | "yml" => Some(ExportFormat::Yaml),
            "safetensors" => Some(ExportFormat::SafeTensors),
            _ => None,
        }
    }

    /// Detect format from a path
    pub fn from_path(path: &Path) -> Result<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
            .ok_or_else(|| {
                Error::Config(format!(
                    "unsupported model extension in '{}' (expected json, yaml, or safetensors)",
                    path.display()
                ))
            })
    }
}

/// One exported weight tensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedTensor {
    /// Dotted tensor name, e.g. `blocks.0.attn.q_proj.weight`
    pub name: String,
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Row-major f32 data
    pub data: Vec<f32>,
}

/// Serializable snapshot of a deployed model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    /// String metadata, including the deployment mode
    pub metadata: HashMap<String, String>,
    /// All weight tensors in a stable order
    pub tensors: Vec<ExportedTensor>,
}

impl ModelState {
    /// Snapshot a model under its deployment mode
    pub fn from_model(model: &Transformer, mode: DeployMode) -> Self {
        let config = model.config();
        let mut metadata = HashMap::new();
        metadata.insert("deploy_mode".to_string(), mode.as_str().to_string());
        metadata.insert("num_blocks".to_string(), config.num_blocks.to_string());
        metadata.insert("hidden".to_string(), config.hidden.to_string());
        metadata.insert("vocab".to_string(), config.vocab.to_string());

        let tensors = model
            .named_tensors()
            .into_iter()
            .map(|(name, data, shape)| ExportedTensor { name, shape, data })
            .collect();

        Self { metadata, tensors }
    }
}

/// Write a model to `path`, format chosen by extension
pub fn save_model(model: &Transformer, mode: DeployMode, path: &Path) -> Result<()> {
    let format = ExportFormat::from_path(path)?;
    let state = ModelState::from_model(model, mode);

    match format {
        ExportFormat::Json => {
            let data = serde_json::to_string_pretty(&state)
                .map_err(|e| Error::Serialization(format!("JSON serialization failed: {e}")))?;
            fs::write(path, data)?;
        }
        ExportFormat::Yaml => {
            let data = serde_yaml::to_string(&state)
                .map_err(|e| Error::Serialization(format!("YAML serialization failed: {e}")))?;
            fs::write(path, data)?;
        }
        ExportFormat::SafeTensors => save_safetensors(&state, path)?,
    }

    Ok(())
}

fn save_safetensors(state: &ModelState, path: &Path) -> Result<()> {
    let tensor_bytes: Vec<(String, Vec<u8>, Vec<usize>)> = state
        .tensors
        .iter()
        .map(|t| {
            let bytes: Vec<u8> = bytemuck::cast_slice(&t.data).to_vec();
            (t.name.clone(), bytes, t.shape.clone())
        })
        .collect();

    let views: Vec<(&str, TensorView<'_>)> = tensor_bytes
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| Error::Serialization(format!("invalid tensor '{name}': {e}")))
        })
        .collect::<Result<_>>()?;

    let bytes = safetensors::serialize(views, &Some(state.metadata.clone()))
        .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))?;
    fs::write(path, bytes)?;
    Ok(())
}
