use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::chat::ChatTemplateFormat;
use crate::error::{Error, Result};
use crate::sampler::SamplerParams;

/// File extension tried when resolving a model by name.
pub const MODEL_EXTENSION: &str = "gguf";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// The path to the model
    pub model_path: PathBuf,
    /// override some parameters of the model
    pub key_value_overrides: Vec<(String, String)>,
    /// Disable offloading layers to the gpu
    pub disable_gpu: bool,
    /// Number of layers to offload when the gpu is enabled (default: all)
    pub gpu_layers: Option<u32>,
    #[doc(hidden)]
    #[serde(skip)]
    pub _non_exhaustive: (),
}

impl ModelParams {
    /// Parameters for the model at `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: path.into(),
            ..Default::default()
        }
    }

    /// Resolve a model by name inside `dir`, trying `<name>` and then `<name>.gguf`.
    pub fn from_name(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let exact = dir.join(name);
        if exact.is_file() {
            return Ok(Self::from_path(exact));
        }
        let with_ext = dir.join(format!("{}.{}", name, MODEL_EXTENSION));
        if with_ext.is_file() {
            return Ok(Self::from_path(with_ext));
        }
        Err(Error::ModelLoad(format!(
            "no model named `{}` in {}",
            name,
            dir.display()
        )))
    }

    /// The key-value overrides with their values parsed.
    pub fn parsed_overrides(&self) -> Result<Vec<(String, OverrideValue)>> {
        self.key_value_overrides
            .iter()
            .map(|(k, v)| {
                v.parse()
                    .map(|value| (k.clone(), value))
                    .map_err(|e| Error::Parse(format!("invalid value {} for key {k:?}: {}", v, e)))
            })
            .collect()
    }
}

/// Parameters for creating a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// size of the prompt context (default: 2048, `None` loads it from the model)
    pub ctx_size: Option<usize>,
    /// maximum number of tokens per decode call, also the batch buffer capacity
    pub batch_size: usize,
    /// number of threads to use during generation (default: use all available threads)
    pub threads: Option<usize>,
    /// number of threads to use during batch and prompt processing (default: use all available threads)
    pub threads_batch: Option<usize>,
    /// maximum number of tokens generated per prompt (default: until the context is full)
    pub max_tokens: Option<usize>,
    #[doc(hidden)]
    #[serde(skip)]
    pub _non_exhaustive: (),
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            ctx_size: Some(2048),
            batch_size: 512,
            threads: None,
            threads_batch: None,
            max_tokens: None,
            _non_exhaustive: (),
        }
    }
}

impl ContextParams {
    pub fn validate(&self) -> Result<()> {
        if self.ctx_size == Some(0) {
            return Err(Error::Config("ctx_size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.max_tokens == Some(0) {
            return Err(Error::Config("max_tokens must be positive".into()));
        }
        Ok(())
    }
}

/// A typed model metadata override value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverrideValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl FromStr for OverrideValue {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        i64::from_str(s)
            .map(OverrideValue::Int)
            .or_else(|_| f64::from_str(s).map(OverrideValue::Float))
            .or_else(|_| bool::from_str(s).map(OverrideValue::Bool))
            .map_err(|_| Error::Parse("must be one of i64, f64, or bool".to_string()))
    }
}

/// Split a `KEY=value` pair.
pub fn parse_key_val(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| Error::Parse(format!("invalid KEY=value: no `=` found in `{}`", s)))?;
    if key.is_empty() {
        return Err(Error::Parse(format!("invalid KEY=value: empty key in `{}`", s)));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Everything needed to load a model and open a session on it.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub model: ModelParams,
    pub context: ContextParams,
    pub sampler: SamplerParams,
    pub template: ChatTemplateFormat,
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.context.validate()?;
        config.model.parsed_overrides()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }
}
