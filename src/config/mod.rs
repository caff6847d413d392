//! Job configuration loading.
//!
//! A job file carries one or more `process` entries. Each entry is kept as a
//! raw key/value mapping ([`ProcessConfig`]) and then lifted into a typed,
//! eagerly validated schema ([`GeneratorSettings`]) by the process that owns it.

mod dataset;

pub use dataset::{preprocess_dataset_raw_config, DatasetConfig, RawDatasetConfig, Resolution};

use candle_core::{DType, Device};
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::samplers::SamplerKind;

/// Placeholder replaced with the job name everywhere in the document.
pub const NAME_TAG: &str = "[name]";

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub job: String,
    pub name: Option<String>,
    pub process: Vec<ProcessConfig>,
    pub meta: Option<Value>,
}

/// Read a job document from disk. `.json` files are parsed as JSON, anything
/// else as YAML.
pub fn load_job(path: &Path, name_override: Option<&str>) -> Result<JobConfig> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let value: Value = if is_json {
        serde_json::from_str(&text)?
    } else {
        serde_yaml::from_str(&text)?
    };

    parse_job(value, name_override)
}

/// Build a [`JobConfig`] from an already-parsed document.
pub fn parse_job(mut document: Value, name_override: Option<&str>) -> Result<JobConfig> {
    let name = match name_override {
        Some(name) => Some(name.to_string()),
        None => document
            .get("config")
            .and_then(|config| config.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    match &name {
        Some(name) => {
            replace_name_tag(&mut document, name);
        }
        None if contains_name_tag(&document) => {
            return Err(Error::MissingConfig {
                key: "config.name".to_string(),
            });
        }
        None => {}
    }

    let Value::Mapping(mut root) = document else {
        return Err(Error::Config("job document must be a mapping".to_string()));
    };

    let job = match root.remove("job") {
        Some(Value::String(job)) => job,
        Some(other) => return Err(Error::invalid("job", format!("expected a string, got {other:?}"))),
        None => return Err(Error::MissingConfig { key: "job".to_string() }),
    };
    if job != "extension" {
        return Err(Error::Config(format!(
            "unsupported job type `{job}`, expected `extension`"
        )));
    }

    let mut config = match root.remove("config") {
        Some(Value::Mapping(config)) => config,
        Some(_) => return Err(Error::invalid("config", "expected a mapping")),
        None => return Err(Error::MissingConfig { key: "config".to_string() }),
    };

    let process = match config.remove("process") {
        Some(Value::Sequence(entries)) => entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| match entry {
                Value::Mapping(map) => Ok(ProcessConfig::new(map)),
                _ => Err(Error::invalid(
                    format!("config.process[{i}]"),
                    "expected a mapping",
                )),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::invalid("config.process", "expected a list")),
        None => {
            return Err(Error::MissingConfig {
                key: "config.process".to_string(),
            })
        }
    };

    Ok(JobConfig {
        job,
        name,
        process,
        meta: root.remove("meta"),
    })
}

fn replace_name_tag(value: &mut Value, name: &str) {
    match value {
        Value::String(s) if s.contains(NAME_TAG) => *s = s.replace(NAME_TAG, name),
        Value::Sequence(items) => items.iter_mut().for_each(|v| replace_name_tag(v, name)),
        Value::Mapping(map) => map.values_mut().for_each(|v| replace_name_tag(v, name)),
        Value::Tagged(tagged) => replace_name_tag(&mut tagged.value, name),
        _ => {}
    }
}

fn contains_name_tag(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains(NAME_TAG),
        Value::Sequence(items) => items.iter().any(contains_name_tag),
        Value::Mapping(map) => map.values().any(contains_name_tag),
        Value::Tagged(tagged) => contains_name_tag(&tagged.value),
        _ => false,
    }
}

/// One `process` entry: a nested key/value mapping with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    values: Mapping,
}

impl ProcessConfig {
    pub fn new(values: Mapping) -> Self {
        Self { values }
    }

    /// The `type` key used to route the entry to a process.
    pub fn process_type(&self) -> Option<&str> {
        self.values.get("type").and_then(Value::as_str)
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    /// Deserialize an optional key. Null counts as absent.
    pub fn get_conf<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.lookup(key)
            .map(|value| {
                serde_yaml::from_value(value.clone()).map_err(|e| Error::invalid(key, e))
            })
            .transpose()
    }

    pub fn get_conf_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get_conf(key)?.unwrap_or(default))
    }

    /// Deserialize a key that must be present.
    pub fn require_conf<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get_conf(key)?.ok_or_else(|| Error::MissingConfig {
            key: key.to_string(),
        })
    }
}

/// Generation knobs read from the `generate` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    pub sampler: String,
    /// Negative prompt.
    pub neg: String,
    /// Base seed; negative means "pick one at random for this run".
    pub seed: i64,
    /// Advance the seed by one for every item.
    pub walk_seed: bool,
    pub guidance_scale: f64,
    pub sample_steps: usize,
    /// Rescales the guided noise prediction toward the text prediction's std
    /// after CFG (applied by the SDXL pipeline); 0 disables it.
    pub guidance_rescale: f64,
    /// Output image extension, without the dot.
    pub ext: String,
    /// Fraction of the schedule re-noised before denoising (0 keeps the input).
    pub denoise_strength: f64,
    /// Substituted for every `[trigger]` in captions.
    pub trigger_word: Option<String>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            sampler: "ddpm".to_string(),
            neg: String::new(),
            seed: -1,
            walk_seed: false,
            guidance_scale: 7.0,
            sample_steps: 20,
            guidance_rescale: 0.0,
            ext: "png".to_string(),
            denoise_strength: 0.5,
            trigger_word: None,
        }
    }
}

impl GenerateConfig {
    /// Check ranges and normalize the extension.
    pub fn validate(mut self) -> Result<Self> {
        if !(0.0..=1.0).contains(&self.denoise_strength) {
            return Err(Error::invalid(
                "generate.denoise_strength",
                format!("must be between 0.0 and 1.0, got {}", self.denoise_strength),
            ));
        }
        if self.sample_steps == 0 {
            return Err(Error::invalid("generate.sample_steps", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.guidance_rescale) {
            return Err(Error::invalid(
                "generate.guidance_rescale",
                format!("must be between 0.0 and 1.0, got {}", self.guidance_rescale),
            ));
        }
        self.ext = self.ext.trim().trim_start_matches('.').to_string();
        if self.ext.is_empty() {
            return Err(Error::invalid("generate.ext", "must not be empty"));
        }
        SamplerKind::from_name(&self.sampler)?;
        Ok(self)
    }
}

/// Which pretrained family the weights belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArch {
    Sd15,
    Sd21,
    Xl,
}

/// Where the pretrained weights live and how to interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Root of a diffusers-layout model directory.
    pub name_or_path: PathBuf,
    #[serde(default)]
    pub is_xl: bool,
    #[serde(default)]
    pub is_v2: bool,
    #[serde(default)]
    pub is_v_pred: bool,
    #[serde(default)]
    pub vae_path: Option<PathBuf>,
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
    #[serde(default)]
    pub tokenizer_2_path: Option<PathBuf>,
    #[serde(default)]
    pub sliced_attention_size: Option<usize>,
    #[serde(default)]
    pub use_flash_attn: bool,
}

impl ModelConfig {
    pub fn new(name_or_path: impl Into<PathBuf>) -> Self {
        Self {
            name_or_path: name_or_path.into(),
            is_xl: false,
            is_v2: false,
            is_v_pred: false,
            vae_path: None,
            tokenizer_path: None,
            tokenizer_2_path: None,
            sliced_attention_size: None,
            use_flash_attn: false,
        }
    }

    pub fn arch(&self) -> ModelArch {
        if self.is_xl {
            ModelArch::Xl
        } else if self.is_v2 {
            ModelArch::Sd21
        } else {
            ModelArch::Sd15
        }
    }
}

/// Compute device named in the config (`cpu`, `cuda`, `cuda:1`, `mps`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    /// Open the candle device. Fails if candle was built without the backend.
    pub fn open(&self) -> Result<Device> {
        Ok(match self {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(*ordinal)?,
            DeviceSpec::Metal(ordinal) => Device::new_metal(*ordinal)?,
        })
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|e| Error::invalid("device", format!("bad ordinal in `{s}`: {e}")))?;
                (kind, ordinal)
            }
            None => (s.as_str(), 0),
        };
        match kind {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(ordinal)),
            "mps" | "metal" => Ok(DeviceSpec::Metal(ordinal)),
            _ => Err(Error::invalid("device", format!("unknown device `{s}`"))),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceSpec::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

/// Map a precision name to a candle dtype.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.trim().to_ascii_lowercase().as_str() {
        "float16" | "fp16" | "half" | "f16" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float32" | "fp32" | "float" | "full" | "f32" => Ok(DType::F32),
        other => Err(Error::invalid("dtype", format!("unknown dtype `{other}`"))),
    }
}

/// Typed settings of a `batch_img2img` process.
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub output_folder: PathBuf,
    pub copy_inputs_to: Option<PathBuf>,
    pub device: DeviceSpec,
    pub model: ModelConfig,
    pub generate: GenerateConfig,
    pub datasets: Vec<DatasetConfig>,
    pub datasets_reg: Vec<DatasetConfig>,
    pub dtype: DType,
    /// True when every dataset caches its latents.
    pub is_latents_cached: bool,
}

impl GeneratorSettings {
    pub fn from_process(process: &ProcessConfig) -> Result<Self> {
        let output_folder: PathBuf = process.require_conf("output_folder")?;
        let copy_inputs_to: Option<PathBuf> = process.get_conf("copy_inputs_to")?;
        let device: DeviceSpec = process
            .get_conf_or("device", "cuda".to_string())?
            .parse()?;
        let model: ModelConfig = process.require_conf("model")?;
        let generate = process.require_conf::<GenerateConfig>("generate")?.validate()?;
        let raw_datasets: Vec<RawDatasetConfig> = process.get_conf_or("datasets", Vec::new())?;
        let dtype = parse_dtype(&process.get_conf_or("dtype", "float16".to_string())?)?;

        let mut is_latents_cached = true;
        let mut datasets = Vec::new();
        let mut datasets_reg = Vec::new();
        for dataset in preprocess_dataset_raw_config(raw_datasets) {
            if !(dataset.cache_latents || dataset.cache_latents_to_disk) {
                is_latents_cached = false;
            }
            if dataset.is_reg {
                datasets_reg.push(dataset);
            } else {
                datasets.push(dataset);
            }
        }

        info!(
            "Loaded settings: {} dataset(s), {} regularization dataset(s), latents cached: {}",
            datasets.len(),
            datasets_reg.len(),
            is_latents_cached
        );

        Ok(Self {
            output_folder,
            copy_inputs_to,
            device,
            model,
            generate,
            datasets,
            datasets_reg,
            dtype,
            is_latents_cached,
        })
    }
}
