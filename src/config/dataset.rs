//! Dataset entries as written in the job file, and their normalized form.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `resolution` may be written as a single size or a list of sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resolution {
    One(usize),
    Many(Vec<usize>),
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::One(512)
    }
}

impl Resolution {
    pub fn to_vec(&self) -> Vec<usize> {
        match self {
            Resolution::One(size) => vec![*size],
            Resolution::Many(sizes) => sizes.clone(),
        }
    }
}

fn default_caption_ext() -> String {
    "txt".to_string()
}

fn default_num_repeats() -> usize {
    1
}

/// A dataset entry before resolution lists are expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDatasetConfig {
    pub folder_path: PathBuf,
    #[serde(default = "default_caption_ext")]
    pub caption_ext: String,
    #[serde(default)]
    pub default_caption: Option<String>,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "default_num_repeats")]
    pub num_repeats: usize,
    #[serde(default)]
    pub is_reg: bool,
    #[serde(default)]
    pub cache_latents: bool,
    #[serde(default)]
    pub cache_latents_to_disk: bool,
}

/// One folder of images with sidecar caption files, at one resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    pub folder_path: PathBuf,
    pub caption_ext: String,
    pub default_caption: Option<String>,
    /// Target side length; images are bucketed to about `resolution²` pixels.
    pub resolution: usize,
    pub num_repeats: usize,
    /// Regularization sets are kept apart and never generated from.
    pub is_reg: bool,
    pub cache_latents: bool,
    pub cache_latents_to_disk: bool,
}

impl DatasetConfig {
    pub fn new(folder_path: impl Into<PathBuf>) -> Self {
        Self {
            folder_path: folder_path.into(),
            caption_ext: default_caption_ext(),
            default_caption: None,
            resolution: 512,
            num_repeats: 1,
            is_reg: false,
            cache_latents: false,
            cache_latents_to_disk: false,
        }
    }
}

/// Split every raw entry into one config per listed resolution, keeping order.
pub fn preprocess_dataset_raw_config(raw: Vec<RawDatasetConfig>) -> Vec<DatasetConfig> {
    raw.into_iter()
        .flat_map(|entry| {
            entry
                .resolution
                .to_vec()
                .into_iter()
                .map(move |resolution| DatasetConfig {
                    folder_path: entry.folder_path.clone(),
                    caption_ext: entry.caption_ext.trim_start_matches('.').to_string(),
                    default_caption: entry.default_caption.clone(),
                    resolution,
                    num_repeats: entry.num_repeats.max(1),
                    is_reg: entry.is_reg,
                    cache_latents: entry.cache_latents,
                    cache_latents_to_disk: entry.cache_latents_to_disk,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_and_list_resolutions() {
        let raw: Vec<RawDatasetConfig> = serde_yaml::from_str(
            r#"
- folder_path: /a
- folder_path: /b
  resolution: [256, 1024]
  caption_ext: .caption
"#,
        )
        .unwrap();

        let datasets = preprocess_dataset_raw_config(raw);
        let summary: Vec<_> = datasets
            .iter()
            .map(|d| (d.folder_path.to_str().unwrap(), d.resolution, d.caption_ext.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![("/a", 512, "txt"), ("/b", 256, "caption"), ("/b", 1024, "caption")]
        );
    }
}
