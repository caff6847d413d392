//! Data loader over folders of images with sidecar caption files.
//!
//! Handles:
//! - Scanning dataset folders for images (sorted, repeated `num_repeats` times)
//! - Caption file loading (`<stem>.<caption_ext>`, falling back to the default caption)
//! - Area bucketing to about `resolution²` pixels on a 64-pixel grid
//! - Batching (one item per batch)

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DatasetConfig;
use crate::error::{Error, Result};
use crate::image_utils;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];
const BUCKET_STEP: u32 = 64;

/// One image file with its caption and decoded tensor.
#[derive(Debug, Clone)]
pub struct FileItem {
    pub path: PathBuf,
    pub caption: String,
    /// `(1, 3, H, W)` in [-1, 1], on the CPU.
    pub tensor: Tensor,
}

/// A batch of file items and their stacked tensor.
#[derive(Debug)]
pub struct DataLoaderBatch {
    pub file_items: Vec<FileItem>,
    pub tensor: Tensor,
}

impl DataLoaderBatch {
    fn from_items(file_items: Vec<FileItem>) -> Result<Self> {
        let tensors: Vec<&Tensor> = file_items.iter().map(|item| &item.tensor).collect();
        let tensor = Tensor::cat(&tensors, 0)?;
        Ok(Self { file_items, tensor })
    }

    /// Captions in item order.
    pub fn get_caption_list(&self) -> Vec<String> {
        self.file_items.iter().map(|item| item.caption.clone()).collect()
    }

    /// Release the batch tensors once the batch has been consumed.
    pub fn cleanup(self) {
        debug!("Releasing batch of {} item(s)", self.file_items.len());
    }
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    dataset: usize,
}

/// Sequential loader over one or more datasets.
pub struct DataLoader {
    datasets: Vec<DatasetConfig>,
    entries: Vec<Entry>,
    batch_size: usize,
    position: usize,
}

impl DataLoader {
    /// Scan every dataset folder. Only a batch size of 1 is supported.
    pub fn from_datasets(datasets: &[DatasetConfig], batch_size: usize) -> Result<Self> {
        if batch_size != 1 {
            return Err(Error::invalid(
                "batch_size",
                format!("only a batch size of 1 is supported, got {batch_size}"),
            ));
        }

        let mut entries = Vec::new();
        for (index, dataset) in datasets.iter().enumerate() {
            let images = scan_folder(&dataset.folder_path)?;
            info!(
                "Dataset {}: {} image(s) at resolution {} x{} repeats",
                dataset.folder_path.display(),
                images.len(),
                dataset.resolution,
                dataset.num_repeats
            );
            for _ in 0..dataset.num_repeats.max(1) {
                entries.extend(images.iter().map(|path| Entry {
                    path: path.clone(),
                    dataset: index,
                }));
            }
        }

        if entries.is_empty() {
            warn!("No images found in the configured datasets");
        }

        Ok(Self {
            datasets: datasets.to_vec(),
            entries,
            batch_size,
            position: 0,
        })
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.entries.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn load_item(&self, entry: &Entry) -> Result<FileItem> {
        let dataset = &self.datasets[entry.dataset];
        let caption = read_caption(&entry.path, dataset)?;

        let image = DynamicImage::ImageRgb8(image_utils::load_image(&entry.path)?);
        let (width, height) = bucket_dimensions(image.width(), image.height(), dataset.resolution);
        let image = image
            .resize_to_fill(width, height, FilterType::Lanczos3)
            .to_rgb8();
        let tensor = image_utils::image_to_tensor(&image, &Device::Cpu)?;

        Ok(FileItem {
            path: entry.path.clone(),
            caption,
            tensor,
        })
    }
}

impl Iterator for DataLoader {
    type Item = Result<DataLoaderBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.entries.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.entries.len());
        let batch = self.entries[self.position..end]
            .iter()
            .map(|entry| self.load_item(entry))
            .collect::<Result<Vec<_>>>()
            .and_then(DataLoaderBatch::from_items);
        self.position = end;
        Some(batch)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Image files directly inside `folder`, sorted by path.
fn scan_folder(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(folder).map_err(|e| Error::Dataset {
        path: folder.to_path_buf(),
        reason: format!("failed to read dataset directory: {e}"),
    })?;

    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

fn read_caption(image_path: &Path, dataset: &DatasetConfig) -> Result<String> {
    let caption_path = image_path.with_extension(&dataset.caption_ext);
    if caption_path.is_file() {
        Ok(fs::read_to_string(&caption_path)?.trim().to_string())
    } else {
        debug!("No caption file for image: {}", image_path.display());
        Ok(dataset.default_caption.clone().unwrap_or_default())
    }
}

/// Scale `width x height` to about `resolution²` pixels, keeping the aspect
/// ratio, and snap both sides down to the bucket grid.
pub fn bucket_dimensions(width: u32, height: u32, resolution: usize) -> (u32, u32) {
    let scale = resolution as f64 / ((width as f64) * (height as f64)).sqrt();
    let snap = |side: u32| {
        let scaled = (side as f64 * scale) as u32;
        (scaled / BUCKET_STEP * BUCKET_STEP).max(BUCKET_STEP)
    };
    (snap(width), snap(height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_image(dir: &Path, name: &str, width: u32, height: u32, color: [u8; 3]) {
        RgbImage::from_pixel(width, height, Rgb(color))
            .save(dir.join(name))
            .unwrap();
    }

    fn dataset(dir: &Path, resolution: usize) -> DatasetConfig {
        DatasetConfig {
            resolution,
            ..DatasetConfig::new(dir)
        }
    }

    #[test]
    fn test_bucket_dimensions() {
        assert_eq!(bucket_dimensions(100, 100, 64), (64, 64));
        assert_eq!(bucket_dimensions(1024, 1024, 512), (512, 512));
        assert_eq!(bucket_dimensions(1024, 768, 512), (576, 384));
        // Never collapses below one bucket step.
        assert_eq!(bucket_dimensions(4000, 10, 64), (1280, 64));
    }

    #[test]
    fn test_loads_sorted_items_with_captions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_image(dir.path(), "b.png", 80, 80, [255, 0, 0]);
        write_image(dir.path(), "a.png", 80, 80, [0, 0, 0]);
        fs::write(dir.path().join("a.txt"), "  first caption\n")?;
        fs::write(dir.path().join("notes.md"), "ignored")?;

        let mut config = dataset(dir.path(), 64);
        config.default_caption = Some("fallback".to_string());
        let loader = DataLoader::from_datasets(&[config], 1)?;
        assert_eq!(loader.len(), 2);

        let batches = loader.collect::<Result<Vec<_>>>()?;
        assert_eq!(batches[0].file_items[0].path, dir.path().join("a.png"));
        assert_eq!(batches[0].get_caption_list(), vec!["first caption".to_string()]);
        assert_eq!(batches[1].get_caption_list(), vec!["fallback".to_string()]);
        assert_eq!(batches[0].tensor.dims(), &[1, 3, 64, 64]);

        // Black pixels land at -1.
        let min = batches[0].tensor.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min < -0.99);
        Ok(())
    }

    #[test]
    fn test_repeats_and_multiple_datasets() -> Result<()> {
        let first = tempfile::tempdir()?;
        let second = tempfile::tempdir()?;
        write_image(first.path(), "x.jpg", 64, 64, [1, 2, 3]);
        write_image(second.path(), "y.png", 64, 128, [1, 2, 3]);

        let mut repeated = dataset(first.path(), 64);
        repeated.num_repeats = 3;
        let loader = DataLoader::from_datasets(&[repeated, dataset(second.path(), 64)], 1)?;
        assert_eq!(loader.len(), 4);

        let batches = loader.collect::<Result<Vec<_>>>()?;
        assert_eq!(batches[3].file_items[0].path, second.path().join("y.png"));
        // 64x128 keeps its aspect ratio: 45x90 snaps up to the minimum grid.
        assert_eq!(batches[3].tensor.dims(), &[1, 3, 64, 64]);
        assert_eq!(batches[0].get_caption_list(), vec![String::new()]);
        Ok(())
    }

    #[test]
    fn test_empty_dataset_list() -> Result<()> {
        let mut loader = DataLoader::from_datasets(&[], 1)?;
        assert!(loader.is_empty());
        assert_eq!(loader.len(), 0);
        assert!(loader.next().is_none());
        Ok(())
    }

    #[test]
    fn test_missing_folder_and_batch_size() {
        let missing = dataset(Path::new("/definitely/not/here"), 64);
        assert!(matches!(
            DataLoader::from_datasets(&[missing], 1),
            Err(Error::Dataset { .. })
        ));
        assert!(matches!(
            DataLoader::from_datasets(&[], 2),
            Err(Error::InvalidConfig { .. })
        ));
    }
}
