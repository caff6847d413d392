//! Conversions between candle image tensors and `image` buffers.
//!
//! Image tensors are channel-first RGB with values nominally in [-1, 1], the
//! range the VAE consumes and produces.

use candle_core::{DType, Device, Tensor};
use image::{ImageFormat, RgbImage};
use std::path::Path;

use crate::error::{Error, Result};

/// Convert a `(1, 3, H, W)` or `(3, H, W)` tensor in [-1, 1] to an RGB image.
///
/// Values are mapped with `(x + 1) / 2`, clamped to [0, 1], scaled by 255 and
/// truncated, so 0 becomes 127, -1 black and 1 white.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let (height, width, data) = to_hwc_bytes(tensor)?;
    RgbImage::from_raw(width as u32, height as u32, data).ok_or_else(|| {
        Error::Candle(candle_core::Error::Msg(format!(
            "pixel buffer does not fit a {width}x{height} image"
        )))
    })
}

fn to_hwc_bytes(tensor: &Tensor) -> candle_core::Result<(usize, usize, Vec<u8>)> {
    let tensor = match tensor.rank() {
        4 => tensor.get(0)?,
        3 => tensor.clone(),
        rank => candle_core::bail!("expected a CHW or NCHW image tensor, got rank {rank}"),
    };
    let tensor = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let tensor = ((tensor + 1.0)? / 2.0)?.clamp(0f32, 1f32)?;

    let (channels, height, width) = tensor.dims3()?;
    if channels != 3 {
        candle_core::bail!("expected 3 channels (RGB), got {channels}");
    }

    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<f32>()?;
    let bytes = data.into_iter().map(|v| (v * 255.0) as u8).collect();
    Ok((height, width, bytes))
}

/// Convert an RGB image to a `(1, 3, H, W)` f32 tensor in [-1, 1].
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let tensor = Tensor::from_vec(
        image.as_raw().clone(),
        (height as usize, width as usize, 3),
        &Device::Cpu,
    )?
    .permute((2, 0, 1))?
    .to_dtype(DType::F32)?
    .affine(2. / 255., -1.)?
    .unsqueeze(0)?
    .to_device(device)?;
    Ok(tensor)
}

/// Decode any supported image file as 8-bit RGB.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    let path = path.as_ref();
    let image = image::open(path).map_err(|e| Error::image(path, e))?;
    Ok(image.to_rgb8())
}

/// Save an RGB image, choosing the encoder from the file extension.
pub fn save_image<P: AsRef<Path>>(image: &RgbImage, path: P) -> Result<()> {
    let path = path.as_ref();
    let format = match path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => ImageFormat::Jpeg,
        Some("png") => ImageFormat::Png,
        // Default to PNG for anything the image crate cannot name
        _ => ImageFormat::from_path(path).unwrap_or(ImageFormat::Png),
    };
    image
        .save_with_format(path, format)
        .map_err(|e| Error::image(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(value: f32) -> Tensor {
        Tensor::full(value, (1, 3, 4, 6), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_zero_tensor_is_mid_gray() {
        let image = tensor_to_image(&uniform(0.0)).unwrap();
        assert_eq!(image.dimensions(), (6, 4));
        assert!(image.pixels().all(|p| p.0 == [127, 127, 127]));
    }

    #[test]
    fn test_extremes_map_to_black_and_white() {
        let black = tensor_to_image(&uniform(-1.0)).unwrap();
        assert!(black.pixels().all(|p| p.0 == [0, 0, 0]));

        let white = tensor_to_image(&uniform(1.0)).unwrap();
        assert!(white.pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let image = tensor_to_image(&uniform(3.0)).unwrap();
        assert!(image.pixels().all(|p| p.0 == [255, 255, 255]));
        let image = tensor_to_image(&uniform(-7.0)).unwrap();
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_channel_layout_is_preserved() {
        // Red channel high, green mid, blue low; single pixel, no batch dim.
        let tensor = Tensor::new(&[[[1f32]], [[0f32]], [[-1f32]]], &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 127, 0]);
    }

    #[test]
    fn test_f16_input_is_accepted() {
        let tensor = uniform(1.0).to_dtype(DType::F16).unwrap();
        let image = tensor_to_image(&tensor).unwrap();
        assert!(image.pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        let tensor = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }

    #[test]
    fn test_image_to_tensor_inverts_up_to_quantization() {
        let mut image = RgbImage::new(3, 2);
        image.put_pixel(0, 0, image::Rgb([0, 128, 255]));
        image.put_pixel(2, 1, image::Rgb([10, 20, 30]));

        let tensor = image_to_tensor(&image, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 2, 3]);

        let back = tensor_to_image(&tensor).unwrap();
        for (a, b) in image.pixels().zip(back.pixels()) {
            for c in 0..3 {
                assert!((a.0[c] as i16 - b.0[c] as i16).abs() <= 1);
            }
        }
    }

    #[test]
    fn test_save_and_reload_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(1, 1, image::Rgb([9, 8, 7]));

        save_image(&image, &path).unwrap();
        let reloaded = load_image(&path).unwrap();
        assert_eq!(reloaded, image);
    }
}
