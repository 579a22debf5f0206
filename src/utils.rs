use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Error, Tensor};
use image::ImageBuffer;

/// Saves an image to disk using the image crate, this expects an input with shape
/// (c, height, width).
pub fn save_image<P: AsRef<Path>>(img: &Tensor, p: P) -> Result<()> {
    let p = p.as_ref();
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        return Err(Error::Msg(
            "save_image expects an input of shape (3, height, width)".to_string(),
        )
        .into());
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let image: ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        match ImageBuffer::from_raw(width as u32, height as u32, pixels) {
            Some(image) => image,
            None => return Err(Error::Msg("error saving image".to_string()).into()),
        };
    image.save(p).map_err(candle_core::Error::wrap)?;
    Ok(())
}

/// Maps `[-1, 1]` images to `u8` pixels as `x * 127.5 + 128`, on the CPU.
pub fn to_pixels(img: &Tensor) -> Result<Tensor> {
    let img = img
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(127.5, 128.)?
        .clamp(0f32, 255.)?
        .to_dtype(DType::U8)?;
    Ok(img)
}

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        let device = Device::cuda_if_available(0)?;
        if !device.is_cuda() {
            tracing::warn!("running on CPU, to run on GPU build with `--features cuda`");
        }
        Ok(device)
    }
}

/// `{step}_noise_{index}_{stem}.png` for the perturbed version of the
/// `index`-th source. The index keeps same-named files from different
/// concept directories apart.
pub fn noise_filename(step: usize, index: usize, source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    format!("{step}_noise_{index}_{stem}.png")
}
