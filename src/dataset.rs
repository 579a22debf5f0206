//! Instance and class images with the resize augmentation and valid-region
//! masks used for loss weighting.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use rand::{seq::SliceRandom, Rng};

use crate::{concepts::Concept, CaatError};

const FAR_AWAY_PREFIXES: [&str; 2] = ["a far away ", "very small "];
const CLOSE_UP_PREFIXES: [&str; 2] = ["zoomed in ", "close up "];

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Side of the square training images.
    pub size: usize,
    /// Side of the latent grid the masks are expressed in.
    pub mask_size: usize,
    pub center_crop: bool,
    pub hflip: bool,
    pub aug: bool,
    pub with_prior_preservation: bool,
    pub num_class_images: usize,
}

/// One preprocessed sample.
#[derive(Debug, Clone)]
pub struct Example {
    /// `(3, size, size)` in `[-1, 1]`.
    pub image: Tensor,
    /// `(mask_size, mask_size)`, ones over the valid region.
    pub mask: Tensor,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct CustomDiffusionDataset {
    config: DatasetConfig,
    instance_images: Vec<(PathBuf, String)>,
    class_images: Vec<(PathBuf, String)>,
}

impl CustomDiffusionDataset {
    pub fn new<R: Rng>(concepts: &[Concept], config: DatasetConfig, rng: &mut R) -> Result<Self> {
        if config.mask_size == 0 || config.size % config.mask_size != 0 {
            anyhow::bail!(CaatError::Config(format!(
                "mask size {} should divide the image size {}",
                config.mask_size, config.size
            )))
        }
        let mut instance_images = Vec::new();
        let mut class_images = Vec::new();
        for concept in concepts {
            let files = list_files(&concept.instance_data_dir)?;
            if files.is_empty() {
                anyhow::bail!(CaatError::EmptyInstanceDir(concept.instance_data_dir.clone()))
            }
            instance_images.extend(
                files
                    .into_iter()
                    .map(|path| (path, concept.instance_prompt.clone())),
            );
            if config.with_prior_preservation {
                let mut images = class_images_for(concept)?;
                images.truncate(config.num_class_images);
                class_images.extend(images);
            }
        }
        instance_images.shuffle(rng);
        tracing::info!(
            instances = instance_images.len(),
            classes = class_images.len(),
            "dataset ready"
        );
        Ok(Self {
            config,
            instance_images,
            class_images,
        })
    }

    pub fn instance_images(&self) -> &[(PathBuf, String)] {
        &self.instance_images
    }

    pub fn class_images(&self) -> &[(PathBuf, String)] {
        &self.class_images
    }

    pub fn len(&self) -> usize {
        self.instance_images.len().max(self.class_images.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resize scale for one sample: the full size without augmentation,
    /// otherwise a zoom-out in `[size/3, size]` two thirds of the time and a
    /// zoom-in in `[1.2 size, 1.4 size)` otherwise.
    pub fn random_scale<R: Rng>(&self, rng: &mut R) -> usize {
        let size = self.config.size;
        if !self.config.aug {
            return size;
        }
        if rng.gen::<f64>() < 0.66 {
            rng.gen_range(size / 3..=size)
        } else {
            let lo = (1.2 * size as f64) as usize;
            let hi = ((1.4 * size as f64) as usize).max(lo + 1);
            rng.gen_range(lo..hi)
        }
    }

    /// Resizes to `scale x scale` and places the result on the `size x size`
    /// canvas: zoomed-in images are randomly cropped, zoomed-out ones pasted
    /// at a random offset over zero padding. The mask marks the pasted area,
    /// shrunk by one latent cell on each side.
    pub fn preprocess<R: Rng>(
        &self,
        image: &DynamicImage,
        scale: usize,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let size = self.config.size;
        let mask_size = self.config.mask_size;
        let factor = size / mask_size;
        let (outer, inner) = if scale > size {
            (scale, size)
        } else {
            (size, scale)
        };
        let top = rng.gen_range(0..=outer - inner);
        let left = rng.gen_range(0..=outer - inner);

        let resized = image
            .resize_exact(scale as u32, scale as u32, FilterType::Triangle)
            .to_rgb8();
        let src = resized.as_raw();
        let mut canvas = vec![0f32; size * size * 3];
        let mut mask = vec![0f32; mask_size * mask_size];
        let to_unit = |v: u8| v as f32 / 127.5 - 1.0;

        if scale > size {
            for y in 0..size {
                let row = ((top + y) * scale + left) * 3;
                for (dst, &v) in canvas[y * size * 3..(y + 1) * size * 3]
                    .iter_mut()
                    .zip(&src[row..row + size * 3])
                {
                    *dst = to_unit(v);
                }
            }
            mask.fill(1.0);
        } else {
            for y in 0..scale {
                let dst = ((top + y) * size + left) * 3;
                for (d, &v) in canvas[dst..dst + scale * 3]
                    .iter_mut()
                    .zip(&src[y * scale * 3..(y + 1) * scale * 3])
                {
                    *d = to_unit(v);
                }
            }
            let (y0, y1) = (top / factor + 1, ((top + scale) / factor).saturating_sub(1));
            let (x0, x1) = (left / factor + 1, ((left + scale) / factor).saturating_sub(1));
            for y in y0..y1.min(mask_size) {
                for x in x0..x1.min(mask_size) {
                    mask[y * mask_size + x] = 1.0;
                }
            }
        }

        let image = Tensor::from_vec(canvas, (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
        let mask = Tensor::from_vec(mask, (mask_size, mask_size), &Device::Cpu)?;
        Ok((image.contiguous()?, mask))
    }

    /// Prefixes the prompt to describe how far the resize zoomed.
    pub fn augment_prompt<R: Rng>(&self, prompt: &str, scale: usize, rng: &mut R) -> String {
        let size = self.config.size as f64;
        let prefixes = if (scale as f64) < 0.6 * size {
            &FAR_AWAY_PREFIXES
        } else if scale > self.config.size {
            &CLOSE_UP_PREFIXES
        } else {
            return prompt.to_string();
        };
        let prefix = prefixes.choose(rng).copied().unwrap_or_default();
        format!("{prefix}{prompt}")
    }

    /// Flip (when enabled), resize the short side to `size`, center or
    /// random crop, and normalise to `[-1, 1]`.
    pub fn image_transform<R: Rng>(&self, image: &DynamicImage, rng: &mut R) -> Result<Tensor> {
        let size = self.config.size as u32;
        let image = self.maybe_flip(image, rng);
        let (w, h) = (image.width(), image.height());
        let (nw, nh) = if w <= h {
            (size, ((h as u64 * size as u64) / w as u64) as u32)
        } else {
            (((w as u64 * size as u64) / h as u64) as u32, size)
        };
        let image = image.resize_exact(nw.max(size), nh.max(size), FilterType::Triangle);
        let (x, y) = if self.config.center_crop {
            ((image.width() - size) / 2, (image.height() - size) / 2)
        } else {
            (
                rng.gen_range(0..=image.width() - size),
                rng.gen_range(0..=image.height() - size),
            )
        };
        let image = image.crop_imm(x, y, size, size);
        to_tensor(&image)
    }

    fn maybe_flip<R: Rng>(&self, image: &DynamicImage, rng: &mut R) -> DynamicImage {
        if self.config.hflip && rng.gen::<f64>() < 0.5 {
            image.fliph()
        } else {
            image.clone()
        }
    }

    /// The augmented training sample for `index`, cycling over the instances.
    pub fn example<R: Rng>(&self, index: usize, rng: &mut R) -> Result<Example> {
        let (path, prompt) = &self.instance_images[index % self.instance_images.len()];
        let image = load_image(path)?;
        let image = self.maybe_flip(&image, rng);
        let scale = self.random_scale(rng);
        let (image, mask) = self.preprocess(&image, scale, rng)?;
        let prompt = self.augment_prompt(prompt, scale, rng);
        Ok(Example {
            image,
            mask,
            prompt,
        })
    }

    /// Class samples are not zoomed and count everywhere in the loss.
    pub fn class_example<R: Rng>(&self, index: usize, rng: &mut R) -> Result<Example> {
        if self.class_images.is_empty() {
            anyhow::bail!(CaatError::String("no class images available"))
        }
        let (path, prompt) = &self.class_images[index % self.class_images.len()];
        let image = self.image_transform(&load_image(path)?, rng)?;
        let mask_size = self.config.mask_size;
        let mask = Tensor::ones((mask_size, mask_size), DType::F32, &Device::Cpu)?;
        Ok(Example {
            image,
            mask,
            prompt: prompt.clone(),
        })
    }

    /// Transformed instance images stacked as `(n, 3, size, size)`; these are
    /// the starting point of the perturbation.
    pub fn instance_batch<R: Rng>(&self, rng: &mut R) -> Result<Tensor> {
        let images = self
            .instance_images
            .iter()
            .map(|(path, _)| self.image_transform(&load_image(path)?, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&images, 0)?)
    }

    /// One loss mask per instance, `(n, 1, mask_size, mask_size)`, drawn with
    /// the resize augmentation, together with the prompt matching each draw.
    pub fn instance_masks<R: Rng>(&self, rng: &mut R) -> Result<(Tensor, Vec<String>)> {
        let mut masks = Vec::with_capacity(self.instance_images.len());
        let mut prompts = Vec::with_capacity(self.instance_images.len());
        for (path, prompt) in &self.instance_images {
            let image = load_image(path)?;
            let scale = self.random_scale(rng);
            let (_, mask) = self.preprocess(&image, scale, rng)?;
            masks.push(mask.unsqueeze(0)?);
            prompts.push(self.augment_prompt(prompt, scale, rng));
        }
        Ok((Tensor::stack(&masks, 0)?, prompts))
    }
}

pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();
    let image = image::io::Reader::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("decoding {}", path.display()))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// `(3, h, w)` float tensor in `[-1, 1]`.
pub fn to_tensor(image: &DynamicImage) -> Result<Tensor> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let img = image.to_rgb8().into_raw();
    let img = Tensor::from_vec(img, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?;
    Ok(img)
}

/// Regular files of a directory, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// A class data directory pairs every file with the class prompt; a class
/// data file lists image paths, one per line, and the class prompt is then a
/// file with one prompt per line.
fn class_images_for(concept: &Concept) -> Result<Vec<(PathBuf, String)>> {
    let dir = concept
        .class_data_dir
        .as_ref()
        .ok_or(CaatError::String("class data directory missing for concept"))?;
    let class_prompt = concept
        .class_prompt
        .as_ref()
        .ok_or(CaatError::String("class prompt missing for concept"))?;
    if dir.is_dir() {
        Ok(list_files(dir)?
            .into_iter()
            .map(|path| (path, class_prompt.clone()))
            .collect())
    } else {
        let paths = std::fs::read_to_string(dir)
            .with_context(|| format!("reading class image list {}", dir.display()))?;
        let prompts = std::fs::read_to_string(class_prompt)
            .with_context(|| format!("reading class prompt list {class_prompt}"))?;
        Ok(paths
            .lines()
            .zip(prompts.lines())
            .map(|(p, prompt)| (PathBuf::from(p), prompt.to_string()))
            .collect())
    }
}
