use std::path::Path;

use anyhow::Result;
use caat::{
    concepts::Concept,
    dataset::{CustomDiffusionDataset, DatasetConfig},
    loss::masked_mse,
    pgd::{linf_distance, PgdConfig},
    restore::{RandomRestore, Resample},
};
use candle_core::{DType, Device, Tensor, Var};
use image::{Rgb, RgbImage};
use rand::{rngs::StdRng, SeedableRng};

fn write_image(path: &Path, w: u32, h: u32, seed: u8) -> Result<()> {
    let img = RgbImage::from_fn(w, h, |x, y| {
        Rgb([
            (x as u8).wrapping_mul(seed),
            (y as u8).wrapping_add(seed),
            seed,
        ])
    });
    img.save(path)?;
    Ok(())
}

fn config(size: usize, with_prior_preservation: bool) -> DatasetConfig {
    DatasetConfig {
        size,
        mask_size: size / 8,
        center_crop: true,
        hflip: false,
        aug: true,
        with_prior_preservation,
        num_class_images: 2,
    }
}

#[test]
fn empty_instance_dir_is_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let concepts = vec![Concept {
        instance_prompt: "photo of sks person".to_string(),
        class_prompt: None,
        instance_data_dir: dir.path().to_path_buf(),
        class_data_dir: None,
    }];
    let mut rng = StdRng::seed_from_u64(0);
    assert!(CustomDiffusionDataset::new(&concepts, config(64, false), &mut rng).is_err());
    Ok(())
}

#[test]
fn class_images_come_from_a_list_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let instances = dir.path().join("instances");
    std::fs::create_dir(&instances)?;
    write_image(&instances.join("a.png"), 40, 48, 3)?;
    let class_a = dir.path().join("class_a.png");
    let class_b = dir.path().join("class_b.png");
    let class_c = dir.path().join("class_c.png");
    for (i, p) in [&class_a, &class_b, &class_c].iter().enumerate() {
        write_image(p, 64, 64, i as u8 + 1)?;
    }
    let list = dir.path().join("class_images.txt");
    std::fs::write(
        &list,
        format!("{}\n{}\n{}\n", class_a.display(), class_b.display(), class_c.display()),
    )?;
    let prompts = dir.path().join("class_prompts.txt");
    std::fs::write(&prompts, "a person\na man\na woman\n")?;

    let concepts = vec![Concept {
        instance_prompt: "photo of sks person".to_string(),
        class_prompt: Some(prompts.display().to_string()),
        instance_data_dir: instances,
        class_data_dir: Some(list),
    }];
    let mut rng = StdRng::seed_from_u64(0);
    let ds = CustomDiffusionDataset::new(&concepts, config(32, true), &mut rng)?;
    // truncated to num_class_images
    assert_eq!(ds.class_images().len(), 2);
    assert_eq!(ds.class_images()[1].1, "a man");
    assert_eq!(ds.len(), 2);

    let example = ds.class_example(3, &mut rng)?;
    assert_eq!(example.image.dims(), &[3, 32, 32]);
    assert_eq!(example.prompt, "a man");
    let ones: f32 = example.mask.flatten_all()?.to_vec1::<f32>()?.iter().sum();
    assert_eq!(ones, 16.0);

    let instance = ds.example(0, &mut rng)?;
    assert_eq!(instance.image.dims(), &[3, 32, 32]);
    assert!(instance.prompt.ends_with("photo of sks person"));
    Ok(())
}

/// Runs the PGD loop against a toy differentiable objective and checks the
/// perturbation invariants hold at every step.
#[test]
fn pgd_loop_keeps_images_in_the_eps_ball() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for i in 0..3u8 {
        write_image(&dir.path().join(format!("{i}.png")), 48, 40, i + 5)?;
    }
    let concepts = vec![Concept {
        instance_prompt: "photo of sks person".to_string(),
        class_prompt: None,
        instance_data_dir: dir.path().to_path_buf(),
        class_data_dir: None,
    }];
    let mut rng = StdRng::seed_from_u64(1042);
    let ds = CustomDiffusionDataset::new(&concepts, config(32, false), &mut rng)?;
    let original = ds.instance_batch(&mut rng)?;
    assert_eq!(original.dims(), &[3, 3, 32, 32]);
    let (mask, prompts) = ds.instance_masks(&mut rng)?;
    assert_eq!(mask.dims(), &[3, 1, 4, 4]);
    assert_eq!(prompts.len(), 3);

    let device = Device::Cpu;
    let perturbed = Var::from_tensor(&original)?;
    let pgd = PgdConfig::new(0.01, 0.03);
    let restore = RandomRestore::new(Box::new(Resample::new(2)), 0.5);
    let target = Tensor::zeros((3, 4, 4, 4), DType::F32, &device)?;

    let mut last_loss = f32::MIN;
    for _ in 0..6 {
        let (images, _) = restore.apply(perturbed.as_tensor(), &mut rng)?;
        // 8x down-sampling and a channel expansion stand in for the encoder.
        let latents = images.avg_pool2d(8)?;
        let latents = Tensor::cat(&[&latents, &latents.mean_keepdim(1)?], 1)?;
        let loss = masked_mse(&latents, &target, &mask)?;
        let grads = loss.backward()?;
        let grad = grads.get(perturbed.as_tensor()).expect("image gradient");
        pgd.step(&perturbed, &original, grad, None)?;

        let linf = linf_distance(perturbed.as_tensor(), &original)?;
        assert!(linf <= 0.03 + 1e-5, "linf {linf}");
        let values = perturbed.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        last_loss = loss.to_scalar::<f32>()?;
    }
    assert!(last_loss.is_finite());
    Ok(())
}
