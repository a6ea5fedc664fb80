use crate::data::PoseBatch;
use anyhow::{Context, Result};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Validation sample written once per epoch.
pub const VAL_IMG_FNAME: &str = "epoch_{epoch}.png";
/// Training sample written every `visual_freq` iterations.
pub const TRAIN_IMG_FNAME: &str = "train_img/epoch_{epoch}_{iteration}.png";

/// Substitute `{epoch}` and `{iteration}` with zero-padded counters.
pub fn fill_template(template: &str, epoch: usize, iteration: usize) -> String {
    template
        .replace("{epoch}", &format!("{epoch:04}"))
        .replace("{iteration}", &format!("{iteration:04}"))
}

/// Writes a picture of a batch alongside generated images.
pub trait Visualizer<B: Backend> {
    fn render(&self, path: &Path, batch: &PoseBatch<B>, generated: &[Tensor<B, 4>]) -> Result<()>;
}

/// Grid with one row per sample and one column per tensor:
/// condition, pose, target, mask, then every generated image.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageGrid;

impl<B: Backend> Visualizer<B> for ImageGrid {
    fn render(&self, path: &Path, batch: &PoseBatch<B>, generated: &[Tensor<B, 4>]) -> Result<()> {
        // Masks are stored in [0, 1]; shift them into the image range.
        let mask = batch.target_mask.clone().mul_scalar(2.0).sub_scalar(1.0);
        let mut columns = vec![
            batch.condition_image.clone(),
            batch.condition_pose.clone(),
            batch.target_image.clone(),
            mask,
        ];
        columns.extend(generated.iter().cloned());

        let strips = columns
            .into_iter()
            .map(|column| column_strip(to_rgb(column)))
            .collect::<Result<Vec<_>>>()?;
        save_columns(&strips, path)
    }
}

/// Collapse any channel count to three so it can be drawn as RGB.
pub fn to_rgb<B: Backend>(tensor: Tensor<B, 4>) -> Tensor<B, 4> {
    match tensor.dims()[1] {
        3 => tensor,
        1 => tensor.repeat_dim(1, 3),
        _ => tensor.max_dim(1).repeat_dim(1, 3),
    }
}

/// Draw a `[batch, 3, height, width]` tensor in [-1, 1] as a single strip,
/// samples stacked top to bottom.
pub fn column_strip<B: Backend>(tensor: Tensor<B, 4>) -> Result<RgbImage> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(anyhow::anyhow!("cannot draw {channels} channels as RGB"));
    }
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .context("failed to read tensor data as f32")?;

    let plane = height * width;
    let byte = |value: f32| ((value + 1.0) * 127.5).clamp(0.0, 255.0) as u8;
    Ok(RgbImage::from_fn(width as u32, (batch * height) as u32, |x, y| {
        let (sample, row) = (y as usize / height, y as usize % height);
        let red = sample * 3 * plane + row * width + x as usize;
        Rgb([
            byte(values[red]),
            byte(values[red + plane]),
            byte(values[red + 2 * plane]),
        ])
    }))
}

/// Lay `strips` out left to right and write the picture to `path`.
pub fn save_columns(strips: &[RgbImage], path: &Path) -> Result<()> {
    let height = strips.iter().map(RgbImage::height).max().unwrap_or(0);
    let width = strips.iter().map(RgbImage::width).sum();
    if width == 0 || height == 0 {
        return Err(anyhow::anyhow!("nothing to draw into {}", path.display()));
    }

    let mut canvas = RgbImage::new(width, height);
    let mut left = 0;
    for strip in strips {
        canvas
            .copy_from(strip, left, 0)
            .context("failed to place image column")?;
        left += strip.width();
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    canvas
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}
