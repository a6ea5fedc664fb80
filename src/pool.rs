use burn::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// History of previously generated images fed to the discriminator.
///
/// With probability one half a queried image is swapped for a random stored
/// one, so the discriminator keeps seeing older generator outputs. A pool of
/// size zero passes images through unchanged.
pub struct ImagePool<B: Backend> {
    pool_size: usize,
    images: Vec<Tensor<B, 4>>,
    rng: StdRng,
}

impl<B: Backend> ImagePool<B> {
    pub fn new(pool_size: usize, seed: u64) -> Self {
        Self {
            pool_size,
            images: Vec::with_capacity(pool_size),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool_size > 0
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Return a batch of the same shape mixing `images` with pooled history.
    pub fn query(&mut self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        if !self.is_enabled() {
            return images;
        }

        let batch_size = images.dims()[0];
        let mut selected = Vec::with_capacity(batch_size);
        for idx in 0..batch_size {
            let image = images.clone().slice_dim(0, idx..idx + 1);
            if self.images.len() < self.pool_size {
                self.images.push(image.clone());
                selected.push(image);
            } else if self.rng.gen_bool(0.5) {
                let slot = self.rng.gen_range(0..self.images.len());
                let previous = std::mem::replace(&mut self.images[slot], image);
                selected.push(previous);
            } else {
                selected.push(image);
            }
        }
        Tensor::cat(selected, 0)
    }
}
