pub mod discriminator;
pub mod generator;
pub mod layers;

use burn::prelude::*;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{Generator, GeneratorConfig};

/// Hyperparameters for the two generators and the discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 3)]
    pub image_channels: usize,
    #[config(default = 18)]
    pub pose_channels: usize,
    #[config(default = 64)]
    pub generator_1_dim: usize,
    #[config(default = 5)]
    pub generator_1_depth: usize,
    #[config(default = 64)]
    pub generator_2_dim: usize,
    #[config(default = 3)]
    pub generator_2_depth: usize,
    #[config(default = 64)]
    pub discriminator_dim: usize,
    #[config(default = 4)]
    pub discriminator_depth: usize,
}

impl ModelConfig {
    /// Stage 1: (condition image ⊕ target pose) -> coarse image.
    pub fn generator_1_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(
            self.image_channels + self.pose_channels,
            self.image_channels,
            self.generator_1_dim,
            self.generator_1_depth,
        )
    }

    /// Stage 2: (condition image ⊕ coarse image) -> difference image.
    pub fn generator_2_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(
            self.image_channels * 2,
            self.image_channels,
            self.generator_2_dim,
            self.generator_2_depth,
        )
        .with_tanh_output(false)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.image_channels * 2, self.discriminator_dim)
            .with_depth(self.discriminator_depth)
    }

    pub fn init_generator_1<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_1_config().init(device)
    }

    pub fn init_generator_2<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_2_config().init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        self.discriminator_config().init(device)
    }

    /// Height and width must be divisible by this to survive every down/up pass.
    pub fn spatial_multiple(&self) -> usize {
        1 << self.generator_1_depth.max(self.generator_2_depth).max(1)
    }
}
