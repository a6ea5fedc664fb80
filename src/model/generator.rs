use crate::model::layers::{DownBlock, UpBlock};
use burn::prelude::*;

/// Configuration for the U-Net generator used by both PG2 stages.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub input_channels: usize,
    pub output_channels: usize,
    pub hidden_dim: usize,
    pub depth: usize,
    /// Squash the output to [-1, 1]. Disabled for the residual generator.
    #[config(default = true)]
    pub tanh_output: bool,
}

/// Encoder/decoder with skip connections between mirrored levels.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    down: Vec<DownBlock<B>>,
    up: Vec<UpBlock<B>>,
    #[module(ignore)]
    tanh_output: bool,
}

impl GeneratorConfig {
    /// Channel width of encoder level `level`, capped at 8x the hidden size.
    fn level_channels(&self, level: usize) -> usize {
        self.hidden_dim * (1 << level.min(3))
    }

    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let depth = self.depth.max(1);

        let mut down = Vec::with_capacity(depth);
        let mut in_channels = self.input_channels;
        for level in 0..depth {
            let out_channels = self.level_channels(level);
            down.push(DownBlock::new(in_channels, out_channels, level != 0, device));
            in_channels = out_channels;
        }

        // Up block `idx` maps encoder level `depth - 1 - idx` back to the level above it.
        let mut up = Vec::with_capacity(depth);
        for idx in 0..depth {
            let level = depth - 1 - idx;
            let in_channels = if idx == 0 {
                self.level_channels(level)
            } else {
                self.level_channels(level) * 2
            };
            let last = idx == depth - 1;
            let out_channels = if last {
                self.output_channels
            } else {
                self.level_channels(level - 1)
            };
            up.push(UpBlock::new(in_channels, out_channels, !last, device));
        }

        Generator {
            down,
            up,
            tanh_output: self.tanh_output,
        }
    }
}

impl<B: Backend> Generator<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.down.len());
        let mut x = images;
        for block in &self.down {
            x = block.forward(x);
            skips.push(x.clone());
        }
        // The bottleneck feeds the decoder directly.
        skips.pop();

        for (idx, block) in self.up.iter().enumerate() {
            if idx > 0 {
                if let Some(skip) = skips.pop() {
                    x = Tensor::cat(vec![x, skip], 1);
                }
            }
            x = block.forward(x);
        }

        if self.tanh_output {
            x.tanh()
        } else {
            x
        }
    }
}
