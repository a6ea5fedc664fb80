use crate::model::layers::DownBlock;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Configuration for the conditioned-pair discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub input_channels: usize,
    pub discriminator_dim: usize,
    #[config(default = 4)]
    pub depth: usize,
}

/// Real/fake classifier over channel-concatenated (condition, candidate) pairs.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<DownBlock<B>>,
    fc_adv: Linear<B>,
}

impl DiscriminatorConfig {
    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let depth = self.depth.max(1);
        let mut convs = Vec::with_capacity(depth);
        let mut in_channels = self.input_channels;
        let mut out_channels = self.discriminator_dim;
        for idx in 0..depth {
            convs.push(DownBlock::new(in_channels, out_channels, idx != 0, device));
            in_channels = out_channels;
            out_channels = (out_channels * 2).min(self.discriminator_dim * 8);
        }
        let fc_adv = LinearConfig::new(in_channels, 1).init(device);

        Discriminator { convs, fc_adv }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Forward pass returning adversarial logits of shape `[batch, 1]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.convs {
            x = conv.forward(x);
        }

        // Global average pooling keeps the head independent of the input size.
        let [batch, channels, _, _] = x.dims();
        let pooled = x.mean_dims(&[2, 3]).reshape([batch, channels]);
        self.fc_adv.forward(pooled)
    }
}
