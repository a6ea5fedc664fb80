use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu};

/// Strided 4x4 convolution that halves the spatial size.
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B>>,
}

impl<B: Backend> DownBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, norm: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [4, 4])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(!norm)
            .init(device);
        let norm = norm.then(|| BatchNormConfig::new(out_channels).init(device));
        Self { conv, norm }
    }

    /// conv -> (batch norm) -> leaky relu.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.conv.forward(x);
        if let Some(norm) = &self.norm {
            x = norm.forward(x);
        }
        leaky_relu(x, 0.2)
    }
}

/// Strided 4x4 transposed convolution that doubles the spatial size.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: Option<BatchNorm<B>>,
}

impl<B: Backend> UpBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, norm: bool, device: &B::Device) -> Self {
        let conv = ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .with_bias(!norm)
            .init(device);
        let norm = norm.then(|| BatchNormConfig::new(out_channels).init(device));
        Self { conv, norm }
    }

    /// relu -> transposed conv -> (batch norm).
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(relu(x));
        match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        }
    }
}
