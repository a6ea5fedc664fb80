use crate::engine::SampleProvider;
use anyhow::Result;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::DataLoader;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;

/// One batch of (condition, target) pairs.
///
/// Tensors are laid out as `[batch, channels, height, width]`. Path fields stay
/// on the host and are carried through untouched.
#[derive(Clone, Debug)]
pub struct PoseBatch<B: Backend> {
    pub condition_image: Tensor<B, 4>,
    /// Pose map of the target person, one channel per keypoint.
    pub condition_pose: Tensor<B, 4>,
    pub target_image: Tensor<B, 4>,
    pub target_mask: Tensor<B, 4>,
    pub target_image_2: Tensor<B, 4>,
    pub path_condition: Vec<String>,
    pub path_target: Vec<String>,
}

impl<B: Backend> PoseBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.condition_image.dims()[0]
    }

    /// Check that every tensor shares the same leading batch dimension.
    pub fn validate(&self) -> Result<()> {
        let batch_size = self.batch_size();
        let tensors = [
            ("condition_pose", self.condition_pose.dims()[0]),
            ("target_image", self.target_image.dims()[0]),
            ("target_mask", self.target_mask.dims()[0]),
            ("target_image_2", self.target_image_2.dims()[0]),
        ];
        for (name, size) in tensors {
            if size != batch_size {
                return Err(anyhow::anyhow!(
                    "{name} has batch dimension {size}, expected {batch_size} (condition {:?})",
                    self.path_condition
                ));
            }
        }
        if self.target_mask.dims() != self.target_image.dims() {
            return Err(anyhow::anyhow!(
                "target_mask shape {:?} does not match target_image shape {:?}",
                self.target_mask.dims(),
                self.target_image.dims()
            ));
        }
        Ok(())
    }
}

impl<B: AutodiffBackend> PoseBatch<B> {
    /// The same batch on the non-differentiable inner backend.
    pub fn inner(&self) -> PoseBatch<B::InnerBackend> {
        PoseBatch {
            condition_image: self.condition_image.clone().inner(),
            condition_pose: self.condition_pose.clone().inner(),
            target_image: self.target_image.clone().inner(),
            target_mask: self.target_mask.clone().inner(),
            target_image_2: self.target_image_2.clone().inner(),
            path_condition: self.path_condition.clone(),
            path_target: self.path_target.clone(),
        }
    }
}

/// A single decoded example, `[channels, height, width]` per field.
#[derive(Clone, Debug)]
pub struct PoseSample {
    pub condition_image: TensorData,
    pub condition_pose: TensorData,
    pub target_image: TensorData,
    pub target_mask: TensorData,
    pub target_image_2: TensorData,
    pub path_condition: String,
    pub path_target: String,
}

/// Stacks [`PoseSample`]s into a [`PoseBatch`] for burn's data loader.
#[derive(Clone, Debug, Default)]
pub struct PoseBatcher;

impl<B: Backend> Batcher<B, PoseSample, PoseBatch<B>> for PoseBatcher {
    fn batch(&self, items: Vec<PoseSample>, device: &B::Device) -> PoseBatch<B> {
        let stack = |field: fn(&PoseSample) -> TensorData| -> Tensor<B, 4> {
            let tensors = items
                .iter()
                .map(|item| Tensor::<B, 3>::from_data(field(item), device))
                .collect();
            Tensor::stack(tensors, 0)
        };

        PoseBatch {
            condition_image: stack(|item| item.condition_image.clone()),
            condition_pose: stack(|item| item.condition_pose.clone()),
            target_image: stack(|item| item.target_image.clone()),
            target_mask: stack(|item| item.target_mask.clone()),
            target_image_2: stack(|item| item.target_image_2.clone()),
            path_condition: items.iter().map(|item| item.path_condition.clone()).collect(),
            path_target: items.iter().map(|item| item.path_target.clone()).collect(),
        }
    }
}

/// Each epoch takes a fresh iterator from the loader, which reshuffles when
/// the loader was built with `shuffle`.
impl<B: Backend, O: 'static> SampleProvider for Arc<dyn DataLoader<B, O>> {
    type Item = O;

    fn epoch(&mut self) -> Result<Box<dyn Iterator<Item = Result<O>> + '_>> {
        Ok(Box::new(self.iter().map(Ok)))
    }
}

/// Serves a fixed list of batches, optionally reshuffled every epoch.
#[derive(Clone, Debug)]
pub struct InMemoryProvider<T> {
    items: Vec<T>,
    order: Vec<usize>,
    rng: Option<StdRng>,
}

impl<T: Clone> InMemoryProvider<T> {
    pub fn new(items: Vec<T>) -> Self {
        let order = (0..items.len()).collect();
        Self {
            items,
            order,
            rng: None,
        }
    }

    pub fn shuffled(items: Vec<T>, seed: u64) -> Self {
        let mut provider = Self::new(items);
        provider.rng = Some(StdRng::seed_from_u64(seed));
        provider
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone> SampleProvider for InMemoryProvider<T> {
    type Item = T;

    fn epoch(&mut self) -> Result<Box<dyn Iterator<Item = Result<T>> + '_>> {
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
        let items = &self.items;
        Ok(Box::new(self.order.iter().map(move |&idx| Ok(items[idx].clone()))))
    }
}
