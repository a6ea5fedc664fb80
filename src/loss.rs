use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::prelude::*;

/// Denominator floor for [`mask_l1_loss`]; only reached when the mask is empty.
const MASK_EPSILON: f64 = 1e-8;

/// Which label the adversarial loss pushes the logits toward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Real,
    Fake,
}

/// Binary cross-entropy between discriminator logits and an all-real or all-fake target.
pub fn adversarial_loss<B: Backend>(logits: Tensor<B, 2>, target: Target) -> Tensor<B, 1> {
    let device = logits.device();
    let dims = logits.dims();
    let labels = match target {
        Target::Real => Tensor::<B, 2, Int>::ones(dims, &device),
        Target::Fake => Tensor::<B, 2, Int>::zeros(dims, &device),
    };
    BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device)
        .forward(logits, labels)
}

/// Mean absolute error weighted by `mask`, normalized by the total mask weight.
///
/// Elements where the mask is zero contribute nothing. An all-zero mask yields
/// exactly zero rather than a division by zero.
pub fn mask_l1_loss<B: Backend>(
    predicted: Tensor<B, 4>,
    target: Tensor<B, 4>,
    mask: Tensor<B, 4>,
) -> Tensor<B, 1> {
    debug_assert_eq!(predicted.dims(), target.dims());
    debug_assert_eq!(predicted.dims(), mask.dims());

    let weighted = predicted.sub(target).abs().mul(mask.clone()).sum();
    weighted.div(mask.sum().clamp_min(MASK_EPSILON))
}

/// Mean of the sigmoid of the logits, i.e. the average "real" probability.
pub fn prediction_mean<B: Backend>(logits: Tensor<B, 2>) -> f64 {
    burn::tensor::activation::sigmoid(logits)
        .mean()
        .into_scalar()
        .elem::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
        tensor.into_scalar().elem::<f64>()
    }

    #[test]
    fn mask_l1_is_zero_for_identical_inputs() {
        let device = Default::default();
        let image = Tensor::<TestBackend, 4>::random(
            [2, 3, 4, 4],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let mask = Tensor::<TestBackend, 4>::random(
            [2, 3, 4, 4],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        assert_eq!(scalar(mask_l1_loss(image.clone(), image, mask)), 0.0);
    }

    #[test]
    fn mask_l1_with_empty_mask_is_zero() {
        let device = Default::default();
        let predicted = Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device);
        let target = Tensor::<TestBackend, 4>::zeros([1, 3, 2, 2], &device);
        let mask = Tensor::<TestBackend, 4>::zeros([1, 3, 2, 2], &device);
        let loss = scalar(mask_l1_loss(predicted, target, mask));
        assert!(loss.is_finite());
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn mask_l1_ignores_elements_outside_the_mask() {
        let device = Default::default();
        let predicted = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 5.0, 3.0, 100.0], [1, 1, 2, 2]),
            &device,
        );
        let target = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let mask = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 1.0, 0.0], [1, 1, 2, 2]),
            &device,
        );
        let loss = scalar(mask_l1_loss(predicted, target, mask));
        assert!((loss - 3.0).abs() < 1e-6);
    }

    #[test]
    fn mask_l1_gradient_vanishes_outside_the_mask() {
        let device = Default::default();
        let predicted = Tensor::<TestAutodiffBackend, 4>::ones([1, 1, 1, 2], &device).require_grad();
        let target = Tensor::<TestAutodiffBackend, 4>::zeros([1, 1, 1, 2], &device);
        let mask = Tensor::<TestAutodiffBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 0.0], [1, 1, 1, 2]),
            &device,
        );
        let grads = mask_l1_loss(predicted.clone(), target, mask).backward();
        let grad = predicted.grad(&grads).unwrap().to_data().to_vec::<f32>().unwrap();
        assert_eq!(grad, vec![1.0, 0.0]);
    }

    #[test]
    fn adversarial_loss_prefers_matching_logits() {
        let device = Default::default();
        let confident_real = Tensor::<TestBackend, 2>::ones([4, 1], &device).mul_scalar(5.0);
        let real = scalar(adversarial_loss(confident_real.clone(), Target::Real));
        let fake = scalar(adversarial_loss(confident_real, Target::Fake));
        assert!(real.is_finite() && fake.is_finite());
        assert!(real < fake);
    }

    #[test]
    fn prediction_mean_of_zero_logits_is_one_half() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([3, 1], &device);
        assert!((prediction_mean(logits) - 0.5).abs() < 1e-6);
    }
}
