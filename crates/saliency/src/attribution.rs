//! Attribution methods: given a classifier, one input volume and a target
//! class, produce a per-voxel importance map.

use crate::SaliencyError;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use models::FusionClassifier;

/// Per-voxel importance for one sample.
///
/// `input` is `[1, D, H, W]`, already normalized. The returned map must be
/// `[D, H, W]`; the runner rejects anything else.
pub trait Attribution<B: Backend> {
    fn name(&self) -> &'static str;

    fn attribute(
        &mut self,
        model: &FusionClassifier<B>,
        input: Tensor<B, 4>,
        target: usize,
    ) -> Result<Tensor<B, 3>, SaliencyError>;
}

/// Vanilla gradient saliency: `|d logit[target] / d input|`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientSaliency {
    /// Keep the signed gradient instead of its magnitude.
    pub signed: bool,
}

impl GradientSaliency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }
}

impl<B: AutodiffBackend> Attribution<B> for GradientSaliency {
    fn name(&self) -> &'static str {
        "gradient"
    }

    fn attribute(
        &mut self,
        model: &FusionClassifier<B>,
        input: Tensor<B, 4>,
        target: usize,
    ) -> Result<Tensor<B, 3>, SaliencyError> {
        let [n, d, h, w] = input.dims();
        if n != 1 {
            return Err(SaliencyError::Attribution(format!(
                "expected a single-sample input, got batch of {n}"
            )));
        }
        let classes = model.num_classes();
        if target >= classes {
            return Err(SaliencyError::TargetOutOfRange { target, classes });
        }
        let input = input.require_grad();
        let logits = model.forward_volume(input.clone());
        let score = logits.slice([0..1, target..target + 1]).sum();
        let grads = score.backward();
        let grad = input
            .grad(&grads)
            .ok_or_else(|| SaliencyError::Attribution("input received no gradient".into()))?;
        let grad = if self.signed { grad } else { grad.abs() };
        Ok(Tensor::from_inner(grad.reshape([d, h, w])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;
    use models::{ClassificationHeadConfig, FusionEncoderConfig};

    type B = Autodiff<NdArray<f32>>;

    fn model() -> FusionClassifier<B> {
        FusionClassifier::new(
            FusionEncoderConfig::tiny(),
            ClassificationHeadConfig {
                num_classes: 3,
                ..Default::default()
            },
            &Default::default(),
        )
    }

    #[test]
    fn gradient_map_matches_input_shape() {
        let input = Tensor::<B, 4>::random([1, 4, 6, 5], Distribution::Normal(0.0, 1.0), &Default::default());
        let map = GradientSaliency::new()
            .attribute(&model(), input, 1)
            .unwrap();
        assert_eq!(map.dims(), [4, 6, 5]);
        let values = map.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(values.iter().any(|v| *v > 0.0));
    }

    #[test]
    fn out_of_range_target_is_rejected() {
        let input = Tensor::<B, 4>::zeros([1, 4, 4, 4], &Default::default());
        let err = GradientSaliency::new().attribute(&model(), input, 3);
        assert!(matches!(
            err,
            Err(SaliencyError::TargetOutOfRange { target: 3, classes: 3 })
        ));
    }
}
