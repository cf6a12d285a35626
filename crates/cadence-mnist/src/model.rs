//! One-layer linear classifier.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap};

use crate::data::NUM_CLASSES;

/// Scales pixels to `[0, 1]`, flattens each image and applies a dense layer
/// with one output per class.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    dense: Linear,
    in_features: usize,
}

impl LinearClassifier {
    /// Creates (or fetches) the parameters under `dense.*` in `vb`.
    pub fn new(vb: VarBuilder, in_features: usize) -> Result<Self> {
        let dense = candle_nn::linear(in_features, NUM_CLASSES, vb.pp("dense"))?;
        Ok(Self { dense, in_features })
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Overwrites the parameters in `varmap` with a seeded LeCun-uniform
    /// weight and a zero bias, so runs with the same seed start identically.
    pub fn reseed(varmap: &mut VarMap, in_features: usize, seed: u64, device: &Device) -> Result<()> {
        let bound = (3.0 / in_features as f32).sqrt();
        let mut rng = oorandom::Rand32::new(seed);
        let weight: Vec<f32> = (0..NUM_CLASSES * in_features)
            .map(|_| (rng.rand_float() * 2.0 - 1.0) * bound)
            .collect();
        let weight = Tensor::from_vec(weight, (NUM_CLASSES, in_features), device)?;
        let bias = Tensor::zeros(NUM_CLASSES, DType::F32, device)?;
        varmap.set_one("dense.weight", weight)?;
        varmap.set_one("dense.bias", bias)?;
        Ok(())
    }
}

impl Module for LinearClassifier {
    /// `images`: `[batch, rows, cols, 1]` of any dtype with values in `0..=255`.
    /// Returns logits `[batch, 10]`.
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let xs = images.to_dtype(DType::F32)?.affine(1.0 / 255.0, 0.0)?;
        let xs = xs.flatten_from(1)?;
        self.dense.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(seed: u64) -> (VarMap, LinearClassifier) {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = LinearClassifier::new(vb, 4).unwrap();
        LinearClassifier::reseed(&mut varmap, 4, seed, &device).unwrap();
        (varmap, model)
    }

    #[test]
    fn forward_produces_class_logits() {
        let (_varmap, model) = build(0);
        let images = Tensor::from_vec(vec![0u8, 255, 128, 64, 1, 2, 3, 4], (2, 2, 2, 1), &Device::Cpu)
            .unwrap();
        let logits = model.forward(&images).unwrap();
        assert_eq!(logits.dims(), &[2, NUM_CLASSES]);
    }

    #[test]
    fn reseed_is_deterministic() {
        let (a, _) = build(42);
        let (b, _) = build(42);
        let (c, _) = build(43);
        let weight = |vm: &VarMap| -> Vec<f32> {
            vm.data().lock().unwrap()["dense.weight"]
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        assert_eq!(weight(&a), weight(&b));
        assert_ne!(weight(&a), weight(&c));
        let bound = (3.0f32 / 4.0).sqrt();
        assert!(weight(&a).iter().all(|w| w.abs() <= bound));
    }

    #[test]
    fn zero_bias_and_black_image_give_zero_logits() {
        let (_varmap, model) = build(1);
        let images = Tensor::zeros((1, 2, 2, 1), DType::U8, &Device::Cpu).unwrap();
        let logits: Vec<f32> = model.forward(&images).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(logits.iter().all(|&l| l == 0.0));
    }
}
