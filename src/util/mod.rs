// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ndarray::{Array1, Array4, ArrayView, ArrayView4, Dimension, Zip};
use num_traits::Float;

pub mod interpolation;
mod resample;

pub use self::resample::UniformSampler;

/// Half-width of one bin of 8-bit data rescaled to `[-1, 1]`.
const BIN_HALF_WIDTH: f32 = 1.0 / 255.0;
/// Floor applied to probabilities before taking their log.
const MIN_PROB: f32 = 1e-12;

/// Takes the mean over all non-batch dimensions.
pub fn mean_flat(x: ArrayView4<'_, f32>) -> Array1<f32> {
	x.outer_iter().map(|e| e.mean().unwrap_or(0.0)).collect()
}

/// KL divergence between two diagonal Gaussians given by their means and log-variances, in nats.
#[inline]
pub fn normal_kl<F: Float>(mean1: F, logvar1: F, mean2: F, logvar2: F) -> F {
	let half = (F::one() + F::one()).recip();
	half * (-F::one() + logvar2 - logvar1 + (logvar1 - logvar2).exp() + (mean1 - mean2).powi(2) * (-logvar2).exp())
}

/// Elementwise [`normal_kl`] over tensors of equal shape.
pub fn normal_kl_tensor(mean1: ArrayView4<'_, f32>, logvar1: ArrayView4<'_, f32>, mean2: ArrayView4<'_, f32>, logvar2: ArrayView4<'_, f32>) -> Array4<f32> {
	let mut kl = Array4::zeros(mean1.raw_dim());
	Zip::from(&mut kl)
		.and(&mean1)
		.and(&logvar1)
		.and(&mean2)
		.and(&logvar2)
		.par_for_each(|kl, m1, lv1, m2, lv2| *kl = normal_kl(*m1, *lv1, *m2, *lv2));
	kl
}

/// A fast approximation of the cumulative distribution function of the standard normal.
#[inline]
pub fn approx_standard_normal_cdf(x: f32) -> f32 {
	0.5 * (1.0 + ((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))).tanh())
}

/// Computes the log-likelihood of a Gaussian discretizing to a given image, where `x` holds target values rescaled
/// from `uint8` to `[-1, 1]` and `log_scales` is the log standard deviation. Returns natural-log values.
///
/// The outermost bins extend to infinity, so values at the edges of the data range take the full tail mass.
pub fn discretized_gaussian_log_likelihood(x: ArrayView4<'_, f32>, means: ArrayView4<'_, f32>, log_scales: ArrayView4<'_, f32>) -> Array4<f32> {
	assert_eq!(x.shape(), means.shape());
	assert_eq!(x.shape(), log_scales.shape());

	let mut log_probs = Array4::zeros(x.raw_dim());
	Zip::from(&mut log_probs).and(&x).and(&means).and(&log_scales).par_for_each(|out, x, mean, log_scale| {
		let centered = x - mean;
		let inv_stdv = (-log_scale).exp();
		let cdf_plus = approx_standard_normal_cdf(inv_stdv * (centered + BIN_HALF_WIDTH));
		let cdf_min = approx_standard_normal_cdf(inv_stdv * (centered - BIN_HALF_WIDTH));
		*out = if *x < -0.999 {
			cdf_plus.max(MIN_PROB).ln()
		} else if *x > 0.999 {
			(1.0 - cdf_min).max(MIN_PROB).ln()
		} else {
			(cdf_plus - cdf_min).max(MIN_PROB).ln()
		};
	});
	log_probs
}

/// Sørensen-Dice overlap of two maps binarized at 0.5. Two empty maps overlap perfectly.
pub fn dice_score<D: Dimension>(a: ArrayView<'_, f32, D>, b: ArrayView<'_, f32, D>) -> f32 {
	let (intersection, total) = Zip::from(&a).and(&b).fold((0.0f32, 0.0f32), |(intersection, total), a, b| {
		let (a, b) = (binarize(*a), binarize(*b));
		(intersection + a * b, total + a + b)
	});
	if total == 0.0 { 1.0 } else { 2.0 * intersection / total }
}

#[inline]
fn binarize(v: f32) -> f32 {
	if v > 0.5 { 1.0 } else { 0.0 }
}

/// Rescales each batch element to `[0, 1]`. Constant elements map to 0.
pub fn normalize_min_max(x: ArrayView4<'_, f32>) -> Array4<f32> {
	let mut out = x.to_owned();
	Zip::from(out.outer_iter_mut()).par_for_each(|mut e| {
		let (min, max) = e.fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), v| (min.min(*v), max.max(*v)));
		let range = max - min;
		if range > 0.0 {
			e.mapv_inplace(|v| (v - min) / range);
		} else {
			e.fill(0.0);
		}
	});
	out
}
