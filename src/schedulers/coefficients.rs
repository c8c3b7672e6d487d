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

use ndarray::{concatenate, s, Array1, Array4, ArrayView1, Axis, Ix4};

use super::validate_betas;
use crate::DiffusionError;

/// Every per-timestep array derived from a beta schedule.
///
/// Built once, never mutated, and safe to share between concurrently running samplers. All arrays are stored in
/// `f64`; the cumulative product underflows in `f32` for long schedules.
#[derive(Debug, Clone)]
pub struct DiffusionCoefficients {
	pub(crate) betas: Array1<f64>,
	pub(crate) log_betas: Array1<f64>,
	pub(crate) alphas_cumprod: Array1<f64>,
	pub(crate) alphas_cumprod_prev: Array1<f64>,
	pub(crate) alphas_cumprod_next: Array1<f64>,
	pub(crate) sqrt_alphas_cumprod: Array1<f64>,
	pub(crate) sqrt_one_minus_alphas_cumprod: Array1<f64>,
	pub(crate) log_one_minus_alphas_cumprod: Array1<f64>,
	pub(crate) sqrt_recip_alphas_cumprod: Array1<f64>,
	pub(crate) sqrt_recipm1_alphas_cumprod: Array1<f64>,
	pub(crate) posterior_variance: Array1<f64>,
	pub(crate) posterior_log_variance_clipped: Array1<f64>,
	pub(crate) posterior_mean_coef1: Array1<f64>,
	pub(crate) posterior_mean_coef2: Array1<f64>,
	pub(crate) large_variance: Array1<f64>,
	pub(crate) large_log_variance: Array1<f64>
}

impl DiffusionCoefficients {
	/// Precomputes all coefficients from a beta schedule.
	///
	/// # Errors
	/// Fails with [`DiffusionError::InvalidSchedule`] if `betas` is empty or contains values outside of `(0, 1)`.
	pub fn new(betas: Array1<f64>) -> Result<Self, DiffusionError> {
		validate_betas(&betas)?;

		let alphas = 1.0 - &betas;
		let alphas_cumprod = alphas
			.iter()
			.scan(1.0, |prod, alpha| {
				*prod *= *alpha;
				Some(*prod)
			})
			.collect::<Array1<f64>>();

		let alphas_cumprod_prev = concatenate![Axis(0), Array1::ones(1), alphas_cumprod.slice(s![..-1])];
		let alphas_cumprod_next = concatenate![Axis(0), alphas_cumprod.slice(s![1..]), Array1::zeros(1)];

		let sqrt_alphas_cumprod = alphas_cumprod.mapv(f64::sqrt);
		let sqrt_one_minus_alphas_cumprod = alphas_cumprod.mapv(|a| (1.0 - a).sqrt());
		let log_one_minus_alphas_cumprod = alphas_cumprod.mapv(|a| (1.0 - a).ln());
		let sqrt_recip_alphas_cumprod = alphas_cumprod.mapv(|a| (1.0 / a).sqrt());
		let sqrt_recipm1_alphas_cumprod = alphas_cumprod.mapv(|a| (1.0 / a - 1.0).sqrt());

		// q(x_{t-1} | x_t, x_0)
		let posterior_variance = &betas * &(1.0 - &alphas_cumprod_prev) / &(1.0 - &alphas_cumprod);
		// the posterior variance is 0 at the start of the chain; a single-step schedule has nothing to borrow from
		let first_variance = posterior_variance.get(1).copied().unwrap_or(betas[0]);
		let mut clipped_variance = posterior_variance.clone();
		clipped_variance[0] = first_variance;
		let posterior_log_variance_clipped = clipped_variance.mapv(f64::ln);
		let posterior_mean_coef1 = &betas * &alphas_cumprod_prev.mapv(f64::sqrt) / &(1.0 - &alphas_cumprod);
		let posterior_mean_coef2 = &(1.0 - &alphas_cumprod_prev) * &alphas.mapv(f64::sqrt) / &(1.0 - &alphas_cumprod);

		// the fixed-large variance replaces the first beta with the posterior variance for a better decoder likelihood
		let mut large_variance = betas.clone();
		large_variance[0] = first_variance;
		let large_log_variance = large_variance.mapv(f64::ln);

		Ok(Self {
			log_betas: betas.mapv(f64::ln),
			betas,
			alphas_cumprod,
			alphas_cumprod_prev,
			alphas_cumprod_next,
			sqrt_alphas_cumprod,
			sqrt_one_minus_alphas_cumprod,
			log_one_minus_alphas_cumprod,
			sqrt_recip_alphas_cumprod,
			sqrt_recipm1_alphas_cumprod,
			posterior_variance,
			posterior_log_variance_clipped,
			posterior_mean_coef1,
			posterior_mean_coef2,
			large_variance,
			large_log_variance
		})
	}

	/// The number of diffusion steps `T`.
	#[inline]
	pub fn num_timesteps(&self) -> usize {
		self.betas.len()
	}

	/// The noise schedule itself.
	pub fn betas(&self) -> ArrayView1<'_, f64> {
		self.betas.view()
	}

	/// The cumulative product of `1 - beta` (`alpha_bar`).
	pub fn alphas_cumprod(&self) -> ArrayView1<'_, f64> {
		self.alphas_cumprod.view()
	}

	/// `alpha_bar` shifted right by one, with `1.0` at `t = 0`.
	pub fn alphas_cumprod_prev(&self) -> ArrayView1<'_, f64> {
		self.alphas_cumprod_prev.view()
	}

	/// `alpha_bar` shifted left by one, with `0.0` at `t = T - 1`.
	pub fn alphas_cumprod_next(&self) -> ArrayView1<'_, f64> {
		self.alphas_cumprod_next.view()
	}

	/// The true posterior variance. The first entry is 0.
	pub fn posterior_variance(&self) -> ArrayView1<'_, f64> {
		self.posterior_variance.view()
	}

	/// The log of the posterior variance, with the degenerate first entry replaced by the second.
	pub fn posterior_log_variance_clipped(&self) -> ArrayView1<'_, f64> {
		self.posterior_log_variance_clipped.view()
	}

	/// Coefficient of `x_0` in the posterior mean.
	pub fn posterior_mean_coef1(&self) -> ArrayView1<'_, f64> {
		self.posterior_mean_coef1.view()
	}

	/// Coefficient of `x_t` in the posterior mean.
	pub fn posterior_mean_coef2(&self) -> ArrayView1<'_, f64> {
		self.posterior_mean_coef2.view()
	}
}

/// Extracts values from a per-timestep table for a batch of indices, repeating each batch element's scalar across
/// every non-batch dimension of `shape`.
///
/// # Panics
/// Panics if `timesteps.len()` differs from the batch dimension of `shape`, or an index is out of bounds. Callers
/// validate timesteps before reaching this point.
pub(crate) fn extract_into_tensor(table: &Array1<f64>, timesteps: &[usize], shape: Ix4) -> Array4<f32> {
	assert_eq!(timesteps.len(), shape[0], "timestep batch does not match tensor batch");
	Array4::from_shape_fn(shape, |(n, _, _, _)| table[timesteps[n]] as f32)
}

/// Same as [`extract_into_tensor`], but applies `f` to the looked-up value first.
pub(crate) fn extract_map_into_tensor<F>(table: &Array1<f64>, timesteps: &[usize], shape: Ix4, f: F) -> Array4<f32>
where
	F: Fn(f64) -> f64
{
	assert_eq!(timesteps.len(), shape[0], "timestep batch does not match tensor batch");
	let values = timesteps.iter().map(|t| f(table[*t]) as f32).collect::<Vec<_>>();
	Array4::from_shape_fn(shape, |(n, _, _, _)| values[n])
}

#[cfg(test)]
mod tests {
	use ndarray::Dim;

	use super::*;
	use crate::get_named_beta_schedule;

	#[test]
	fn alpha_bar_strictly_decreases() {
		for name in ["linear", "cosine"] {
			for steps in [2, 4, 100, 1000] {
				let c = DiffusionCoefficients::new(get_named_beta_schedule(name, steps).unwrap()).unwrap();
				for w in c.alphas_cumprod.windows(2) {
					assert!(w[1] < w[0], "{name}/{steps}");
				}
				assert!(c.alphas_cumprod[steps - 1] > 0.0);
			}
		}
	}

	#[test]
	fn shifted_tables_have_boundary_values() {
		let c = DiffusionCoefficients::new(get_named_beta_schedule("linear", 10).unwrap()).unwrap();
		assert_eq!(c.alphas_cumprod_prev[0], 1.0);
		assert_eq!(c.alphas_cumprod_next[9], 0.0);
		assert_eq!(c.alphas_cumprod_prev[5], c.alphas_cumprod[4]);
		assert_eq!(c.alphas_cumprod_next[5], c.alphas_cumprod[6]);
	}

	#[test]
	fn first_posterior_variance_is_clipped() {
		let c = DiffusionCoefficients::new(get_named_beta_schedule("linear", 1000).unwrap()).unwrap();
		assert_eq!(c.posterior_variance[0], 0.0);
		assert!(c.posterior_log_variance_clipped[0].is_finite());
		assert_eq!(c.posterior_log_variance_clipped[0], c.posterior_variance[1].ln());
		assert_eq!(c.large_variance[0], c.posterior_variance[1]);
		assert_eq!(c.large_variance[10], c.betas[10]);
	}

	#[test]
	fn single_step_schedule_has_finite_logs() {
		let c = DiffusionCoefficients::new(Array1::from(vec![0.5])).unwrap();
		assert!(c.posterior_log_variance_clipped[0].is_finite());
		assert!(c.large_log_variance[0].is_finite());
	}

	#[test]
	fn extract_repeats_per_batch_element() {
		let table = Array1::from(vec![0.0, 1.0, 2.0]);
		let out = extract_into_tensor(&table, &[2, 0], Dim([2, 1, 2, 3]));
		assert!(out.slice(s![0, .., .., ..]).iter().all(|v| *v == 2.0));
		assert!(out.slice(s![1, .., .., ..]).iter().all(|v| *v == 0.0));
	}
}
