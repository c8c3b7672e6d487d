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

use ndarray::{Array4, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

use super::GaussianDiffusion;
use crate::{
	sample::ensure_shape,
	schedulers::{extract_into_tensor, extract_map_into_tensor}
};

/// A diagonal Gaussian over a target channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Marginal {
	/// Per-element mean.
	pub mean: Array4<f32>,
	/// Per-element variance.
	pub variance: Array4<f32>,
	/// Clipped where the variance is degenerate, so always finite.
	pub log_variance: Array4<f32>
}

impl GaussianDiffusion {
	/// Gets the distribution `q(x_t | x_0)`.
	///
	/// # Errors
	/// Fails with [`DiffusionError::InvalidTimestep`](crate::DiffusionError::InvalidTimestep) or
	/// [`DiffusionError::ShapeMismatch`](crate::DiffusionError::ShapeMismatch) for an invalid timestep batch.
	pub fn forward_marginal(&self, x_start: ArrayView4<'_, f32>, timesteps: &[usize]) -> anyhow::Result<Marginal> {
		self.validate_timesteps(timesteps, x_start.dim().0)?;
		let c = &self.coefficients;
		let dim = x_start.raw_dim();
		Ok(Marginal {
			mean: extract_into_tensor(&c.sqrt_alphas_cumprod, timesteps, dim) * &x_start,
			variance: extract_map_into_tensor(&c.alphas_cumprod, timesteps, dim, |a| 1.0 - a),
			log_variance: extract_into_tensor(&c.log_one_minus_alphas_cumprod, timesteps, dim)
		})
	}

	/// Diffuses `x_start` for the given number of steps, i.e. draws a sample from `q(x_t | x_0)`.
	///
	/// If `noise` is `None`, standard Gaussian noise is drawn from `rng`.
	///
	/// # Errors
	/// Fails with [`DiffusionError::ShapeMismatch`](crate::DiffusionError::ShapeMismatch) if `noise` does not have
	/// exactly the shape of `x_start`.
	pub fn forward_sample<R: Rng + ?Sized>(
		&self,
		x_start: ArrayView4<'_, f32>,
		timesteps: &[usize],
		noise: Option<ArrayView4<'_, f32>>,
		rng: &mut R
	) -> anyhow::Result<Array4<f32>> {
		self.validate_timesteps(timesteps, x_start.dim().0)?;
		let noise = match noise {
			Some(noise) => {
				ensure_shape("noise", x_start.shape(), noise.shape())?;
				noise.to_owned()
			}
			None => Array4::random_using(x_start.raw_dim(), StandardNormal, rng)
		};
		Ok(self.noised(x_start, timesteps, noise.view()))
	}

	/// Gets the true posterior `q(x_{t-1} | x_t, x_0)`.
	///
	/// # Errors
	/// Fails with [`DiffusionError::ShapeMismatch`](crate::DiffusionError::ShapeMismatch) if `x_t` and `x_start`
	/// differ in shape, or for an invalid timestep batch.
	pub fn true_posterior(&self, x_start: ArrayView4<'_, f32>, x_t: ArrayView4<'_, f32>, timesteps: &[usize]) -> anyhow::Result<Marginal> {
		ensure_shape("x_t", x_start.shape(), x_t.shape())?;
		self.validate_timesteps(timesteps, x_start.dim().0)?;
		Ok(self.posterior(x_start, x_t, timesteps))
	}

	/// Recovers `x_0` from `x_t` and a noise prediction.
	///
	/// # Errors
	/// Fails with [`DiffusionError::ShapeMismatch`](crate::DiffusionError::ShapeMismatch) if `eps` and `x_t` differ in
	/// shape, or for an invalid timestep batch.
	pub fn predict_xstart_from_eps(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], eps: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		ensure_shape("eps", x_t.shape(), eps.shape())?;
		self.validate_timesteps(timesteps, x_t.dim().0)?;
		Ok(self.xstart_from_eps(x_t, timesteps, eps))
	}

	/// Re-derives the noise implied by `x_t` and a clean-target estimate. Inverse of
	/// [`predict_xstart_from_eps`](Self::predict_xstart_from_eps).
	///
	/// # Errors
	/// Fails with [`DiffusionError::ShapeMismatch`](crate::DiffusionError::ShapeMismatch) if `pred_xstart` and `x_t`
	/// differ in shape, or for an invalid timestep batch.
	pub fn predict_eps_from_xstart(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], pred_xstart: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		ensure_shape("clean-target estimate", x_t.shape(), pred_xstart.shape())?;
		self.validate_timesteps(timesteps, x_t.dim().0)?;
		Ok(self.eps_from_xstart(x_t, timesteps, pred_xstart))
	}

	pub(crate) fn xstart_from_eps(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], eps: ArrayView4<'_, f32>) -> Array4<f32> {
		let c = &self.coefficients;
		let dim = x_t.raw_dim();
		extract_into_tensor(&c.sqrt_recip_alphas_cumprod, timesteps, dim) * &x_t
			- extract_into_tensor(&c.sqrt_recipm1_alphas_cumprod, timesteps, dim) * &eps
	}

	pub(crate) fn eps_from_xstart(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], pred_xstart: ArrayView4<'_, f32>) -> Array4<f32> {
		let c = &self.coefficients;
		let dim = x_t.raw_dim();
		(extract_into_tensor(&c.sqrt_recip_alphas_cumprod, timesteps, dim) * &x_t - &pred_xstart)
			/ extract_into_tensor(&c.sqrt_recipm1_alphas_cumprod, timesteps, dim)
	}

	/// Recovers `x_0` from `x_t` and a prediction of `x_{t-1}` by inverting the posterior mean.
	pub(crate) fn predict_xstart_from_xprev(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], xprev: ArrayView4<'_, f32>) -> Array4<f32> {
		let c = &self.coefficients;
		let dim = x_t.raw_dim();
		extract_map_into_tensor(&c.posterior_mean_coef1, timesteps, dim, f64::recip) * &xprev
			- extract_into_tensor(&(&c.posterior_mean_coef2 / &c.posterior_mean_coef1), timesteps, dim) * &x_t
	}

	pub(crate) fn noised(&self, x_start: ArrayView4<'_, f32>, timesteps: &[usize], noise: ArrayView4<'_, f32>) -> Array4<f32> {
		let c = &self.coefficients;
		let dim = x_start.raw_dim();
		extract_into_tensor(&c.sqrt_alphas_cumprod, timesteps, dim) * &x_start
			+ extract_into_tensor(&c.sqrt_one_minus_alphas_cumprod, timesteps, dim) * &noise
	}

	pub(crate) fn posterior_mean(&self, x_start: ArrayView4<'_, f32>, x_t: ArrayView4<'_, f32>, timesteps: &[usize]) -> Array4<f32> {
		let c = &self.coefficients;
		let dim = x_t.raw_dim();
		extract_into_tensor(&c.posterior_mean_coef1, timesteps, dim) * &x_start
			+ extract_into_tensor(&c.posterior_mean_coef2, timesteps, dim) * &x_t
	}

	pub(crate) fn posterior(&self, x_start: ArrayView4<'_, f32>, x_t: ArrayView4<'_, f32>, timesteps: &[usize]) -> Marginal {
		let c = &self.coefficients;
		let dim = x_t.raw_dim();
		Marginal {
			mean: self.posterior_mean(x_start, x_t, timesteps),
			variance: extract_into_tensor(&c.posterior_variance, timesteps, dim),
			log_variance: extract_into_tensor(&c.posterior_log_variance_clipped, timesteps, dim)
		}
	}
}
