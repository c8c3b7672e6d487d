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

//! [Denoising diffusion implicit models][ddim] extend the denoising procedure of DDPMs with non-Markovian updates,
//! allowing deterministic sampling (`eta = 0`) in far fewer steps.
//!
//! [ddim]: https://arxiv.org/abs/2010.02502

use std::{iter::Peekable, vec::IntoIter};

use ndarray::{Array4, Ix4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;
use tracing::{debug, trace};

use super::{sampling::last_step, GaussianDiffusion, SampleOptions, SampleStep};
use crate::{sample::ensure_shape, schedulers::extract_map_into_tensor, ConditionedSample, DenoisingModel, DiffusionError};

/// Selects the timestep indices a DDIM loop visits: `steps` indices spread uniformly over `[0, max_index]`, in
/// strictly decreasing order, always ending at 0.
///
/// Indices are truncated like `numpy.linspace(0, max_index, steps, dtype=int)`; duplicates produced when `steps`
/// exceeds `max_index + 1` are removed.
pub fn ddim_timesteps(max_index: usize, steps: usize) -> Vec<usize> {
	let mut indices = match steps {
		0 => return Vec::new(),
		1 => vec![0],
		_ => {
			let step = max_index as f64 / (steps - 1) as f64;
			let mut indices = (0..steps - 1).map(|i| (i as f64 * step) as usize).collect::<Vec<_>>();
			indices.push(max_index);
			indices
		}
	};
	indices.dedup();
	indices.reverse();
	if indices.last() != Some(&0) {
		indices.push(0);
	}
	indices
}

/// The result of [`GaussianDiffusion::ddim_interpolate`].
#[derive(Debug, Clone)]
pub struct InterpolationOutput {
	/// The final step of the DDIM trajectory.
	pub sample: SampleStep,
	/// The blended, noised starting point.
	pub interpolated: ConditionedSample
}

/// A lazy DDIM sampling trajectory over a strictly decreasing list of indices.
///
/// Each step moves from the current index directly to the next visited index (or to a clean sample after index 0).
/// Stopping early has no side effects. An `Err` item ends the trajectory.
pub struct DDIMSampler<'a, M: ?Sized, R: ?Sized> {
	diffusion: &'a GaussianDiffusion,
	model: &'a M,
	options: SampleOptions<'a>,
	rng: &'a mut R,
	current: ConditionedSample,
	indices: Peekable<IntoIter<usize>>,
	failed: bool
}

impl<'a, M: ?Sized, R: ?Sized> DDIMSampler<'a, M, R> {
	/// The indices that have yet to be visited.
	pub fn remaining(&self) -> usize {
		self.indices.len()
	}
}

impl<'a, M, R> Iterator for DDIMSampler<'a, M, R>
where
	M: DenoisingModel + ?Sized,
	R: Rng + ?Sized
{
	type Item = anyhow::Result<SampleStep>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}
		let t = self.indices.next()?;
		let alpha_bar_prev = match self.indices.peek() {
			Some(prev) => self.diffusion.coefficients.alphas_cumprod[*prev],
			None => 1.0
		};
		trace!(timestep = t, alpha_bar_prev, "ddim step");

		let n = self.current.batch_size();
		match self
			.diffusion
			.ddim_transition(self.model, &self.current, &vec![t; n], &vec![alpha_bar_prev; n], &self.options, self.rng)
		{
			Ok(step) => {
				self.current = step.sample.clone();
				Some(Ok(step))
			}
			Err(e) => {
				self.failed = true;
				Some(Err(e))
			}
		}
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		if self.failed { (0, Some(0)) } else { (0, Some(self.indices.len())) }
	}
}

impl GaussianDiffusion {
	/// Samples `x_{t-1}` from the network using DDIM.
	///
	/// With `options.eta == 0` the step is fully deterministic and `rng` is never used.
	pub fn ddim_step<M, R>(
		&self,
		model: &M,
		x: &ConditionedSample,
		timesteps: &[usize],
		options: &SampleOptions<'_>,
		rng: &mut R
	) -> anyhow::Result<SampleStep>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		self.validate_timesteps(timesteps, x.batch_size())?;
		let alpha_bar_prev = timesteps.iter().map(|t| self.coefficients.alphas_cumprod_prev[*t]).collect::<Vec<_>>();
		self.ddim_transition(model, x, timesteps, &alpha_bar_prev, options, rng)
	}

	/// Samples `x_{t+1}` from the network using the reverse DDIM ODE.
	///
	/// # Errors
	/// Fails with [`DiffusionError::NotImplemented`] unless `options.eta` is 0; the reverse ODE is only defined for the
	/// deterministic path.
	pub fn ddim_reverse_step<M>(&self, model: &M, x: &ConditionedSample, timesteps: &[usize], options: &SampleOptions<'_>) -> anyhow::Result<SampleStep>
	where
		M: DenoisingModel + ?Sized
	{
		if options.eta != 0.0 {
			return Err(DiffusionError::NotImplemented(format!("reverse DDIM step with eta = {}", options.eta)).into());
		}
		let prediction = self.predict_step(model, x, timesteps, options)?;
		let x_t = x.target.view();
		let eps = self.eps_from_xstart(x_t, timesteps, prediction.pred_xstart.view());

		let c = &self.coefficients;
		let dim = x.target_dim();
		let target = extract_map_into_tensor(&c.alphas_cumprod_next, timesteps, dim, f64::sqrt) * &prediction.pred_xstart
			+ extract_map_into_tensor(&c.alphas_cumprod_next, timesteps, dim, |a| (1.0 - a).sqrt()) * &eps;

		Ok(SampleStep {
			sample: x.with_target(target),
			pred_xstart: prediction.pred_xstart,
			calibration: prediction.calibration,
			timesteps: timesteps.to_vec()
		})
	}

	/// Creates a lazy DDIM sampling trajectory.
	///
	/// `options.steps` indices are spread over the schedule (see [`ddim_timesteps`]); the full schedule is used if it
	/// is `None`. Requests for more steps than the schedule has are clamped. The starting sample follows the same rules
	/// as [`ancestral_loop_progressive`](Self::ancestral_loop_progressive).
	///
	/// Unlike a single [`ddim_step`](Self::ddim_step), which always targets `alpha_bar[t - 1]`, each transition of a
	/// reduced trajectory targets the `alpha_bar` of the next visited index (1 after the last), so a strided loop still
	/// lands on the marginals of the indices it visits. With the full schedule both coincide.
	pub fn ddim_loop_progressive<'a, M, R>(
		&'a self,
		model: &'a M,
		shape: &[usize],
		noise: Option<ConditionedSample>,
		options: SampleOptions<'a>,
		rng: &'a mut R
	) -> anyhow::Result<DDIMSampler<'a, M, R>>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		let current = self.initial_sample(shape, noise, rng)?;
		let indices = ddim_timesteps(self.num_timesteps() - 1, self.clamp_steps(options.steps));
		Ok(self.ddim_sampler(model, current, indices, options, rng))
	}

	/// Runs the DDIM sampler to completion and returns the final step.
	///
	/// # Errors
	/// Fails with [`DiffusionError::EmptyTrajectory`] if no step was taken (e.g. `options.steps` is 0).
	pub fn ddim_loop<M, R>(
		&self,
		model: &M,
		shape: &[usize],
		noise: Option<ConditionedSample>,
		options: SampleOptions<'_>,
		rng: &mut R
	) -> anyhow::Result<SampleStep>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		last_step(self.ddim_loop_progressive(model, shape, noise, options, rng)?)
	}

	/// Explores the trajectory between two known samples.
	///
	/// Both targets are diffused to the timestep `start` (`T / 2 - 1` if `None`) with the same noise draw and blended
	/// as `lambda * first + (1 - lambda) * second`; conditioning channels are blended the same way. A DDIM loop then
	/// runs from `start` down to 0, with `options.steps` indices (`start + 1` if `None`).
	///
	/// # Errors
	/// - [`DiffusionError::ShapeMismatch`] if the two samples differ in shape
	/// - [`DiffusionError::InvalidTimestep`] if `start` is out of range
	pub fn ddim_interpolate<M, R>(
		&self,
		model: &M,
		first: &ConditionedSample,
		second: &ConditionedSample,
		lambda: f32,
		start: Option<usize>,
		options: SampleOptions<'_>,
		rng: &mut R
	) -> anyhow::Result<InterpolationOutput>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		ensure_shape("interpolation endpoint", &first.full_shape(), &second.full_shape())?;
		let start = start.unwrap_or_else(|| (self.num_timesteps() / 2).saturating_sub(1));
		let timesteps = vec![start; first.batch_size()];
		self.validate_timesteps(&timesteps, first.batch_size())?;

		let noise = Array4::<f32>::random_using(first.target_dim(), StandardNormal, rng);
		let noised_first = self.noised(first.target.view(), &timesteps, noise.view());
		let noised_second = self.noised(second.target.view(), &timesteps, noise.view());
		let interpolated = ConditionedSample::new(
			&first.context * lambda + &second.context * (1.0 - lambda),
			noised_first * lambda + noised_second * (1.0 - lambda)
		)?;

		let steps = options.steps.unwrap_or(start + 1).min(start + 1);
		let indices = ddim_timesteps(start, steps);
		let sample = last_step(self.ddim_sampler(model, interpolated.clone(), indices, options, rng))?;
		Ok(InterpolationOutput { sample, interpolated })
	}

	fn ddim_sampler<'a, M, R>(
		&'a self,
		model: &'a M,
		current: ConditionedSample,
		indices: Vec<usize>,
		options: SampleOptions<'a>,
		rng: &'a mut R
	) -> DDIMSampler<'a, M, R>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		debug!(sampler = "ddim", steps = indices.len(), eta = options.eta, "starting sampling loop");
		DDIMSampler {
			diffusion: self,
			model,
			options,
			rng,
			current,
			indices: indices.into_iter().peekable(),
			failed: false
		}
	}

	/// One DDIM update from `timesteps` toward a state with cumulative signal `alpha_bar_prev`.
	fn ddim_transition<M, R>(
		&self,
		model: &M,
		x: &ConditionedSample,
		timesteps: &[usize],
		alpha_bar_prev: &[f64],
		options: &SampleOptions<'_>,
		rng: &mut R
	) -> anyhow::Result<SampleStep>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		let prediction = self.predict_step(model, x, timesteps, options)?;
		// re-derived rather than taken from the network, so the update holds for every mean parameterization
		let eps = self.eps_from_xstart(x.target.view(), timesteps, prediction.pred_xstart.view());

		let eta = f64::from(options.eta);
		let (mut xstart_coef, mut eps_coef, mut noise_coef) = (Vec::new(), Vec::new(), Vec::new());
		for (t, prev) in timesteps.iter().zip(alpha_bar_prev) {
			let alpha_bar = self.coefficients.alphas_cumprod[*t];
			let sigma = eta * ((1.0 - prev) / (1.0 - alpha_bar)).sqrt() * (1.0 - alpha_bar / prev).sqrt();
			xstart_coef.push(prev.sqrt() as f32);
			eps_coef.push((1.0 - prev - sigma * sigma).max(0.0).sqrt() as f32);
			noise_coef.push(if *t == 0 { 0.0 } else { sigma as f32 });
		}

		let dim = x.target_dim();
		let mut target = per_batch(&xstart_coef, dim) * &prediction.pred_xstart + per_batch(&eps_coef, dim) * &eps;
		if noise_coef.iter().any(|s| *s != 0.0) {
			let noise = Array4::<f32>::random_using(dim, StandardNormal, rng);
			target = target + per_batch(&noise_coef, dim) * &noise;
		}

		Ok(SampleStep {
			sample: x.with_target(target),
			pred_xstart: prediction.pred_xstart,
			calibration: prediction.calibration,
			timesteps: timesteps.to_vec()
		})
	}
}

fn per_batch(values: &[f32], dim: Ix4) -> Array4<f32> {
	Array4::from_shape_fn(dim, |(n, _, _, _)| values[n])
}
