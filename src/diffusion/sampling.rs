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

use std::{fmt, iter::Rev, ops::Range};

use anyhow::Context;
use ndarray::{concatenate, s, Array1, Array4, ArrayView4, Axis, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;
use tracing::{debug, trace, warn};

use super::GaussianDiffusion;
use crate::{
	sample::{ensure_shape, validate_shape},
	util::{dice_score, normalize_min_max},
	ConditionedSample, DenoisedFn, DenoisingModel, DiffusionError, ExternalSolver, Guidance, ModelOutput, NoisePredictorFn, SolverOutput
};

/// Calibration maps agreeing less than this (by Dice score) with the sampled target are only nudged toward it.
const BLEND_DICE_THRESHOLD: f32 = 0.65;

/// Options shared by every sampler.
///
/// ```ignore
/// let options = SampleOptions::default().with_steps(50).with_eta(0.0).with_clip_denoised(true);
/// ```
#[derive(Clone, Copy)]
pub struct SampleOptions<'a> {
	/// Clamp clean-target estimates to `[-1, 1]`. Defaults to `true`.
	pub clip_denoised: bool,
	/// Applied to every clean-target estimate before it is clamped.
	pub denoised_fn: Option<&'a DenoisedFn<'a>>,
	/// Guidance applied at every step.
	pub guidance: Option<Guidance<'a>>,
	/// The number of steps to take. `None` uses the full schedule.
	pub steps: Option<usize>,
	/// DDIM noise-mixing parameter in `[0, 1]`; 0 is fully deterministic. Ignored by the ancestral sampler.
	pub eta: f32
}

impl Default for SampleOptions<'_> {
	fn default() -> Self {
		Self {
			clip_denoised: true,
			denoised_fn: None,
			guidance: None,
			steps: None,
			eta: 0.0
		}
	}
}

impl fmt::Debug for SampleOptions<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SampleOptions")
			.field("clip_denoised", &self.clip_denoised)
			.field("denoised_fn", &self.denoised_fn.map(|_| "<fn>"))
			.field("guidance", &self.guidance)
			.field("steps", &self.steps)
			.field("eta", &self.eta)
			.finish()
	}
}

impl<'a> SampleOptions<'a> {
	/// Whether to clamp clean-target estimates to `[-1, 1]`.
	pub fn with_clip_denoised(mut self, clip_denoised: bool) -> Self {
		self.clip_denoised = clip_denoised;
		self
	}
	/// Set a transform applied to every clean-target estimate before it is clamped.
	pub fn with_denoised_fn(mut self, denoised_fn: &'a DenoisedFn<'a>) -> Self {
		self.denoised_fn = Some(denoised_fn);
		self
	}
	/// Steer sampling with a guidance function.
	pub fn with_guidance(mut self, guidance: Guidance<'a>) -> Self {
		self.guidance = Some(guidance);
		self
	}
	/// The number of steps to take. For the ancestral sampler, sampling starts at index `steps - 1`; for DDIM, `steps`
	/// indices are spread uniformly over the schedule.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = Some(steps);
		self
	}
	/// Set the DDIM noise-mixing parameter.
	pub fn with_eta(mut self, eta: f32) -> Self {
		self.eta = eta;
		self
	}
}

/// One transition of a sampler.
#[derive(Debug, Clone)]
pub struct SampleStep {
	/// The sample after this step; conditioning channels are carried through unchanged.
	pub sample: ConditionedSample,
	/// The clean-target estimate this step was derived from.
	pub pred_xstart: Array4<f32>,
	/// The network's calibration map at this step, if it produces one.
	pub calibration: Option<Array4<f32>>,
	/// The timesteps this step started from, one per batch element.
	pub timesteps: Vec<usize>
}

/// Which loop [`GaussianDiffusion::sample_known`] runs when no external solver is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KnownSampler {
	/// Ancestral sampling over `steps` indices.
	#[default]
	Ancestral,
	/// DDIM sampling with `steps` indices spread over the schedule.
	Ddim
}

/// The result of [`GaussianDiffusion::sample_known`].
#[derive(Debug, Clone)]
pub struct KnownSampleOutput {
	/// The final sample.
	pub sample: ConditionedSample,
	/// The starting point: the input's conditioning channels with a freshly drawn noise target.
	pub initial: ConditionedSample,
	/// The network's calibration map from the last step, or zeros if it produces none.
	pub calibration: Array4<f32>,
	/// The calibration map blended with the sampled target; see [`blend_calibration`].
	pub blended_calibration: Array4<f32>
}

/// A lazy ancestral sampling trajectory. Yields one [`SampleStep`] per timestep, from the starting index down to 0.
///
/// Stopping early has no side effects. An `Err` item ends the trajectory.
pub struct AncestralSampler<'a, M: ?Sized, R: ?Sized> {
	diffusion: &'a GaussianDiffusion,
	model: &'a M,
	options: SampleOptions<'a>,
	rng: &'a mut R,
	current: ConditionedSample,
	indices: Rev<Range<usize>>,
	failed: bool
}

impl<'a, M, R> Iterator for AncestralSampler<'a, M, R>
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
		trace!(timestep = t, "ancestral step");

		let timesteps = vec![t; self.current.batch_size()];
		match self.diffusion.ancestral_step(self.model, &self.current, &timesteps, &self.options, self.rng) {
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
	/// Samples `x_{t-1}` from the network at the given timesteps.
	///
	/// No noise is added for batch elements at `t = 0`; their result is exactly the step mean.
	pub fn ancestral_step<M, R>(
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
		let prediction = self.predict_step(model, x, timesteps, options)?;

		let mut noise = Array4::<f32>::random_using(x.target_dim(), StandardNormal, rng);
		for (mut noise, t) in noise.outer_iter_mut().zip(timesteps) {
			if *t == 0 {
				noise.fill(0.0);
			}
		}
		let target = prediction.log_variance.mapv(|v| (0.5 * v).exp()) * &noise + &prediction.mean;

		Ok(SampleStep {
			sample: x.with_target(target),
			pred_xstart: prediction.pred_xstart,
			calibration: prediction.calibration,
			timesteps: timesteps.to_vec()
		})
	}

	/// Creates a lazy ancestral sampling trajectory.
	///
	/// Starts from `noise` if given (its conditioning channels are kept fixed for the whole trajectory), or from zero
	/// conditioning channels and a standard Gaussian target otherwise. With `options.steps` set, sampling starts at
	/// index `steps - 1` instead of `T - 1`.
	///
	/// # Errors
	/// Fails before any network call with [`DiffusionError::InvalidShape`] for a malformed `shape`, or
	/// [`DiffusionError::ShapeMismatch`] if `noise` does not have that shape.
	pub fn ancestral_loop_progressive<'a, M, R>(
		&'a self,
		model: &'a M,
		shape: &[usize],
		noise: Option<ConditionedSample>,
		options: SampleOptions<'a>,
		rng: &'a mut R
	) -> anyhow::Result<AncestralSampler<'a, M, R>>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		let current = self.initial_sample(shape, noise, rng)?;
		let steps = self.clamp_steps(options.steps);
		debug!(sampler = "ancestral", steps, shape = ?shape, "starting sampling loop");

		Ok(AncestralSampler {
			diffusion: self,
			model,
			options,
			rng,
			current,
			indices: (0..steps).rev(),
			failed: false
		})
	}

	/// Runs the ancestral sampler to completion and returns the final step.
	///
	/// # Errors
	/// Fails with [`DiffusionError::EmptyTrajectory`] if no step was taken (e.g. `options.steps` is 0), in addition to
	/// the errors of [`ancestral_loop_progressive`](Self::ancestral_loop_progressive) and
	/// [`predict_step`](Self::predict_step).
	pub fn ancestral_loop<M, R>(
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
		last_step(self.ancestral_loop_progressive(model, shape, noise, options, rng)?)
	}

	/// Samples a new target channel for a known image: the image's conditioning channels are kept and its target is
	/// replaced with fresh noise before sampling.
	///
	/// If the engine is configured to use an external solver, `solver` must be given; sampling is then delegated to it
	/// and its target output is min-max normalized to `[0, 1]`. Otherwise `sampler` selects the loop and `solver` is
	/// ignored. In both cases, the final calibration map is blended with the sampled target
	/// (see [`blend_calibration`]).
	pub fn sample_known<M, R>(
		&self,
		model: &M,
		image: &ConditionedSample,
		sampler: KnownSampler,
		solver: Option<&dyn ExternalSolver>,
		options: SampleOptions<'_>,
		rng: &mut R
	) -> anyhow::Result<KnownSampleOutput>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		let noise = Array4::<f32>::random_using(image.target_dim(), StandardNormal, rng);
		let initial = image.with_target(noise.clone());

		let (sample, calibration) = if self.use_external_solver {
			let solver = solver.context("the engine is configured to use an external solver, but none was provided")?;
			self.sample_with_solver(model, image, solver, noise, options.steps)?
		} else {
			let shape = initial.full_shape();
			let last = match sampler {
				KnownSampler::Ancestral => self.ancestral_loop(model, &shape, Some(initial.clone()), options, rng)?,
				KnownSampler::Ddim => self.ddim_loop(model, &shape, Some(initial.clone()), options, rng)?
			};
			let calibration = last.calibration.unwrap_or_else(|| Array4::zeros(image.target_dim()));
			(last.sample, calibration)
		};

		let blended_calibration = blend_calibration(sample.target.view(), calibration.view())?;
		Ok(KnownSampleOutput {
			sample,
			initial,
			calibration,
			blended_calibration
		})
	}

	fn sample_with_solver<M>(
		&self,
		model: &M,
		image: &ConditionedSample,
		solver: &dyn ExternalSolver,
		noise: Array4<f32>,
		steps: Option<usize>
	) -> anyhow::Result<(ConditionedSample, Array4<f32>)>
	where
		M: DenoisingModel + ?Sized
	{
		let steps = steps.unwrap_or_else(|| self.num_timesteps());
		debug!(sampler = "external", steps, "delegating to external solver");

		let context = image.context.view();
		let predictor: &NoisePredictorFn<'_> = &|target, t| {
			let input = concatenate(Axis(1), &[context.view(), target.view()])?;
			let timesteps = Array1::from_elem(target.dim().0, self.scale_timestep(t));
			let output = model.forward(input.view(), timesteps.view())?;
			Ok(ModelOutput {
				prediction: output.prediction.slice(s![.., ..1, .., ..]).to_owned(),
				calibration: output.calibration
			})
		};
		let SolverOutput { sample, calibration } = solver.sample(self.betas(), predictor, noise, steps)?;
		ensure_shape("solver sample", image.target.shape(), sample.shape())?;

		Ok((image.with_target(normalize_min_max(sample.view())), calibration))
	}

	/// Validates a caller-supplied shape and produces the starting sample of a trajectory.
	pub(crate) fn initial_sample<R: Rng + ?Sized>(&self, shape: &[usize], noise: Option<ConditionedSample>, rng: &mut R) -> anyhow::Result<ConditionedSample> {
		let [n, c, h, w] = validate_shape(shape)?;
		match noise {
			Some(noise) => {
				ensure_shape("initial sample", shape, &noise.full_shape())?;
				Ok(noise)
			}
			None => ConditionedSample::new(Array4::zeros((n, c - 1, h, w)), Array4::random_using((n, 1, h, w), StandardNormal, rng))
		}
	}

	/// Clamps a requested step count to the schedule length.
	pub(crate) fn clamp_steps(&self, steps: Option<usize>) -> usize {
		let num_timesteps = self.num_timesteps();
		match steps {
			Some(steps) if steps > num_timesteps => {
				warn!(steps, num_timesteps, "requested more steps than the schedule has; clamping");
				num_timesteps
			}
			Some(steps) => steps,
			None => num_timesteps
		}
	}
}

/// Drains a trajectory, returning the last step.
pub(crate) fn last_step<I>(trajectory: I) -> anyhow::Result<SampleStep>
where
	I: Iterator<Item = anyhow::Result<SampleStep>>
{
	let mut last = None;
	for step in trajectory {
		last = Some(step?);
	}
	last.ok_or_else(|| DiffusionError::EmptyTrajectory.into())
}

/// Blends a calibration map with a sampled target channel, per batch element.
///
/// Both are binarized at 0.5 and compared by Dice score. Below 0.65 the result is `clamp(calibration + 0.25 *
/// sample, 0, 1)`, otherwise `clamp(0.5 * calibration + 0.5 * sample, 0, 1)`.
///
/// # Errors
/// Fails with [`DiffusionError::ShapeMismatch`] if the two tensors differ in shape.
pub fn blend_calibration(sample: ArrayView4<'_, f32>, calibration: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
	ensure_shape("calibration", sample.shape(), calibration.shape())?;

	let mut blended = calibration.to_owned();
	Zip::from(blended.outer_iter_mut()).and(sample.outer_iter()).par_for_each(|mut cal, sample| {
		let (cal_weight, sample_weight) = if dice_score(sample.view(), cal.view()) < BLEND_DICE_THRESHOLD { (1.0, 0.25) } else { (0.5, 0.5) };
		Zip::from(&mut cal).and(&sample).for_each(|c, s| *c = (cal_weight * *c + sample_weight * s).clamp(0.0, 1.0));
	});
	Ok(blended)
}

#[cfg(test)]
mod tests {
	use ndarray::Array;
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;
	use crate::{
		diffusion::tests::{engine, ConstantModel},
		DiffusionConfig, MeanType, VarType
	};

	fn sample(n: usize) -> ConditionedSample {
		let context = Array::from_shape_fn((n, 2, 4, 4), |(_, c, h, w)| (c * 4 + h + w) as f32 / 16.0);
		let target = Array::from_shape_fn((n, 1, 4, 4), |(b, _, h, w)| ((b + h * w) as f32 / 16.0) - 0.5);
		ConditionedSample::new(context, target).unwrap()
	}

	#[test]
	fn final_step_adds_no_noise() {
		let diffusion = engine(50, MeanType::Epsilon, VarType::FixedLarge);
		let model = ConstantModel { value: 0.3, channels: 1 };
		let x = sample(2);
		let options = SampleOptions::default();
		let a = diffusion.ancestral_step(&model, &x, &[0, 0], &options, &mut StdRng::seed_from_u64(1)).unwrap();
		let b = diffusion.ancestral_step(&model, &x, &[0, 0], &options, &mut StdRng::seed_from_u64(2)).unwrap();
		assert_eq!(a.sample, b.sample);
		let mean = diffusion.predict_step(&model, &x, &[0, 0], &options).unwrap().mean;
		assert_eq!(a.sample.target, mean);
	}

	#[test]
	fn noise_is_added_elsewhere() {
		let diffusion = engine(50, MeanType::Epsilon, VarType::FixedLarge);
		let model = ConstantModel { value: 0.3, channels: 1 };
		let x = sample(2);
		let options = SampleOptions::default();
		let a = diffusion.ancestral_step(&model, &x, &[0, 10], &options, &mut StdRng::seed_from_u64(1)).unwrap();
		let b = diffusion.ancestral_step(&model, &x, &[0, 10], &options, &mut StdRng::seed_from_u64(2)).unwrap();
		assert_eq!(a.sample.target.slice(s![0, .., .., ..]), b.sample.target.slice(s![0, .., .., ..]));
		assert_ne!(a.sample.target.slice(s![1, .., .., ..]), b.sample.target.slice(s![1, .., .., ..]));
		assert_eq!(a.sample.context, x.context);
	}

	#[test]
	fn trajectory_visits_every_index() {
		let diffusion = engine(20, MeanType::Epsilon, VarType::FixedSmall);
		let model = ConstantModel { value: 0.0, channels: 1 };
		let mut rng = StdRng::seed_from_u64(0);
		let x = sample(1);
		let steps = diffusion
			.ancestral_loop_progressive(&model, &[1, 3, 4, 4], Some(x.clone()), SampleOptions::default(), &mut rng)
			.unwrap()
			.collect::<anyhow::Result<Vec<_>>>()
			.unwrap();
		assert_eq!(steps.iter().map(|s| s.timesteps[0]).collect::<Vec<_>>(), (0..20).rev().collect::<Vec<_>>());
		assert!(steps.iter().all(|s| s.sample.context == x.context));
	}

	#[test]
	fn steps_option_sets_starting_index() {
		let diffusion = engine(20, MeanType::Epsilon, VarType::FixedSmall);
		let model = ConstantModel { value: 0.0, channels: 1 };
		let mut rng = StdRng::seed_from_u64(0);
		let sampler = diffusion
			.ancestral_loop_progressive(&model, &[1, 3, 4, 4], None, SampleOptions::default().with_steps(5), &mut rng)
			.unwrap();
		let first = sampler.map(|s| s.unwrap().timesteps[0]).next();
		assert_eq!(first, Some(4));
	}

	#[test]
	fn empty_trajectory_is_an_error() {
		let diffusion = engine(20, MeanType::Epsilon, VarType::FixedSmall);
		let model = ConstantModel { value: 0.0, channels: 1 };
		let mut rng = StdRng::seed_from_u64(0);
		let err = diffusion
			.ancestral_loop(&model, &[1, 3, 4, 4], None, SampleOptions::default().with_steps(0), &mut rng)
			.unwrap_err();
		assert_eq!(err.downcast_ref::<DiffusionError>(), Some(&DiffusionError::EmptyTrajectory));
	}

	#[test]
	fn malformed_shape_fails_before_network() {
		let diffusion = engine(20, MeanType::Epsilon, VarType::FixedSmall);
		let model = crate::model_fn(|_, _| panic!("network must not be called"));
		let mut rng = StdRng::seed_from_u64(0);
		for shape in [&[][..], &[1, 3, 4][..], &[0, 3, 4, 4][..]] {
			let err = diffusion.ancestral_loop(&model, shape, None, SampleOptions::default(), &mut rng).unwrap_err();
			assert!(matches!(err.downcast_ref::<DiffusionError>(), Some(DiffusionError::InvalidShape(_))));
		}
	}

	#[test]
	fn blend_depends_on_agreement() {
		let sample = Array4::from_elem((2, 1, 2, 2), 1.0f32);
		let mut calibration = Array4::from_elem((2, 1, 2, 2), 0.8f32);
		calibration.slice_mut(s![1, .., .., ..]).fill(0.0);
		let blended = blend_calibration(sample.view(), calibration.view()).unwrap();
		// agreeing maps are averaged
		assert!((blended[[0, 0, 0, 0]] - 0.9).abs() < 1e-6);
		// disagreeing maps are nudged
		assert!((blended[[1, 0, 0, 0]] - 0.25).abs() < 1e-6);
	}

	#[test]
	fn known_sampling_keeps_context() {
		let diffusion = engine(10, MeanType::Epsilon, VarType::FixedLarge);
		let model = ConstantModel { value: 0.0, channels: 1 };
		let mut rng = StdRng::seed_from_u64(3);
		let image = sample(2);
		for sampler in [KnownSampler::Ancestral, KnownSampler::Ddim] {
			let out = diffusion.sample_known(&model, &image, sampler, None, SampleOptions::default(), &mut rng).unwrap();
			assert_eq!(out.sample.context, image.context);
			assert_eq!(out.initial.context, image.context);
			assert_ne!(out.initial.target, image.target);
			assert_eq!(out.calibration, Array4::<f32>::zeros((2, 1, 4, 4)));
			assert!(out.blended_calibration.iter().all(|v| (0.0..=1.0).contains(v)));
		}
	}

	#[test]
	fn external_solver_must_be_provided_when_configured() {
		let diffusion = GaussianDiffusion::new(&DiffusionConfig {
			num_timesteps: 100,
			use_external_solver: true,
			..Default::default()
		})
		.unwrap();
		let model = ConstantModel { value: 0.0, channels: 1 };
		let mut rng = StdRng::seed_from_u64(3);
		assert!(diffusion
			.sample_known(&model, &sample(1), KnownSampler::Ancestral, None, SampleOptions::default(), &mut rng)
			.is_err());
	}
}
