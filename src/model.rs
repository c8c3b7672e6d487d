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

//! Interfaces to the collaborators the diffusion engine drives but does not implement: the prediction network,
//! guidance functions, and external fast solvers.

use ndarray::{Array4, ArrayView1, ArrayView4};

/// The raw output of a [`DenoisingModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
	/// The raw prediction. Has one channel, or two when the variance is learned (`[mean-component, variance-component]`).
	pub prediction: Array4<f32>,
	/// An optional auxiliary calibration map with the shape of the target channel. Passed through unchanged.
	pub calibration: Option<Array4<f32>>
}

impl ModelOutput {
	/// An output with no calibration map.
	pub fn new(prediction: Array4<f32>) -> Self {
		Self { prediction, calibration: None }
	}

	/// Attaches a calibration map.
	pub fn with_calibration(mut self, calibration: Array4<f32>) -> Self {
		self.calibration = Some(calibration);
		self
	}
}

impl From<Array4<f32>> for ModelOutput {
	fn from(prediction: Array4<f32>) -> Self {
		Self::new(prediction)
	}
}

/// The prediction network.
///
/// `input` is the full `[N, C, H, W]` sample (conditioning channels followed by the noisy target channel) and
/// `timesteps` holds one (possibly rescaled) timestep per batch element. Any extra conditioning the network needs is
/// owned by the implementor.
///
/// The call is treated as synchronous; samplers never start the next step before it returns.
pub trait DenoisingModel {
	/// Runs the network.
	fn forward(&self, input: ArrayView4<'_, f32>, timesteps: ArrayView1<'_, f32>) -> anyhow::Result<ModelOutput>;
}

impl<M: DenoisingModel + ?Sized> DenoisingModel for &M {
	fn forward(&self, input: ArrayView4<'_, f32>, timesteps: ArrayView1<'_, f32>) -> anyhow::Result<ModelOutput> {
		(**self).forward(input, timesteps)
	}
}

/// A [`DenoisingModel`] backed by a closure. See [`model_fn`].
pub struct FnModel<F>(F);

impl<F> DenoisingModel for FnModel<F>
where
	F: Fn(ArrayView4<'_, f32>, ArrayView1<'_, f32>) -> anyhow::Result<ModelOutput>
{
	fn forward(&self, input: ArrayView4<'_, f32>, timesteps: ArrayView1<'_, f32>) -> anyhow::Result<ModelOutput> {
		(self.0)(input, timesteps)
	}
}

/// Wraps a closure as a [`DenoisingModel`].
///
/// ```ignore
/// let model = model_fn(|input, _timesteps| Ok(ModelOutput::new(Array4::zeros((input.dim().0, 1, 64, 64)))));
/// ```
pub fn model_fn<F>(f: F) -> FnModel<F>
where
	F: Fn(ArrayView4<'_, f32>, ArrayView1<'_, f32>) -> anyhow::Result<ModelOutput>
{
	FnModel(f)
}

/// A transform applied to every clean-target estimate before it is clamped.
pub type DenoisedFn<'a> = dyn Fn(Array4<f32>) -> Array4<f32> + 'a;

/// The gradient of a conditional log-likelihood with respect to the current sample.
///
/// Arguments are the full current sample, the (rescaled) timesteps, and the original conditioning channels. The
/// result must have the shape of the target channel.
pub type GradientFn<'a> = dyn Fn(ArrayView4<'_, f32>, ArrayView1<'_, f32>, ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> + 'a;

/// A correction term for score-based conditioning, computed from the clean-target estimate.
pub type CorrectionFn<'a> = dyn Fn(ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> + 'a;

/// Steers the reverse process toward an auxiliary objective.
#[derive(Clone, Copy)]
pub enum Guidance<'a> {
	/// Shifts the step mean by `variance * gradient` (Sohl-Dickstein et al., 2015).
	MeanShift(&'a GradientFn<'a>),
	/// Re-derives the clean-target estimate from a corrected noise estimate (Song et al., 2020):
	/// `eps' = eps - sqrt(1 - alpha_bar) * scale * correction`. A `scale` of 0 leaves the step unchanged.
	Score {
		/// Produces the correction term.
		correction: &'a CorrectionFn<'a>,
		/// Magnitude of the correction.
		scale: f32
	}
}

impl std::fmt::Debug for Guidance<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Guidance::MeanShift(_) => f.write_str("Guidance::MeanShift"),
			Guidance::Score { scale, .. } => f.debug_struct("Guidance::Score").field("scale", scale).finish_non_exhaustive()
		}
	}
}

/// The noise predictor handed to an [`ExternalSolver`].
///
/// Takes the current target channel and a continuous timestep index in `[0, T)`; returns the predicted noise for the
/// target channel along with the network's calibration map, if any. Conditioning channels and timestep rescaling are
/// handled by the engine.
pub type NoisePredictorFn<'a> = dyn Fn(ArrayView4<'_, f32>, f32) -> anyhow::Result<ModelOutput> + 'a;

/// The output of an [`ExternalSolver`].
#[derive(Debug, Clone)]
pub struct SolverOutput {
	/// The sampled target channel.
	pub sample: Array4<f32>,
	/// The calibration map from the last network evaluation, or zeros if the network produced none.
	pub calibration: Array4<f32>
}

/// A fast ODE-based sampler used as an alternative sampling backend.
///
/// The engine hands over its betas and a noise predictor and returns the solver's output verbatim (aside from the
/// calibration blend, see [`GaussianDiffusion::sample_known`](crate::GaussianDiffusion::sample_known)).
pub trait ExternalSolver {
	/// Samples a target channel starting from `noise` in `steps` solver steps.
	fn sample(&self, betas: ArrayView1<'_, f64>, model: &NoisePredictorFn<'_>, noise: Array4<f32>, steps: usize) -> anyhow::Result<SolverOutput>;
}
