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

//! The Gaussian diffusion engine: forward process, reverse-step prediction, samplers, and losses.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BetaSchedule, ContextMix, DiffusionCoefficients, DiffusionConfig, DiffusionError};

mod ddim;
mod forward;
mod losses;
mod physics;
mod reverse;
mod sampling;

pub use self::ddim::{ddim_timesteps, InterpolationOutput, DDIMSampler};
pub use self::forward::Marginal;
pub use self::losses::{BoundEvaluation, TrainingLosses, VbTerm};
pub use self::physics::{field_consistency, FieldConsistencyConfig};
pub use self::reverse::StepPrediction;
pub use self::sampling::{blend_calibration, AncestralSampler, KnownSampleOutput, KnownSampler, SampleOptions, SampleStep};

/// The nominal timestep range the network sees when timesteps are rescaled.
pub const NOMINAL_TIMESTEPS: f32 = 1000.0;

/// Which quantity the network predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeanType {
	/// The network predicts `x_{t-1}`.
	PreviousX,
	/// The network predicts `x_0`.
	StartX,
	/// The network predicts the injected noise.
	#[default]
	Epsilon
}

/// What is used as the reverse-process variance.
///
/// `LearnedRange` lets the network interpolate (in log-space) between `FixedSmall` and `FixedLarge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VarType {
	/// The network outputs the log-variance directly.
	Learned,
	/// The network outputs a value in `[-1, 1]` interpolating between the posterior variance and `beta`.
	LearnedRange,
	/// The true posterior variance.
	FixedSmall,
	/// `beta_t`, with the first entry replaced by the posterior variance at index 1.
	#[default]
	FixedLarge
}

impl VarType {
	/// Whether the network outputs a variance component.
	#[inline]
	pub fn is_learned(&self) -> bool {
		matches!(self, VarType::Learned | VarType::LearnedRange)
	}

	/// The number of channels the network prediction must have.
	#[inline]
	pub fn prediction_channels(&self) -> usize {
		if self.is_learned() { 2 } else { 1 }
	}
}

/// The training objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossType {
	/// Raw MSE (plus the variational bound when learning variances).
	#[default]
	Mse,
	/// Raw MSE, with the variational bound rescaled by `T / 1000` when learning variances.
	RescaledMse,
	/// The variational lower bound.
	Kl,
	/// The variational lower bound, rescaled by `T` to estimate the full bound.
	RescaledKl,
	/// MSE regression tracked alongside a calibration and physics-regularization term.
	BceDice
}

impl LossType {
	/// Whether this objective is the variational bound alone.
	#[inline]
	pub fn is_vb(&self) -> bool {
		matches!(self, LossType::Kl | LossType::RescaledKl)
	}
}

/// Utilities for training and sampling conditional diffusion models.
///
/// The engine owns an immutable [`DiffusionCoefficients`] table and the parameterization choices; every call takes
/// the network, the sample and the random source explicitly, so a single engine can be shared across threads.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
	pub(crate) coefficients: DiffusionCoefficients,
	pub(crate) mean_type: MeanType,
	pub(crate) var_type: VarType,
	pub(crate) loss_type: LossType,
	pub(crate) rescale_timesteps: bool,
	pub(crate) context_mix: Option<ContextMix>,
	pub(crate) physics: FieldConsistencyConfig,
	pub(crate) use_external_solver: bool
}

impl GaussianDiffusion {
	/// Creates a new engine from a configuration.
	///
	/// # Errors
	/// Can error if:
	/// - the schedule yields an empty beta sequence or betas outside of `(0, 1)`
	/// - `num_timesteps` is 0 for a named schedule
	pub fn new(config: &DiffusionConfig) -> anyhow::Result<Self> {
		let num_timesteps = config.schedule.fixed_len().unwrap_or(config.num_timesteps);
		let betas = config.schedule.betas(num_timesteps)?;
		let coefficients = DiffusionCoefficients::new(betas)?;

		debug!(
			schedule = %config.schedule,
			num_timesteps,
			mean_type = ?config.mean_type,
			var_type = ?config.var_type,
			loss_type = ?config.loss_type,
			"initialized gaussian diffusion"
		);

		Ok(Self {
			coefficients,
			mean_type: config.mean_type,
			var_type: config.var_type,
			loss_type: config.loss_type,
			rescale_timesteps: config.rescale_timesteps,
			context_mix: config.context_mix,
			physics: config.physics,
			use_external_solver: config.use_external_solver
		})
	}

	/// Creates a new engine from explicit betas, with every other option at its default.
	pub fn from_betas(betas: Array1<f64>, mean_type: MeanType, var_type: VarType, loss_type: LossType) -> anyhow::Result<Self> {
		let config = DiffusionConfig {
			num_timesteps: betas.len(),
			schedule: BetaSchedule::Trained(betas.to_vec()),
			mean_type,
			var_type,
			loss_type,
			..Default::default()
		};
		Self::new(&config)
	}

	/// The number of diffusion steps `T`.
	#[inline]
	pub fn num_timesteps(&self) -> usize {
		self.coefficients.num_timesteps()
	}

	/// The precomputed coefficient table.
	#[inline]
	pub fn coefficients(&self) -> &DiffusionCoefficients {
		&self.coefficients
	}

	/// The noise schedule.
	pub fn betas(&self) -> ArrayView1<'_, f64> {
		self.coefficients.betas()
	}

	/// The configured mean parameterization.
	pub fn mean_type(&self) -> MeanType {
		self.mean_type
	}

	/// The configured variance parameterization.
	pub fn var_type(&self) -> VarType {
		self.var_type
	}

	/// The configured training objective.
	pub fn loss_type(&self) -> LossType {
		self.loss_type
	}

	/// Converts timestep indices into the values passed to the network.
	pub fn scale_timesteps(&self, timesteps: &[usize]) -> Array1<f32> {
		timesteps.iter().map(|t| self.scale_timestep(*t as f32)).collect()
	}

	pub(crate) fn scale_timestep(&self, t: f32) -> f32 {
		if self.rescale_timesteps { t * (NOMINAL_TIMESTEPS / self.num_timesteps() as f32) } else { t }
	}

	/// Checks a batch of timesteps against the schedule and the batch size.
	pub(crate) fn validate_timesteps(&self, timesteps: &[usize], batch_size: usize) -> Result<(), DiffusionError> {
		if timesteps.len() != batch_size {
			return Err(DiffusionError::shape_mismatch("timestep batch", &[batch_size], &[timesteps.len()]));
		}
		let num_timesteps = self.num_timesteps();
		match timesteps.iter().find(|t| **t >= num_timesteps) {
			Some(t) => Err(DiffusionError::InvalidTimestep { timestep: *t, num_timesteps }),
			None => Ok(())
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use ndarray::{Array4, ArrayView1, ArrayView4};

	use super::*;
	use crate::{DenoisingModel, ModelOutput};

	pub fn engine(num_timesteps: usize, mean_type: MeanType, var_type: VarType) -> GaussianDiffusion {
		GaussianDiffusion::new(&DiffusionConfig {
			// short rescaled linear schedules end at or beyond beta = 1
			schedule: if num_timesteps < 50 { BetaSchedule::Cosine } else { BetaSchedule::Linear },
			num_timesteps,
			mean_type,
			var_type,
			..Default::default()
		})
		.unwrap()
	}

	/// Returns a constant prediction regardless of its input.
	pub struct ConstantModel {
		pub value: f32,
		pub channels: usize
	}

	impl DenoisingModel for ConstantModel {
		fn forward(&self, input: ArrayView4<'_, f32>, _: ArrayView1<'_, f32>) -> anyhow::Result<ModelOutput> {
			let (n, _, h, w) = input.dim();
			Ok(ModelOutput::new(Array4::from_elem((n, self.channels, h, w), self.value)))
		}
	}

	#[test]
	fn timesteps_are_rescaled_to_nominal_range() {
		let mut diffusion = engine(250, MeanType::Epsilon, VarType::FixedLarge);
		assert_eq!(diffusion.scale_timesteps(&[0, 10]).to_vec(), vec![0.0, 10.0]);
		diffusion.rescale_timesteps = true;
		assert_eq!(diffusion.scale_timesteps(&[0, 10, 249]).to_vec(), vec![0.0, 40.0, 996.0]);
	}

	#[test]
	fn timesteps_are_validated() {
		let diffusion = engine(10, MeanType::Epsilon, VarType::FixedLarge);
		assert!(diffusion.validate_timesteps(&[0, 9], 2).is_ok());
		assert_eq!(diffusion.validate_timesteps(&[10], 1), Err(DiffusionError::InvalidTimestep { timestep: 10, num_timesteps: 10 }));
		assert!(matches!(diffusion.validate_timesteps(&[1], 2), Err(DiffusionError::ShapeMismatch { .. })));
	}

	#[test]
	fn trained_schedule_sets_length() {
		let diffusion = GaussianDiffusion::from_betas(Array1::from(vec![0.1, 0.2, 0.3]), MeanType::StartX, VarType::FixedSmall, LossType::Mse).unwrap();
		assert_eq!(diffusion.num_timesteps(), 3);
		assert_eq!(diffusion.mean_type(), MeanType::StartX);
	}
}
