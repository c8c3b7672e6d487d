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

//! Training losses and variational-bound evaluation.

use std::f32::consts::LN_2;

use anyhow::Context;
use ndarray::{s, Array1, Array2, Array4, ArrayView3, ArrayView4, Axis};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;
use tracing::{debug, trace};

use super::{field_consistency, GaussianDiffusion, LossType, MeanType, SampleOptions, StepPrediction};
use crate::{
	sample::ensure_shape,
	util::{discretized_gaussian_log_likelihood, mean_flat, normal_kl_tensor},
	ConditionedSample, DenoisingModel, DiffusionError, ModelOutput
};

/// Per-batch-element losses of one training step. Every tensor has shape `[N]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingLosses {
	/// The quantity to optimize: the regression term plus the bound term, if any.
	pub loss: Array1<f32>,
	/// The regression term. `None` for the variational-bound objectives.
	pub mse: Option<Array1<f32>>,
	/// The (possibly rescaled) variational-bound term, in bits per dimension.
	pub vb: Option<Array1<f32>>,
	/// Squared error of the calibration map against the clean target, plus `physics`. Not part of `loss`.
	pub calibration_loss: Option<Array1<f32>>,
	/// The physics regularization term included in `calibration_loss`.
	pub physics: Option<Array1<f32>>
}

/// The variational-bound term at one timestep.
#[derive(Debug, Clone)]
pub struct VbTerm {
	/// Bits per dimension for each batch element: the decoder NLL at `t = 0`, the posterior KL otherwise.
	pub output: Array1<f32>,
	/// The clean-target estimate the step distribution was derived from.
	pub pred_xstart: Array4<f32>
}

/// The result of [`GaussianDiffusion::full_bound`].
#[derive(Debug, Clone)]
pub struct BoundEvaluation {
	/// The full variational bound per batch element, `sum(vb) + prior_bpd`.
	pub total_bpd: Array1<f32>,
	/// The prior term per batch element.
	pub prior_bpd: Array1<f32>,
	/// Bound terms, shape `[N, T]`; column `t` holds timestep `t`.
	pub vb: Array2<f32>,
	/// Squared error of the clean-target estimate, shape `[N, T]`.
	pub xstart_mse: Array2<f32>,
	/// Squared error of the implied noise, shape `[N, T]`.
	pub mse: Array2<f32>
}

impl GaussianDiffusion {
	/// Computes training losses for a single timestep per batch element.
	///
	/// Only the target channel of `x_start` is noised; the conditioning channels are shown to the network unchanged,
	/// apart from the configured [`ContextMix`](crate::ContextMix). If `noise` is `None`, it is drawn from `rng`.
	///
	/// # Errors
	/// - [`DiffusionError::ShapeMismatch`] if `noise`, the network prediction or its calibration map has the wrong
	///   shape
	/// - [`DiffusionError::InvalidShape`] if the context mix or physics term refers to a missing conditioning channel
	/// - any error returned by the network
	pub fn training_step<M, R>(
		&self,
		model: &M,
		x_start: &ConditionedSample,
		timesteps: &[usize],
		noise: Option<ArrayView4<'_, f32>>,
		rng: &mut R
	) -> anyhow::Result<TrainingLosses>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		self.validate_timesteps(timesteps, x_start.batch_size())?;
		let noise = match noise {
			Some(noise) => {
				ensure_shape("noise", x_start.target.shape(), noise.shape())?;
				noise.to_owned()
			}
			None => Array4::random_using(x_start.target_dim(), StandardNormal, rng)
		};

		let x_t = ConditionedSample {
			context: self.mixed_context(x_start.context.view())?,
			target: self.noised(x_start.target.view(), timesteps, noise.view())
		};
		trace!(?timesteps, loss_type = ?self.loss_type, "training step");

		let output = model
			.forward(x_t.concat().view(), self.scale_timesteps(timesteps).view())
			.with_context(|| format!("failed to evaluate network at timesteps {timesteps:?}"))?;

		if self.loss_type.is_vb() {
			let prediction = self.interpret_output(output, x_t.target.view(), timesteps, false, None)?;
			let mut vb = self.vb_from_prediction(&prediction, x_start.target.view(), x_t.target.view(), timesteps);
			if self.loss_type == LossType::RescaledKl {
				vb *= self.num_timesteps() as f32;
			}
			return Ok(TrainingLosses {
				loss: vb.clone(),
				mse: None,
				vb: Some(vb),
				calibration_loss: None,
				physics: None
			});
		}

		let ModelOutput { prediction, calibration } = output;
		let (n, _, h, w) = x_t.target.dim();
		ensure_shape("network prediction", &[n, self.var_type.prediction_channels(), h, w], prediction.shape())?;

		let vb = if self.var_type.is_learned() {
			// without autograd, the detached mean component is a plain copy of the prediction
			let frozen = self.interpret_output(ModelOutput::new(prediction.clone()), x_t.target.view(), timesteps, false, None)?;
			let mut vb = self.vb_from_prediction(&frozen, x_start.target.view(), x_t.target.view(), timesteps);
			if self.loss_type == LossType::RescaledMse {
				vb *= self.num_timesteps() as f32 / 1000.0;
			}
			Some(vb)
		} else {
			None
		};

		let target = match self.mean_type {
			MeanType::PreviousX => self.posterior_mean(x_start.target.view(), x_t.target.view(), timesteps),
			MeanType::StartX => x_start.target.clone(),
			MeanType::Epsilon => noise
		};
		let model_output = prediction.slice(s![.., ..1, .., ..]);
		let mse = mean_flat((&target - &model_output).mapv(|v| v * v).view());

		let (calibration_loss, physics) = match calibration {
			Some(calibration) => {
				ensure_shape("calibration", x_start.target.shape(), calibration.shape())?;
				let physics = field_consistency(
					calibration.index_axis(Axis(1), 0),
					self.context_channel(&x_t, self.physics.obstacle_channel)?,
					self.context_channel(&x_t, self.physics.source_channel)?,
					&self.physics
				)?;
				let squared_error = mean_flat((&x_start.target - &calibration).mapv(|v| v * v).view());
				(Some(squared_error + &physics), Some(physics))
			}
			None => (None, None)
		};

		let loss = match &vb {
			Some(vb) => &mse + vb,
			None => mse.clone()
		};
		Ok(TrainingLosses {
			loss,
			mse: Some(mse),
			vb,
			calibration_loss,
			physics
		})
	}

	/// Computes the variational-bound term for `x_t` in bits per dimension.
	///
	/// `x_start` is the clean target channel and `x_t` the noised sample it was diffused into.
	pub fn bound_term<M>(&self, model: &M, x_start: ArrayView4<'_, f32>, x_t: &ConditionedSample, timesteps: &[usize], clip_denoised: bool) -> anyhow::Result<VbTerm>
	where
		M: DenoisingModel + ?Sized
	{
		ensure_shape("x_start", x_t.target.shape(), x_start.shape())?;
		let options = SampleOptions::default().with_clip_denoised(clip_denoised);
		let prediction = self.predict_step(model, x_t, timesteps, &options)?;
		let output = self.vb_from_prediction(&prediction, x_start, x_t.target.view(), timesteps);
		Ok(VbTerm {
			output,
			pred_xstart: prediction.pred_xstart
		})
	}

	/// Gets the prior term of the variational bound in bits per dimension: the KL divergence between `q(x_{T-1} | x_0)`
	/// and a standard Gaussian. It cannot be optimized; it only depends on the schedule.
	pub fn prior_bpd(&self, x_start: ArrayView4<'_, f32>) -> anyhow::Result<Array1<f32>> {
		let last = self.num_timesteps() - 1;
		let marginal = self.forward_marginal(x_start, &vec![last; x_start.dim().0])?;
		let zeros = Array4::zeros(x_start.raw_dim());
		let kl = normal_kl_tensor(marginal.mean.view(), marginal.log_variance.view(), zeros.view(), zeros.view());
		Ok(mean_flat(kl.view()) / LN_2)
	}

	/// Computes the entire variational lower bound in bits per dimension, along with related quantities.
	///
	/// Runs one network evaluation per timestep, from `T - 1` down to 0.
	pub fn full_bound<M, R>(&self, model: &M, x_start: &ConditionedSample, clip_denoised: bool, rng: &mut R) -> anyhow::Result<BoundEvaluation>
	where
		M: DenoisingModel + ?Sized,
		R: Rng + ?Sized
	{
		let n = x_start.batch_size();
		let num_timesteps = self.num_timesteps();
		debug!(num_timesteps, batch_size = n, "evaluating full variational bound");

		let mut vb = Array2::zeros((n, num_timesteps));
		let mut xstart_mse = Array2::zeros((n, num_timesteps));
		let mut mse = Array2::zeros((n, num_timesteps));
		for t in (0..num_timesteps).rev() {
			let timesteps = vec![t; n];
			let noise = Array4::<f32>::random_using(x_start.target_dim(), StandardNormal, rng);
			let x_t = x_start.with_target(self.noised(x_start.target.view(), &timesteps, noise.view()));
			let term = self.bound_term(model, x_start.target.view(), &x_t, &timesteps, clip_denoised)?;

			let eps = self.eps_from_xstart(x_t.target.view(), &timesteps, term.pred_xstart.view());
			vb.column_mut(t).assign(&term.output);
			xstart_mse.column_mut(t).assign(&mean_flat((&term.pred_xstart - &x_start.target).mapv(|v| v * v).view()));
			mse.column_mut(t).assign(&mean_flat((&eps - &noise).mapv(|v| v * v).view()));
		}

		let prior_bpd = self.prior_bpd(x_start.target.view())?;
		let total_bpd = vb.sum_axis(Axis(1)) + &prior_bpd;
		Ok(BoundEvaluation {
			total_bpd,
			prior_bpd,
			vb,
			xstart_mse,
			mse
		})
	}

	/// Bits per dimension of `x_start` under a step prediction: the decoder NLL where `t = 0`, the KL against the true
	/// posterior elsewhere.
	fn vb_from_prediction(&self, prediction: &StepPrediction, x_start: ArrayView4<'_, f32>, x_t: ArrayView4<'_, f32>, timesteps: &[usize]) -> Array1<f32> {
		let posterior = self.posterior(x_start, x_t, timesteps);
		let kl = normal_kl_tensor(posterior.mean.view(), posterior.log_variance.view(), prediction.mean.view(), prediction.log_variance.view());
		let kl = mean_flat(kl.view()) / LN_2;

		let log_scales = prediction.log_variance.mapv(|v| 0.5 * v);
		let decoder_nll = discretized_gaussian_log_likelihood(x_start, prediction.mean.view(), log_scales.view()).mapv(|v| -v);
		let decoder_nll = mean_flat(decoder_nll.view()) / LN_2;

		timesteps
			.iter()
			.enumerate()
			.map(|(i, t)| if *t == 0 { decoder_nll[i] } else { kl[i] })
			.collect()
	}

	/// Applies the configured context mix to a copy of the conditioning channels.
	fn mixed_context(&self, context: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let mut context = context.to_owned();
		if let Some(mix) = self.context_mix {
			let channels = context.dim().1;
			if mix.source >= channels || mix.destination >= channels {
				return Err(DiffusionError::InvalidShape(format!(
					"context mix {} -> {} needs at least {} conditioning channels, got {channels}",
					mix.source,
					mix.destination,
					mix.source.max(mix.destination) + 1
				))
				.into());
			}
			let source = context.index_axis(Axis(1), mix.source).to_owned();
			context.index_axis_mut(Axis(1), mix.destination).scaled_add(mix.factor, &source);
		}
		Ok(context)
	}

	fn context_channel<'s>(&self, x: &'s ConditionedSample, channel: usize) -> anyhow::Result<ArrayView3<'s, f32>> {
		let channels = x.context.dim().1;
		if channel >= channels {
			return Err(DiffusionError::InvalidShape(format!("physics term needs conditioning channel {channel}, but only {channels} exist")).into());
		}
		Ok(x.context.index_axis(Axis(1), channel))
	}
}
