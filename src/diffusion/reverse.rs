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

use anyhow::Context;
use ndarray::{s, Array4, ArrayView1, ArrayView4};

use super::{GaussianDiffusion, MeanType, SampleOptions, VarType};
use crate::{
	sample::ensure_shape,
	schedulers::{extract_into_tensor, extract_map_into_tensor},
	ConditionedSample, DenoisedFn, DenoisingModel, Guidance, ModelOutput
};

/// The predicted distribution `p(x_{t-1} | x_t)` for the target channel, along with the clean-target estimate it
/// was derived from.
#[derive(Debug, Clone)]
pub struct StepPrediction {
	/// Mean of the step distribution.
	pub mean: Array4<f32>,
	/// Variance of the step distribution.
	pub variance: Array4<f32>,
	/// Log-variance of the step distribution.
	pub log_variance: Array4<f32>,
	/// The clean-target estimate, after post-processing and clamping.
	pub pred_xstart: Array4<f32>,
	/// The calibration map produced by the network, if any.
	pub calibration: Option<Array4<f32>>,
	/// The mean component of the raw network prediction (`x_{t-1}`, `x_0` or `eps`, depending on [`MeanType`]).
	pub model_output: Array4<f32>
}

impl GaussianDiffusion {
	/// Applies the network to get `p(x_{t-1} | x_t)`, as well as a prediction of the initial `x`.
	///
	/// The network sees the full multi-channel sample; only the target channel is denoised. Guidance from `options`
	/// is applied after the prediction is converted.
	///
	/// # Errors
	/// - [`DiffusionError::InvalidTimestep`](crate::DiffusionError::InvalidTimestep) if a timestep is out of range
	/// - [`DiffusionError::ShapeMismatch`](crate::DiffusionError::ShapeMismatch) if the network prediction does not
	///   have the channel count required by [`VarType`], or a guidance function returns a tensor of the wrong shape
	/// - any error returned by the network or a guidance function
	pub fn predict_step<M: DenoisingModel + ?Sized>(
		&self,
		model: &M,
		x: &ConditionedSample,
		timesteps: &[usize],
		options: &SampleOptions<'_>
	) -> anyhow::Result<StepPrediction> {
		self.validate_timesteps(timesteps, x.batch_size())?;
		let scaled_timesteps = self.scale_timesteps(timesteps);
		let output = model
			.forward(x.concat().view(), scaled_timesteps.view())
			.with_context(|| format!("failed to evaluate network at timesteps {timesteps:?}"))?;

		let mut prediction = self.interpret_output(output, x.target.view(), timesteps, options.clip_denoised, options.denoised_fn)?;
		if let Some(guidance) = options.guidance {
			self.apply_guidance(&mut prediction, guidance, x, timesteps, scaled_timesteps.view())?;
		}
		Ok(prediction)
	}

	/// Converts a raw network prediction for the target channel `x_t` into a step distribution.
	pub(crate) fn interpret_output(
		&self,
		output: ModelOutput,
		x_t: ArrayView4<'_, f32>,
		timesteps: &[usize],
		clip_denoised: bool,
		denoised_fn: Option<&DenoisedFn<'_>>
	) -> anyhow::Result<StepPrediction> {
		let ModelOutput { prediction, calibration } = output;
		let (n, _, h, w) = x_t.dim();
		ensure_shape("network prediction", &[n, self.var_type.prediction_channels(), h, w], prediction.shape())?;

		let c = &self.coefficients;
		let dim = x_t.raw_dim();
		let model_output = prediction.slice(s![.., ..1, .., ..]).to_owned();

		let (variance, log_variance) = match self.var_type {
			VarType::Learned => {
				let log_variance = prediction.slice(s![.., 1.., .., ..]).to_owned();
				(log_variance.mapv(f32::exp), log_variance)
			}
			VarType::LearnedRange => {
				let min_log = extract_into_tensor(&c.posterior_log_variance_clipped, timesteps, dim);
				let max_log = extract_into_tensor(&c.log_betas, timesteps, dim);
				// the network output lies in [-1, 1]
				let frac = prediction.slice(s![.., 1.., .., ..]).mapv(|v| (v + 1.0) / 2.0);
				let log_variance = &frac * &max_log + (1.0 - &frac) * &min_log;
				(log_variance.mapv(f32::exp), log_variance)
			}
			VarType::FixedSmall => (
				extract_into_tensor(&c.posterior_variance, timesteps, dim),
				extract_into_tensor(&c.posterior_log_variance_clipped, timesteps, dim)
			),
			VarType::FixedLarge => (
				extract_into_tensor(&c.large_variance, timesteps, dim),
				extract_into_tensor(&c.large_log_variance, timesteps, dim)
			)
		};

		// clamping must come after any post-processing
		let process_xstart = |x: Array4<f32>| {
			let mut x = match denoised_fn {
				Some(f) => f(x),
				None => x
			};
			if clip_denoised {
				x.par_map_inplace(|v| *v = v.clamp(-1.0, 1.0));
			}
			x
		};

		let (mean, pred_xstart) = match self.mean_type {
			MeanType::PreviousX => {
				let pred_xstart = process_xstart(self.predict_xstart_from_xprev(x_t, timesteps, model_output.view()));
				(model_output.clone(), pred_xstart)
			}
			MeanType::StartX => {
				let pred_xstart = process_xstart(model_output.clone());
				(self.posterior_mean(pred_xstart.view(), x_t, timesteps), pred_xstart)
			}
			MeanType::Epsilon => {
				let pred_xstart = process_xstart(self.xstart_from_eps(x_t, timesteps, model_output.view()));
				(self.posterior_mean(pred_xstart.view(), x_t, timesteps), pred_xstart)
			}
		};

		assert_eq!(mean.shape(), x_t.shape(), "step mean must have the target shape");
		assert_eq!(log_variance.shape(), x_t.shape(), "step log-variance must have the target shape");
		assert_eq!(pred_xstart.shape(), x_t.shape(), "clean-target estimate must have the target shape");

		Ok(StepPrediction {
			mean,
			variance,
			log_variance,
			pred_xstart,
			calibration,
			model_output
		})
	}

	fn apply_guidance(
		&self,
		prediction: &mut StepPrediction,
		guidance: Guidance<'_>,
		x: &ConditionedSample,
		timesteps: &[usize],
		scaled_timesteps: ArrayView1<'_, f32>
	) -> anyhow::Result<()> {
		let x_t = x.target.view();
		match guidance {
			Guidance::MeanShift(gradient_fn) => {
				let gradient = gradient_fn(x.concat().view(), scaled_timesteps, x.context.view()).context("failed to compute guidance gradient")?;
				ensure_shape("guidance gradient", x_t.shape(), gradient.shape())?;
				prediction.mean = &prediction.mean + &(&prediction.variance * &gradient);
			}
			Guidance::Score { correction, scale } => {
				let mut eps = self.eps_from_xstart(x_t, timesteps, prediction.pred_xstart.view());
				if scale != 0.0 {
					let correction = correction(prediction.pred_xstart.view()).context("failed to compute guidance correction")?;
					ensure_shape("guidance correction", x_t.shape(), correction.shape())?;
					let sigma = extract_map_into_tensor(&self.coefficients.alphas_cumprod, timesteps, x_t.raw_dim(), |a| (1.0 - a).sqrt());
					eps = eps - sigma * scale * &correction;
				}
				prediction.pred_xstart = self.xstart_from_eps(x_t, timesteps, eps.view());
				prediction.mean = self.posterior_mean(prediction.pred_xstart.view(), x_t, timesteps);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array;

	use super::*;
	use crate::{
		diffusion::tests::{engine, ConstantModel},
		model_fn, CorrectionFn, DiffusionError, GradientFn
	};

	fn sample(n: usize) -> ConditionedSample {
		let context = Array::from_shape_fn((n, 2, 4, 4), |(_, c, h, w)| (c + h * w) as f32 / 16.0);
		let target = Array::from_shape_fn((n, 1, 4, 4), |(b, _, h, w)| ((b + h + w) as f32 / 8.0) - 0.5);
		ConditionedSample::new(context, target).unwrap()
	}

	#[test]
	fn fixed_large_variance_is_clipped_at_zero() {
		let diffusion = engine(100, MeanType::Epsilon, VarType::FixedLarge);
		let model = ConstantModel { value: 0.0, channels: 1 };
		let out = diffusion.predict_step(&model, &sample(2), &[0, 50], &SampleOptions::default()).unwrap();
		let c = diffusion.coefficients();
		assert_eq!(out.variance[[0, 0, 0, 0]], c.posterior_variance()[1] as f32);
		assert_eq!(out.variance[[1, 0, 0, 0]], c.betas()[50] as f32);
		assert!(out.log_variance.iter().all(|v| v.is_finite()));
	}

	#[test]
	fn learned_range_interpolates_between_bounds() {
		let diffusion = engine(100, MeanType::Epsilon, VarType::LearnedRange);
		let x = sample(1);
		let c = diffusion.coefficients();
		for (raw, expected) in [(-1.0, c.posterior_log_variance_clipped()[30]), (1.0, c.betas()[30].ln())] {
			let model = ConstantModel { value: raw, channels: 2 };
			let out = diffusion.predict_step(&model, &x, &[30], &SampleOptions::default()).unwrap();
			assert!((out.log_variance[[0, 0, 1, 1]] - expected as f32).abs() < 1e-5);
		}
	}

	#[test]
	fn prediction_channels_must_match_variance_type() {
		let diffusion = engine(100, MeanType::Epsilon, VarType::Learned);
		let model = ConstantModel { value: 0.0, channels: 1 };
		let err = diffusion.predict_step(&model, &sample(1), &[3], &SampleOptions::default()).unwrap_err();
		assert!(matches!(err.downcast_ref::<DiffusionError>(), Some(DiffusionError::ShapeMismatch { .. })));
	}

	#[test]
	fn clamp_applies_after_postprocessing() {
		let diffusion = engine(100, MeanType::StartX, VarType::FixedSmall);
		let model = ConstantModel { value: 0.5, channels: 1 };
		let amplify = |x: Array4<f32>| x * 10.0;
		let options = SampleOptions::default().with_denoised_fn(&amplify);
		let out = diffusion.predict_step(&model, &sample(1), &[10], &options).unwrap();
		assert!(out.pred_xstart.iter().all(|v| *v == 1.0));

		let out = diffusion.predict_step(&model, &sample(1), &[10], &options.with_clip_denoised(false)).unwrap();
		assert!(out.pred_xstart.iter().all(|v| *v == 5.0));
	}

	#[test]
	fn network_errors_propagate() {
		#[derive(Debug, thiserror::Error)]
		#[error("device lost")]
		struct DeviceLost;

		let diffusion = engine(10, MeanType::Epsilon, VarType::FixedLarge);
		let model = model_fn(|_, _| Err(DeviceLost.into()));
		let err = diffusion.predict_step(&model, &sample(1), &[3], &SampleOptions::default()).unwrap_err();
		assert!(err.downcast_ref::<DeviceLost>().is_some());
		assert!(err.downcast_ref::<DiffusionError>().is_none());
	}

	#[test]
	fn mean_shift_adds_scaled_gradient() {
		let diffusion = engine(100, MeanType::Epsilon, VarType::FixedLarge);
		let model = ConstantModel { value: 0.1, channels: 1 };
		let x = sample(1);
		let plain = diffusion.predict_step(&model, &x, &[40], &SampleOptions::default()).unwrap();

		let gradient: &GradientFn<'_> = &|x: ArrayView4<'_, f32>, _: ArrayView1<'_, f32>, _: ArrayView4<'_, f32>| -> anyhow::Result<Array4<f32>> {
			let (n, _, h, w) = x.dim();
			Ok(Array4::from_elem((n, 1, h, w), 2.0))
		};
		let guided = diffusion
			.predict_step(&model, &x, &[40], &SampleOptions::default().with_guidance(Guidance::MeanShift(gradient)))
			.unwrap();
		let expected = &plain.mean + &(&plain.variance * 2.0);
		assert_eq!(guided.mean, expected);
		assert_eq!(guided.pred_xstart, plain.pred_xstart);
	}

	#[test]
	fn learned_variance_is_log_space() {
		let diffusion = engine(100, MeanType::Epsilon, VarType::Learned);
		let model = ConstantModel { value: -2.0, channels: 2 };
		let out = diffusion.predict_step(&model, &sample(2), &[7, 70], &SampleOptions::default()).unwrap();
		assert!(out.log_variance.iter().all(|v| *v == -2.0));
		assert!(out.variance.iter().all(|v| *v == (-2.0f32).exp()));
	}

	#[test]
	fn previous_x_prediction_is_the_mean() {
		let diffusion = engine(100, MeanType::PreviousX, VarType::FixedSmall);
		let model = ConstantModel { value: 0.05, channels: 1 };
		let x = sample(1);
		let out = diffusion.predict_step(&model, &x, &[20], &SampleOptions::default().with_clip_denoised(false)).unwrap();
		assert!(out.mean.iter().all(|v| *v == 0.05));
		assert_eq!(out.pred_xstart, diffusion.predict_xstart_from_xprev(x.target.view(), &[20], out.mean.view()));
	}

	#[test]
	fn score_guidance_corrects_noise_estimate() {
		let diffusion = engine(100, MeanType::Epsilon, VarType::FixedLarge);
		let model = ConstantModel { value: 0.1, channels: 1 };
		let x = sample(1);
		let options = SampleOptions::default().with_clip_denoised(false);

		let correction: &CorrectionFn<'_> = &|pred_xstart: ArrayView4<'_, f32>| -> anyhow::Result<Array4<f32>> { Ok(Array4::from_elem(pred_xstart.raw_dim(), 0.3)) };
		let guided = diffusion
			.predict_step(&model, &x, &[40], &options.with_guidance(Guidance::Score { correction, scale: 0.5 }))
			.unwrap();

		let alpha_bar = diffusion.coefficients().alphas_cumprod()[40];
		let eps = 0.1 - (1.0 - alpha_bar).sqrt() * 0.5 * 0.3;
		for (guided, x_t) in guided.pred_xstart.iter().zip(x.target.iter()) {
			let expected = (*x_t as f64 - (1.0 - alpha_bar).sqrt() * eps) / alpha_bar.sqrt();
			assert!((*guided as f64 - expected).abs() < 1e-4, "{guided} != {expected}");
		}
		assert_eq!(guided.mean, diffusion.posterior_mean(guided.pred_xstart.view(), x.target.view(), &[40]));
	}

	#[test]
	fn zero_score_scale_keeps_estimate() {
		let diffusion = engine(100, MeanType::Epsilon, VarType::FixedLarge);
		let model = ConstantModel { value: 0.1, channels: 1 };
		let x = sample(1);
		let plain = diffusion.predict_step(&model, &x, &[40], &SampleOptions::default()).unwrap();

		let correction: &CorrectionFn<'_> = &|_: ArrayView4<'_, f32>| -> anyhow::Result<Array4<f32>> { anyhow::bail!("must not be called") };
		let guided = diffusion
			.predict_step(&model, &x, &[40], &SampleOptions::default().with_guidance(Guidance::Score { correction, scale: 0.0 }))
			.unwrap();
		for (a, b) in guided.pred_xstart.iter().zip(plain.pred_xstart.iter()) {
			assert!((a - b).abs() < 1e-4);
		}
	}
}
