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

//! Noise schedules and the coefficient tables derived from them.
//!
//! * A beta schedule maps a schedule name and a number of diffusion steps `T` to the per-step noise variances
//!   `beta_0 ..= beta_{T-1}`.
//! * [`DiffusionCoefficients`] precomputes everything the forward process, the reverse predictor and the samplers
//!   look up by timestep.
//!
//! Published schedules must never change numerically; new schedules may be added, existing ones may not be altered.

use std::{f64::consts::FRAC_PI_2, fmt, str::FromStr};

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::DiffusionError;

mod coefficients;
pub use self::coefficients::*;

/// The largest beta the cosine schedule may produce. Values closer to 1 make the reverse process singular.
pub const MAX_COSINE_BETA: f64 = 0.999;

/// A mapping from a schedule name to a sequence of betas for `T` diffusion steps.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BetaSchedule {
	/// Linear schedule from Ho et al., rescaled so that the effective noise magnitude is independent of `T`.
	Linear,
	/// Cosine schedule from Nichol & Dhariwal, capped at [`MAX_COSINE_BETA`].
	Cosine,
	/// Pre-trained betas. The length of the vector determines `T`.
	Trained(Vec<f64>)
}

impl Default for BetaSchedule {
	fn default() -> Self {
		Self::Linear
	}
}

impl fmt::Display for BetaSchedule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BetaSchedule::Linear => f.write_str("linear"),
			BetaSchedule::Cosine => f.write_str("cosine"),
			BetaSchedule::Trained(betas) => write!(f, "trained({})", betas.len())
		}
	}
}

impl FromStr for BetaSchedule {
	type Err = DiffusionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"linear" => Ok(Self::Linear),
			"cosine" => Ok(Self::Cosine),
			other => Err(DiffusionError::UnsupportedSchedule(other.to_string()))
		}
	}
}

impl BetaSchedule {
	/// Produces the betas of this schedule for `num_timesteps` diffusion steps.
	///
	/// # Errors
	/// Fails with [`DiffusionError::InvalidSchedule`] if `num_timesteps` is 0, or if any beta lies outside of `(0, 1)`.
	/// The rescaled linear schedule reaches `beta = 1` at 20 steps and is only valid for longer schedules.
	pub fn betas(&self, num_timesteps: usize) -> anyhow::Result<Array1<f64>> {
		if num_timesteps == 0 {
			return Err(DiffusionError::InvalidSchedule("num_timesteps must be >0".to_string()).into());
		}

		let betas = match self {
			BetaSchedule::Linear => {
				let scale = 1000.0 / num_timesteps as f64;
				Array1::linspace(scale * 0.0001, scale * 0.02, num_timesteps)
			}
			BetaSchedule::Cosine => betas_for_alpha_bar(num_timesteps, cosine_alpha_bar, MAX_COSINE_BETA),
			BetaSchedule::Trained(betas) => Array1::from(betas.clone())
		};
		validate_betas(&betas)?;
		Ok(betas)
	}

	/// The number of steps this schedule dictates on its own, if any.
	pub fn fixed_len(&self) -> Option<usize> {
		match self {
			BetaSchedule::Trained(betas) => Some(betas.len()),
			_ => None
		}
	}
}

/// Gets a pre-defined beta schedule by name.
///
/// # Errors
/// Fails with [`DiffusionError::UnsupportedSchedule`] for any name other than `linear` or `cosine`.
pub fn get_named_beta_schedule(name: &str, num_timesteps: usize) -> anyhow::Result<Array1<f64>> {
	name.parse::<BetaSchedule>()?.betas(num_timesteps)
}

fn cosine_alpha_bar(t: f64) -> f64 {
	((t + 0.008) / 1.008 * FRAC_PI_2).cos().powi(2)
}

/// Creates a beta schedule that discretizes the given `alpha_bar` function, which defines the cumulative product of
/// `(1 - beta)` over time from `t = [0, 1]`.
pub fn betas_for_alpha_bar<F>(num_timesteps: usize, alpha_bar: F, max_beta: f64) -> Array1<f64>
where
	F: Fn(f64) -> f64
{
	(0..num_timesteps)
		.map(|i| {
			let t1 = i as f64 / num_timesteps as f64;
			let t2 = (i + 1) as f64 / num_timesteps as f64;
			(1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
		})
		.collect()
}

pub(crate) fn validate_betas(betas: &Array1<f64>) -> Result<(), DiffusionError> {
	if betas.is_empty() {
		return Err(DiffusionError::InvalidSchedule("betas must not be empty".to_string()));
	}
	if let Some((i, beta)) = betas.iter().enumerate().find(|(_, b)| !(**b > 0.0 && **b < 1.0)) {
		return Err(DiffusionError::InvalidSchedule(format!("beta[{i}] = {beta} is outside of (0, 1)")));
	}
	// every reciprocal table divides by alpha_bar
	if betas.iter().map(|b| 1.0 - b).product::<f64>() <= 0.0 {
		return Err(DiffusionError::InvalidSchedule("cumulative product of (1 - beta) underflows to 0".to_string()));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn linear_schedule_scales_with_length() {
		let betas = get_named_beta_schedule("linear", 1000).unwrap();
		assert_eq!(betas.len(), 1000);
		assert!((betas[0] - 0.0001).abs() < 1e-12);
		assert!((betas[999] - 0.02).abs() < 1e-12);

		let betas = get_named_beta_schedule("linear", 100).unwrap();
		assert!((betas[0] - 0.001).abs() < 1e-12);
		assert!((betas[99] - 0.2).abs() < 1e-12);
	}

	#[test]
	fn cosine_schedule_is_capped() {
		let betas = get_named_beta_schedule("cosine", 4).unwrap();
		assert_eq!(betas.len(), 4);
		for w in betas.windows(2) {
			assert!(w[1] > w[0]);
		}
		assert_eq!(betas[3], MAX_COSINE_BETA);
	}

	#[test]
	fn betas_lie_in_unit_interval() {
		for (name, lengths) in [("linear", [21, 100, 250, 1000, 4000]), ("cosine", [1, 2, 10, 1000, 4000])] {
			for steps in lengths {
				let betas = get_named_beta_schedule(name, steps).unwrap();
				assert_eq!(betas.len(), steps);
				assert!(betas.iter().all(|b| *b > 0.0 && *b < 1.0), "{name}/{steps}");
			}
		}
	}

	#[test]
	fn unknown_schedule_is_rejected() {
		let err = get_named_beta_schedule("sigmoid", 10).unwrap_err();
		assert_eq!(err.downcast_ref::<DiffusionError>(), Some(&DiffusionError::UnsupportedSchedule("sigmoid".to_string())));
	}

	#[test]
	fn trained_betas_are_validated() {
		assert!(BetaSchedule::Trained(vec![0.1, 0.2]).betas(2).is_ok());
		assert!(BetaSchedule::Trained(vec![0.0, 0.2]).betas(2).is_err());
		assert!(BetaSchedule::Trained(vec![0.5, 1.5]).betas(2).is_err());
		assert!(BetaSchedule::Trained(vec![0.5, 1.0]).betas(2).is_err());
		assert!(BetaSchedule::Trained(vec![]).betas(1).is_err());
	}

	#[test]
	fn short_linear_schedules_overflow() {
		// the rescaled end point reaches 1 at 20 steps
		assert!(BetaSchedule::Linear.betas(10).is_err());
		let err = BetaSchedule::Linear.betas(20).unwrap_err();
		assert!(matches!(err.downcast_ref::<DiffusionError>(), Some(DiffusionError::InvalidSchedule(_))));
		assert!(BetaSchedule::Linear.betas(21).is_ok());
		assert!(BetaSchedule::Linear.betas(0).is_err());
	}
}
