use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::{BetaSchedule, FieldConsistencyConfig, LossType, MeanType, VarType};

/// A fixed linear mix applied to the conditioning channels before the network sees them during training:
/// `context[destination] += factor * context[source]`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContextMix {
	/// The conditioning channel that is modified.
	pub destination: usize,
	/// The conditioning channel added to `destination`.
	pub source: usize,
	/// How much of `source` is added.
	pub factor: f32
}

/// Configuration of a [`GaussianDiffusion`](crate::GaussianDiffusion) engine.
///
/// ```ignore
/// let config = DiffusionConfig::from_json(r#"{ "schedule": "cosine", "num-timesteps": 100, "var-type": "learned-range" }"#)?;
/// let diffusion = GaussianDiffusion::new(&config)?;
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DiffusionConfig {
	/// The noise schedule.
	pub schedule: BetaSchedule,
	/// Ignored for [`BetaSchedule::Trained`], where the number of betas decides.
	pub num_timesteps: usize,
	/// What the network predicts.
	pub mean_type: MeanType,
	/// How the reverse-process variance is obtained.
	pub var_type: VarType,
	/// The training objective.
	pub loss_type: LossType,
	/// Pass timesteps to the network rescaled to `[0, 1000)` regardless of `num_timesteps`.
	pub rescale_timesteps: bool,
	/// Mix applied to the conditioning channels during training.
	pub context_mix: Option<ContextMix>,
	/// Settings of the physics regularization term.
	pub physics: FieldConsistencyConfig,
	/// Sample known images with an external solver instead of the ancestral/DDIM loops.
	pub use_external_solver: bool
}

impl Default for DiffusionConfig {
	fn default() -> Self {
		Self {
			schedule: BetaSchedule::Linear,
			num_timesteps: 1000,
			mean_type: MeanType::Epsilon,
			var_type: VarType::FixedLarge,
			loss_type: LossType::Mse,
			rescale_timesteps: false,
			context_mix: None,
			physics: FieldConsistencyConfig::default(),
			use_external_solver: false
		}
	}
}

impl DiffusionConfig {
	/// Parses a configuration from JSON. Missing fields take their default values.
	pub fn from_json(json: &str) -> anyhow::Result<Self> {
		Ok(serde_json::from_str(json)?)
	}

	/// Reads a JSON configuration.
	pub fn from_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
		Ok(serde_json::from_reader(reader)?)
	}

	/// Serializes this configuration to pretty-printed JSON.
	pub fn to_json(&self) -> anyhow::Result<String> {
		Ok(serde_json::to_string_pretty(self)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_json_uses_defaults() {
		let config = DiffusionConfig::from_json(r#"{ "schedule": "cosine", "num-timesteps": 100, "var-type": "learned-range" }"#).unwrap();
		assert_eq!(config.schedule, BetaSchedule::Cosine);
		assert_eq!(config.num_timesteps, 100);
		assert_eq!(config.var_type, VarType::LearnedRange);
		assert_eq!(config.mean_type, MeanType::Epsilon);
		assert_eq!(config.physics, FieldConsistencyConfig::default());
	}

	#[test]
	fn json_roundtrip() {
		let config = DiffusionConfig {
			schedule: BetaSchedule::Trained(vec![0.1, 0.2, 0.3]),
			context_mix: Some(ContextMix { destination: 0, source: 1, factor: 10.0 }),
			loss_type: LossType::BceDice,
			..Default::default()
		};
		let parsed = DiffusionConfig::from_json(&config.to_json().unwrap()).unwrap();
		assert_eq!(parsed, config);
	}

	#[test]
	fn unknown_schedule_fails_to_parse() {
		assert!(DiffusionConfig::from_json(r#"{ "schedule": "sigmoid" }"#).is_err());
	}
}
