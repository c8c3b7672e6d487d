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

use thiserror::Error;

/// Classified failures raised by the diffusion engine.
///
/// All fallible operations in this crate return [`anyhow::Result`]; errors listed here are raised through `anyhow`
/// and can be recovered with `err.downcast_ref::<DiffusionError>()`. Errors returned by a
/// [`DenoisingModel`](crate::DenoisingModel) are propagated as-is and are never converted into one of these
/// variants.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum DiffusionError {
	/// The schedule name is not one of the published schedules.
	#[error("unsupported beta schedule: {0}")]
	UnsupportedSchedule(String),
	/// The beta sequence is empty or contains values outside of `(0, 1)`.
	#[error("invalid beta schedule: {0}")]
	InvalidSchedule(String),
	/// A caller-supplied tensor does not have the shape the operation requires.
	#[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
	ShapeMismatch {
		/// What was being checked.
		what: &'static str,
		/// The required shape.
		expected: Vec<usize>,
		/// The shape that was passed.
		actual: Vec<usize>
	},
	/// A shape argument is empty or malformed.
	#[error("invalid shape: {0}")]
	InvalidShape(String),
	/// A timestep index is outside of `[0, num_timesteps)`.
	#[error("timestep {timestep} is out of bounds for a schedule of {num_timesteps} steps")]
	InvalidTimestep {
		/// The offending index.
		timestep: usize,
		/// The schedule length.
		num_timesteps: usize
	},
	/// A sampling loop finished without yielding a single step.
	#[error("sampling loop did not produce any output")]
	EmptyTrajectory,
	/// The requested combination of parameterizations/objectives is not supported.
	#[error("not implemented: {0}")]
	NotImplemented(String)
}

impl DiffusionError {
	pub(crate) fn shape_mismatch(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
		Self::ShapeMismatch {
			what,
			expected: expected.to_vec(),
			actual: actual.to_vec()
		}
	}
}
