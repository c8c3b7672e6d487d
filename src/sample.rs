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

use ndarray::{concatenate, s, Array4, ArrayView4, Axis, Ix4};

use crate::DiffusionError;

/// A batch of multi-channel images split into fixed conditioning channels and the single channel undergoing
/// diffusion.
///
/// The network always sees `[context..., target]` concatenated along the channel axis; the diffusion process only
/// ever touches `target`. Both halves share the batch and spatial dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionedSample {
	/// Conditioning channels, shape `[N, C - 1, H, W]`. May have zero channels for unconditional models.
	pub context: Array4<f32>,
	/// The diffused channel, shape `[N, 1, H, W]`.
	pub target: Array4<f32>
}

impl ConditionedSample {
	/// Pairs conditioning channels with a target channel.
	///
	/// # Errors
	/// Fails with [`DiffusionError::ShapeMismatch`] if `target` does not have exactly one channel or the batch/spatial
	/// dimensions of the two halves differ.
	pub fn new(context: Array4<f32>, target: Array4<f32>) -> anyhow::Result<Self> {
		let (n, c, h, w) = target.dim();
		if c != 1 {
			return Err(DiffusionError::shape_mismatch("target channel", &[n, 1, h, w], target.shape()).into());
		}
		let (cn, cc, ch, cw) = context.dim();
		if (cn, ch, cw) != (n, h, w) {
			return Err(DiffusionError::shape_mismatch("conditioning channels", &[n, cc, h, w], context.shape()).into());
		}
		Ok(Self { context, target })
	}

	/// A sample with no conditioning channels.
	pub fn unconditional(target: Array4<f32>) -> anyhow::Result<Self> {
		let (n, _, h, w) = target.dim();
		Self::new(Array4::zeros((n, 0, h, w)), target)
	}

	/// Splits a full `[N, C, H, W]` tensor; the last channel becomes the target.
	///
	/// # Errors
	/// Fails with [`DiffusionError::InvalidShape`] if the tensor has no channels.
	pub fn split(full: ArrayView4<'_, f32>) -> anyhow::Result<Self> {
		let channels = full.dim().1;
		if channels == 0 {
			return Err(DiffusionError::InvalidShape("sample must have at least one channel".to_string()).into());
		}
		Ok(Self {
			context: full.slice(s![.., ..channels - 1, .., ..]).to_owned(),
			target: full.slice(s![.., channels - 1.., .., ..]).to_owned()
		})
	}

	/// Concatenates the conditioning channels and the target into the full network input.
	pub fn concat(&self) -> Array4<f32> {
		concatenate![Axis(1), self.context, self.target]
	}

	/// Returns a copy of this sample with its target replaced.
	///
	/// # Panics
	/// Panics if `target` does not have the shape of the current target.
	pub fn with_target(&self, target: Array4<f32>) -> Self {
		assert_eq!(target.shape(), self.target.shape(), "target shape must be preserved");
		Self {
			context: self.context.clone(),
			target
		}
	}

	/// The batch size `N`.
	#[inline]
	pub fn batch_size(&self) -> usize {
		self.target.dim().0
	}

	/// The shape of the target channel.
	#[inline]
	pub fn target_dim(&self) -> Ix4 {
		self.target.raw_dim()
	}

	/// The shape of the full network input.
	pub fn full_shape(&self) -> [usize; 4] {
		let (n, c, h, w) = self.context.dim();
		[n, c + 1, h, w]
	}
}

/// Checks a caller-supplied `[N, C, H, W]` shape argument.
pub(crate) fn validate_shape(shape: &[usize]) -> Result<[usize; 4], DiffusionError> {
	match shape {
		[n, c, h, w] if [*n, *c, *h, *w].iter().all(|d| *d > 0) => Ok([*n, *c, *h, *w]),
		[_, _, _, _] => Err(DiffusionError::InvalidShape(format!("all dimensions of {shape:?} must be >0"))),
		_ => Err(DiffusionError::InvalidShape(format!("expected a 4-dimensional [N, C, H, W] shape, got {shape:?}")))
	}
}

/// Checks that `actual` has exactly the shape `expected`.
pub(crate) fn ensure_shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<(), DiffusionError> {
	if expected != actual {
		return Err(DiffusionError::shape_mismatch(what, expected, actual));
	}
	Ok(())
}
