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

//! Physics regularization of calibration fields against a Helmholtz-like equation `∇²u + k²u = 0`.

use ndarray::{s, Array1, Array2, ArrayView2, ArrayView3, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::sample::ensure_shape;

/// Weights and channel assignments for [`field_consistency`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FieldConsistencyConfig {
	/// Wavenumber in free space.
	pub wavenumber: f32,
	/// Wavenumber at obstacle pixels.
	pub obstacle_wavenumber: f32,
	/// Weight of the term driving the field to 0 inside obstacles.
	pub boundary_weight: f32,
	/// Weight of the term driving the field to 1 at sources.
	pub source_weight: f32,
	/// The conditioning channel holding the obstacle mask during training.
	pub obstacle_channel: usize,
	/// The conditioning channel holding the source mask during training.
	pub source_channel: usize
}

impl Default for FieldConsistencyConfig {
	fn default() -> Self {
		Self {
			wavenumber: 0.2,
			obstacle_wavenumber: 1.0,
			boundary_weight: 1.0,
			source_weight: 1.0,
			obstacle_channel: 0,
			source_channel: 1
		}
	}
}

/// Computes the physics regularization loss for a batch of `[N, H, W]` calibration fields.
///
/// For each batch element this is the sum of:
/// - the mean squared residual `∇²u + k²u`, where `∇²` is the 5-point Laplacian over interior pixels (zero on the
///   border) and `k` switches to `obstacle_wavenumber` wherever `obstacles` is 1
/// - the mean of `u²` over obstacle pixels, or 0 if there are none
/// - the mean of `(u - 1)²` over pixels where `sources` is 1, or 0 if there are none
///
/// Mask pixels count as marked only when they are exactly 1.
///
/// # Errors
/// Fails with [`DiffusionError::ShapeMismatch`](crate::DiffusionError::ShapeMismatch) if the masks do not have the
/// shape of `calibration`.
pub fn field_consistency(
	calibration: ArrayView3<'_, f32>,
	obstacles: ArrayView3<'_, f32>,
	sources: ArrayView3<'_, f32>,
	config: &FieldConsistencyConfig
) -> anyhow::Result<Array1<f32>> {
	ensure_shape("obstacle mask", calibration.shape(), obstacles.shape())?;
	ensure_shape("source mask", calibration.shape(), sources.shape())?;

	let losses = (0..calibration.len_of(Axis(0)))
		.into_par_iter()
		.map(|i| {
			element_loss(
				calibration.index_axis(Axis(0), i),
				obstacles.index_axis(Axis(0), i),
				sources.index_axis(Axis(0), i),
				config
			)
		})
		.collect::<Vec<_>>();
	Ok(Array1::from(losses))
}

fn element_loss(field: ArrayView2<'_, f32>, obstacles: ArrayView2<'_, f32>, sources: ArrayView2<'_, f32>, config: &FieldConsistencyConfig) -> f32 {
	let (h, w) = field.dim();
	if h == 0 || w == 0 {
		return 0.0;
	}

	let mut laplacian = Array2::<f32>::zeros((h, w));
	if h > 2 && w > 2 {
		let interior = &field.slice(s![2.., 1..-1]) + &field.slice(s![..-2, 1..-1]) + &field.slice(s![1..-1, 2..]) + &field.slice(s![1..-1, ..-2])
			- field.slice(s![1..-1, 1..-1]).mapv(|u| 4.0 * u);
		laplacian.slice_mut(s![1..-1, 1..-1]).assign(&interior);
	}

	let squared_residual = Zip::from(&laplacian).and(&field).and(&obstacles).fold(0.0, |acc, lap, u, obstacle| {
		let k = if *obstacle == 1.0 { config.obstacle_wavenumber } else { config.wavenumber };
		let r = lap + k * k * u;
		acc + r * r
	});
	let pde = squared_residual / (h * w) as f32;

	let boundary = masked_mean(field, obstacles, |u| u * u);
	let source = masked_mean(field, sources, |u| (u - 1.0).powi(2));

	pde + config.boundary_weight * boundary + config.source_weight * source
}

fn masked_mean(field: ArrayView2<'_, f32>, mask: ArrayView2<'_, f32>, f: impl Fn(f32) -> f32) -> f32 {
	let (sum, count) = Zip::from(&field)
		.and(&mask)
		.fold((0.0, 0usize), |(sum, count), u, m| if *m == 1.0 { (sum + f(*u), count + 1) } else { (sum, count) });
	if count == 0 { 0.0 } else { sum / count as f32 }
}
