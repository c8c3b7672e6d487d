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

use ndarray::{Array1, ArrayView1};
use num_traits::Float;

/// Caches the last bracket found, since lookups are mostly monotone.
#[derive(Debug, Default)]
pub struct InterpolationAccelerator {
	pub(crate) cache: usize,
	pub(crate) hit_count: usize,
	pub(crate) miss_count: usize
}

pub(super) fn bsearch<F: Float>(xarr: &ArrayView1<'_, F>, x: F, idx_low: usize, idx_high: usize) -> usize {
	let mut ilow = idx_low;
	let mut ihigh = idx_high;

	while ihigh > ilow + 1 {
		let i = (ihigh + ilow) / 2;
		if xarr[i] > x {
			ihigh = i;
		} else {
			ilow = i;
		}
	}
	ilow
}

pub(super) fn accel_find<F: Float>(xarr: &ArrayView1<'_, F>, x: F, acc: &mut InterpolationAccelerator) -> usize {
	let xidx = acc.cache;

	if x < xarr[xidx] {
		acc.miss_count += 1;
		acc.cache = bsearch(xarr, x, 0, xidx);
	} else if x >= xarr[xidx + 1] {
		acc.miss_count += 1;
		acc.cache = bsearch(xarr, x, xidx, xarr.len() - 1);
	} else {
		acc.hit_count += 1;
	}
	acc.cache
}

/// Piecewise-linear interpolation over sorted knots `x`, holding the end values outside of the knot range.
///
/// The last bracket is cached between calls, so keep one interpolator around for a sweep of lookups.
#[derive(Debug)]
pub struct LinearInterpolator<F> {
	x: Array1<F>,
	y: Array1<F>,
	acc: InterpolationAccelerator
}

impl<F: Float> LinearInterpolator<F> {
	/// # Panics
	/// Panics if `x` and `y` differ in length or hold fewer than two knots.
	pub fn new(x: Array1<F>, y: Array1<F>) -> Self {
		assert_eq!(x.len(), y.len());
		assert!(x.len() >= 2, "interpolation needs at least two knots");
		Self {
			x,
			y,
			acc: InterpolationAccelerator::default()
		}
	}

	pub fn eval(&mut self, x: F) -> F {
		let last = self.x.len() - 1;
		if x <= self.x[0] {
			return self.y[0];
		}
		if x >= self.x[last] {
			return self.y[last];
		}

		let idx = accel_find(&self.x.view(), x, &mut self.acc);

		let x_l = self.x[idx];
		let x_h = self.x[idx + 1];
		let y_l = self.y[idx];
		let y_h = self.y[idx + 1];
		let dx = x_h - x_l;
		if dx > F::zero() { y_l + (x - x_l) / dx * (y_h - y_l) } else { y_l }
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array1;

	use super::*;

	#[test]
	fn interpolates_and_clamps() {
		let x = Array1::from(vec![0.0f64, 0.5, 1.0]);
		let y = Array1::from(vec![0.0f64, 1.0, 3.0]);
		let mut interp = LinearInterpolator::new(x, y);
		assert_eq!(interp.eval(0.25), 0.5);
		assert_eq!(interp.eval(0.75), 2.0);
		assert_eq!(interp.eval(0.1), 0.2);
		assert_eq!(interp.eval(-1.0), 0.0);
		assert_eq!(interp.eval(2.0), 3.0);
		assert!(interp.acc.hit_count + interp.acc.miss_count > 0);
	}

	#[test]
	fn monotone_sweeps_reuse_the_cached_bracket() {
		let x = Array1::linspace(0.0f64, 1.0, 11);
		let y = x.mapv(|v| v * v);
		let mut interp = LinearInterpolator::new(x, y);
		for i in (1..100).rev() {
			let t = i as f64 / 100.0;
			assert!((interp.eval(t) - t * t).abs() < 5e-3);
		}
		// one miss per bracket crossed, hits everywhere else
		assert!(interp.acc.miss_count <= 10);
		assert!(interp.acc.hit_count >= 89);
	}
}
