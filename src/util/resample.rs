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

use ndarray::Array1;
use rand::{distributions::Uniform, Rng};

use crate::GaussianDiffusion;

/// Draws training timesteps uniformly over the schedule.
///
/// Every timestep has the same weight, so the importance weights returned alongside each batch are all 1.
#[derive(Debug, Clone)]
pub struct UniformSampler {
	num_timesteps: usize
}

impl UniformSampler {
	/// Creates a sampler over the timesteps of `diffusion`.
	pub fn new(diffusion: &GaussianDiffusion) -> Self {
		Self {
			num_timesteps: diffusion.num_timesteps()
		}
	}

	/// The unnormalized sampling weight of every timestep.
	pub fn weights(&self) -> Array1<f64> {
		Array1::ones(self.num_timesteps)
	}

	/// Draws one timestep per batch element, along with the weight each element's loss should be scaled by.
	pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> (Vec<usize>, Array1<f32>) {
		let distribution = Uniform::new(0, self.num_timesteps);
		let timesteps = (0..batch_size).map(|_| rng.sample(distribution)).collect();
		(timesteps, Array1::ones(batch_size))
	}
}

#[cfg(test)]
mod tests {
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;
	use crate::diffusion::tests::engine;
	use crate::{MeanType, VarType};

	#[test]
	fn covers_the_schedule() {
		let sampler = UniformSampler::new(&engine(20, MeanType::Epsilon, VarType::FixedLarge));
		let mut rng = StdRng::seed_from_u64(42);
		let (timesteps, weights) = sampler.sample(2000, &mut rng);
		assert_eq!(timesteps.len(), 2000);
		assert!(timesteps.iter().all(|t| *t < 20));
		for t in 0..20 {
			assert!(timesteps.contains(&t));
		}
		assert!(weights.iter().all(|w| *w == 1.0));
		assert_eq!(sampler.weights().len(), 20);
	}
}
