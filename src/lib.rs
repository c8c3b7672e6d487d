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

//! `condiff` is the mathematical core of a conditional denoising diffusion probabilistic model (DDPM) for
//! image-to-image prediction: a segmentation mask or signal field is generated conditioned on auxiliary channels.
//!
//! The crate covers the noise schedule and its coefficient tables, the forward process and its closed-form posterior,
//! the reverse step that turns a raw network prediction into a denoising distribution, ancestral/DDIM/interpolation
//! samplers, and the training loss and variational-bound evaluation. The network itself is supplied by the caller
//! through the [`DenoisingModel`] trait:
//! ```ignore
//! use condiff::{model_fn, ConditionedSample, DiffusionConfig, GaussianDiffusion, ModelOutput, SampleOptions};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let diffusion = GaussianDiffusion::new(&DiffusionConfig::default())?;
//! let model = model_fn(|input, timesteps| Ok(ModelOutput::new(my_network.run(input, timesteps)?)));
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! let image = ConditionedSample::new(conditioning, target)?;
//! for step in diffusion.ddim_loop_progressive(&model, &image.full_shape(), None, SampleOptions::default().with_steps(50), &mut rng)? {
//! 	let step = step?;
//! 	println!("t = {:?}", step.timesteps);
//! }
//! ```
//!
//! All fallible operations return [`anyhow::Result`]; classified failures can be recovered with
//! `err.downcast_ref::<DiffusionError>()`. Logging goes through [`tracing`]; the crate never installs a subscriber.

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub(crate) mod config;
pub mod diffusion;
pub(crate) mod error;
pub(crate) mod model;
pub(crate) mod sample;
pub mod schedulers;
pub mod solvers;
pub(crate) mod util;

pub use self::config::{ContextMix, DiffusionConfig};
pub use self::diffusion::*;
pub use self::error::DiffusionError;
pub use self::model::*;
pub use self::sample::ConditionedSample;
pub use self::schedulers::*;
pub use self::solvers::*;
pub use self::util::UniformSampler;
