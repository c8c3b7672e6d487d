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

//! Fast ODE solvers implementing [`ExternalSolver`](crate::ExternalSolver).
//!
//! The engine never picks a solver on its own; callers pass one to
//! [`GaussianDiffusion::sample_known`](crate::GaussianDiffusion::sample_known) when the engine is configured with
//! `use_external_solver`.

cfg_if::cfg_if! {
	if #[cfg(feature = "dpm-solver")] {
		mod dpm_solver;
		pub use self::dpm_solver::*;
	}
}
