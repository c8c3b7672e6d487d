use condiff::{
	field_consistency, model_fn, BetaSchedule, ConditionedSample, DiffusionConfig, FieldConsistencyConfig, GaussianDiffusion, LossType, MeanType,
	ModelOutput, UniformSampler, VarType
};
use ndarray::{Array, Array3, Array4};
use rand::{rngs::StdRng, SeedableRng};

#[test]
fn empty_masks_leave_only_the_pde_term() {
	let field = Array::from_shape_fn((2, 6, 6), |(b, h, w)| ((b + 1) as f32 * (h as f32 * 0.4 + w as f32 * 0.3)).sin());
	let masks = Array3::<f32>::zeros((2, 6, 6));
	let config = FieldConsistencyConfig::default();
	let loss = field_consistency(field.view(), masks.view(), masks.view(), &config).unwrap();

	let unweighted = FieldConsistencyConfig {
		boundary_weight: 0.0,
		source_weight: 0.0,
		..config
	};
	let pde = field_consistency(field.view(), masks.view(), masks.view(), &unweighted).unwrap();
	assert_eq!(loss, pde);
	assert!(loss.iter().all(|v| *v > 0.0));
}

#[test]
fn training_with_sampled_timesteps() {
	let diffusion = GaussianDiffusion::new(&DiffusionConfig {
		num_timesteps: 100,
		var_type: VarType::LearnedRange,
		loss_type: LossType::RescaledMse,
		..Default::default()
	})
	.unwrap();
	let sampler = UniformSampler::new(&diffusion);
	let mut rng = StdRng::seed_from_u64(11);
	let (timesteps, weights) = sampler.sample(4, &mut rng);

	let context = Array::from_shape_fn((4, 2, 8, 8), |(_, c, h, w)| if c == 0 { (h < 2) as u8 as f32 } else { (h == 5 && w == 5) as u8 as f32 });
	let target = Array::from_shape_fn((4, 1, 8, 8), |(_, _, h, w)| if h + w > 7 { 1.0 } else { -1.0 });
	let x = ConditionedSample::new(context, target).unwrap();
	let model = model_fn(|input, _| {
		let (n, _, h, w) = input.dim();
		Ok(ModelOutput::new(Array4::from_elem((n, 2, h, w), 0.05)).with_calibration(Array4::from_elem((n, 1, h, w), 0.5)))
	});

	let losses = diffusion.training_step(&model, &x, &timesteps, None, &mut rng).unwrap();
	let weighted = &losses.loss * &weights;
	assert_eq!(weighted.len(), 4);
	assert!(weighted.iter().all(|v| v.is_finite() && *v > 0.0));
	assert!(losses.vb.is_some());
	let physics = losses.physics.unwrap();
	let calibration_loss = losses.calibration_loss.unwrap();
	for (c, p) in calibration_loss.iter().zip(physics.iter()) {
		// 0.5 against 28 pixels at 1 and 36 at -1
		assert!((c - p - 1.375).abs() < 1e-5);
	}
}

#[test]
fn full_bound_of_a_short_schedule() {
	let diffusion = GaussianDiffusion::new(&DiffusionConfig {
		schedule: BetaSchedule::Cosine,
		num_timesteps: 8,
		mean_type: MeanType::StartX,
		var_type: VarType::FixedSmall,
		..Default::default()
	})
	.unwrap();
	let x = ConditionedSample::unconditional(Array::from_shape_fn((2, 1, 4, 4), |(b, _, h, w)| if (b + h * w) % 2 == 0 { 1.0 } else { -1.0 })).unwrap();
	let oracle = model_fn(|_, _| Ok(ModelOutput::new(x.target.clone())));
	let mut rng = StdRng::seed_from_u64(2);

	let bound = diffusion.full_bound(&oracle, &x, true, &mut rng).unwrap();
	assert_eq!(bound.vb.dim(), (2, 8));
	// an oracle for the clean target has zero error and matches the true posterior exactly
	assert!(bound.xstart_mse.iter().all(|v| *v == 0.0));
	for t in 1..8 {
		assert!(bound.vb.column(t).iter().all(|v| v.abs() < 1e-4), "t={t}");
	}
	for i in 0..2 {
		assert!((bound.total_bpd[i] - bound.vb.row(i).sum() - bound.prior_bpd[i]).abs() < 1e-4);
	}
}
