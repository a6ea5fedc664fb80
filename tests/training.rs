use burn::backend::{Autodiff, NdArray};
use burn::data::dataloader::DataLoaderBuilder;
use burn::data::dataset::InMemDataset;
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::TensorData;
use burn::train::Interrupter;
use pg2_burn::data::{InMemoryProvider, PoseBatch, PoseBatcher, PoseSample};
use pg2_burn::engine::{EngineState, Event, Process};
use pg2_burn::handlers::{read_metrics_log, LOGS_FNAME};
use pg2_burn::metrics::MetricsRecord;
use pg2_burn::model::{Discriminator, Generator, ModelConfig};
use pg2_burn::training::{build_trainer, train, Stage2Step, TrainingConfig};
use pg2_burn::utils::ImageGrid;
use std::path::Path;

type InnerBackend = NdArray<f32>;
type TestBackend = Autodiff<InnerBackend>;

const SIZE: usize = 16;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tiny_model() -> ModelConfig {
    ModelConfig::new()
        .with_generator_1_dim(4)
        .with_generator_1_depth(2)
        .with_generator_2_dim(4)
        .with_generator_2_depth(2)
        .with_discriminator_dim(4)
        .with_discriminator_depth(2)
}

fn config(dir: &Path) -> TrainingConfig {
    TrainingConfig::new(
        tiny_model(),
        dir.to_string_lossy().into_owned(),
        dir.join("G1").to_string_lossy().into_owned(),
    )
    .with_batch_size(2)
    .with_visual_freq(1000)
}

fn constant_batch(condition: f32, target: f32, mask: f32) -> PoseBatch<TestBackend> {
    let device = Default::default();
    let shape = [2, 3, SIZE, SIZE];
    PoseBatch {
        condition_image: Tensor::full(shape, condition, &device),
        condition_pose: Tensor::full([2, 18, SIZE, SIZE], -1.0, &device),
        target_image: Tensor::full(shape, target, &device),
        target_mask: Tensor::full(shape, mask, &device),
        target_image_2: Tensor::full(shape, target, &device),
        path_condition: vec!["0001_c1s1_001051_00.jpg".into(), "0002_c1s1_000451_03.jpg".into()],
        path_target: vec!["0001_c1s1_001151_00.jpg".into(), "0002_c1s1_000551_01.jpg".into()],
    }
}

fn step(config: TrainingConfig) -> Stage2Step<TestBackend> {
    let device = Default::default();
    let generator_1 = config.model.init_generator_1::<InnerBackend>(&device);
    Stage2Step::new(config, generator_1, Box::new(ImageGrid), None, &device)
}

fn save_generator_1(config: &TrainingConfig) {
    config
        .model
        .init_generator_1::<InnerBackend>(&Default::default())
        .save_file(&config.generator_1_path, &CompactRecorder::new())
        .unwrap();
}

fn sample(value: f32, name: &str) -> PoseSample {
    let image = |channels: usize, value: f32| {
        TensorData::new(vec![value; channels * SIZE * SIZE], [channels, SIZE, SIZE])
    };
    PoseSample {
        condition_image: image(3, value),
        condition_pose: image(18, -1.0),
        target_image: image(3, -value),
        target_mask: image(3, 1.0),
        target_image_2: image(3, -value),
        path_condition: format!("{name}_c1s1_000001_00.jpg"),
        path_target: format!("{name}_c1s1_000101_00.jpg"),
    }
}

fn generator_output(generator: &Generator<TestBackend>, value: f32) -> Vec<f32> {
    let input = Tensor::full([1, 6, SIZE, SIZE], value, &Default::default());
    generator.valid().forward(input).into_data().to_vec().unwrap()
}

fn discriminator_output(discriminator: &Discriminator<TestBackend>, value: f32) -> Vec<f32> {
    let input = Tensor::full([1, 6, SIZE, SIZE], value, &Default::default());
    discriminator.valid().forward(input).into_data().to_vec().unwrap()
}

fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(prefix))
        .collect();
    names.sort();
    names
}

#[test]
fn constant_batch_losses_follow_the_definitions() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut step = step(config(dir.path()));
    let batch = constant_batch(0.0, 1.0, 1.0);

    // Full mask: the masked L1 is the plain mean absolute error.
    let expected_l1 = step
        .generate(batch.condition_image.clone(), batch.condition_pose.clone())
        .composite
        .sub_scalar(1.0)
        .abs()
        .mean()
        .into_scalar()
        .elem::<f64>();

    let state = EngineState {
        epoch: 1,
        iteration: 1,
        max_epochs: 1,
        ..Default::default()
    };
    let output = step.step(&state, batch).unwrap();
    let losses = &output.losses;

    assert!(losses.g_l1 > 0.0);
    assert!((losses.g_l1 - expected_l1).abs() < 1e-4, "{} vs {expected_l1}", losses.g_l1);
    assert!((losses.g_total - (losses.g_bce + 10.0 * losses.g_l1)).abs() < 1e-3);
    assert!((losses.d_total - 0.5 * (losses.d_real + losses.d_fake)).abs() < 1e-5);
    for (name, value) in output.scalars() {
        assert!(value.is_finite(), "{name} = {value}");
    }
    for probability in [
        output.predictions.g_fake,
        output.predictions.d_fake,
        output.predictions.d_real,
    ] {
        assert!((0.0..=1.0).contains(&probability));
    }
}

#[test]
fn repeated_steps_keep_losses_finite() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut step = step(config(dir.path()).with_pool_size(4));
    for iteration in 1..=4 {
        let state = EngineState {
            epoch: 1,
            iteration,
            max_epochs: 1,
            ..Default::default()
        };
        let output = step.step(&state, constant_batch(0.5, -0.5, 1.0)).unwrap();
        assert!(output.scalars().iter().all(|(_, value)| value.is_finite()));
    }
}

#[test]
fn mismatched_batch_is_rejected_before_any_update() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut step = step(config(dir.path()));
    let mut batch = constant_batch(0.0, 1.0, 1.0);
    batch.target_mask = Tensor::ones([1, 3, SIZE, SIZE], &Default::default());
    assert!(step.step(&EngineState::default(), batch).is_err());
}

#[test]
fn interrupt_after_iteration_five_saves_one_exception_checkpoint() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).with_save_interval(1).with_print_freq(1);
    let mut engine = build_trainer(step(config)).unwrap();
    let interrupter = engine.interrupter();
    engine.add_event_handler(Event::IterationCompleted, move |ctx| {
        if ctx.state.iteration == 5 {
            interrupter.stop(Some("test"));
        }
        Ok(())
    });

    let batches = (0..3).map(|_| constant_batch(0.0, 1.0, 1.0)).collect();
    let state = engine
        .run(&mut InMemoryProvider::new(batches), 4)
        .unwrap()
        .clone();

    assert_eq!(state.iteration, 5);
    assert_eq!(state.epoch, 2);
    assert_eq!(
        files_with_prefix(dir.path(), "networks_exception_G2_"),
        vec!["networks_exception_G2_5.mpk"]
    );
    assert_eq!(
        files_with_prefix(dir.path(), "networks_exception_D_"),
        vec!["networks_exception_D_5.mpk"]
    );
    // the regular epoch-1 checkpoint is still there
    assert_eq!(
        files_with_prefix(dir.path(), "networks_G2_"),
        vec!["networks_G2_3.mpk"]
    );
}

#[test]
fn three_epochs_log_one_header_and_one_row_per_iteration() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = config(dir.path())
        .with_epochs(3)
        .with_print_freq(1)
        .with_n_saved(2)
        .with_visual_freq(3);

    save_generator_1(&config);

    let batches = vec![constant_batch(0.0, 1.0, 1.0), constant_batch(-0.5, 0.5, 1.0)];
    let validation = constant_batch(0.25, 0.75, 1.0).inner();
    let mut data = InMemoryProvider::shuffled(batches, 3);

    let state = train::<TestBackend, _>(
        config,
        &mut data,
        Some(validation),
        &Interrupter::new(),
        device,
    )
    .unwrap();
    assert_eq!(state.epoch, 3);
    assert_eq!(state.iteration, 6);

    let logs = std::fs::read_to_string(dir.path().join(LOGS_FNAME)).unwrap();
    assert_eq!(logs.lines().count(), 7);
    assert_eq!(logs.lines().filter(|line| line.starts_with("loss_D")).count(), 1);
    let table = read_metrics_log(&dir.path().join(LOGS_FNAME)).unwrap();
    assert_eq!(table.columns.len(), 9);
    assert_eq!(table.rows.len(), 6);
    assert!(table.rows.iter().all(|row| row.len() == table.columns.len()));

    assert!(dir.path().join("config.json").exists());
    assert!(dir.path().join("state.json").exists());
    for epoch in 1..=3 {
        assert!(dir.path().join(format!("epoch_{epoch:04}.png")).exists());
    }
    assert!(dir.path().join("train_img/epoch_0002_0003.png").exists());
    assert!(dir.path().join("train_img/epoch_0003_0006.png").exists());
    assert_eq!(
        files_with_prefix(dir.path(), "networks_G2_"),
        vec!["networks_G2_4.mpk", "networks_G2_6.mpk"]
    );
    #[cfg(feature = "plot")]
    assert!(dir.path().join("plot.svg").exists());
}

#[test]
fn generator_1_is_frozen_and_each_update_moves_only_its_network() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut step = step(config(dir.path()).with_g_lr(1e-2).with_d_lr(1e-2));
    let batch = constant_batch(0.2, -0.4, 1.0);
    let coarse = |step: &Stage2Step<TestBackend>| -> Vec<f32> {
        step.generate(batch.condition_image.clone(), batch.condition_pose.clone())
            .coarse
            .inner()
            .into_data()
            .to_vec()
            .unwrap()
    };

    let coarse_before = coarse(&step);
    let g2_before = generator_output(step.generator_2(), 0.3);

    let generated = step.generate(batch.condition_image.clone(), batch.condition_pose.clone());
    let fake_pair = Tensor::cat(
        vec![batch.condition_image.clone(), generated.composite.clone()],
        1,
    );
    let fake_pair_detached = fake_pair.clone().detach();

    step.update_generator_2(&batch, &generated, fake_pair);
    let g2_after_update = generator_output(step.generator_2(), 0.3);
    assert_ne!(g2_before, g2_after_update);

    let d_before = discriminator_output(step.discriminator(), 0.3);
    step.update_discriminator(&batch, fake_pair_detached);
    assert_ne!(d_before, discriminator_output(step.discriminator(), 0.3));
    assert_eq!(generator_output(step.generator_2(), 0.3), g2_after_update);

    let state = EngineState {
        epoch: 1,
        iteration: 2,
        max_epochs: 1,
        ..Default::default()
    };
    step.step(&state, batch.clone()).unwrap();
    assert_eq!(coarse(&step), coarse_before);
}

#[test]
fn train_can_run_twice_with_one_interrupter_and_a_data_loader() {
    init_logger();
    let interrupter = Interrupter::new();

    let first = tempfile::tempdir().unwrap();
    let first_config = config(first.path()).with_epochs(1);
    save_generator_1(&first_config);
    let mut data = InMemoryProvider::new(vec![constant_batch(0.0, 1.0, 1.0)]);
    let state = train::<TestBackend, _>(
        first_config,
        &mut data,
        None,
        &interrupter,
        Default::default(),
    )
    .unwrap();
    assert_eq!(state.iteration, 1);

    // a request left over from the previous run does not leak into the next one
    interrupter.stop(Some("stale"));

    let second = tempfile::tempdir().unwrap();
    let second_config = config(second.path()).with_epochs(2);
    save_generator_1(&second_config);
    let samples = (0..5).map(|i| sample(i as f32 / 5.0, &format!("{i:04}"))).collect();
    let mut loader = DataLoaderBuilder::<TestBackend, PoseSample, PoseBatch<TestBackend>>::new(
        PoseBatcher,
    )
    .batch_size(2)
    .shuffle(9)
    .set_device(Default::default())
    .build(InMemDataset::new(samples));

    let state = train::<TestBackend, _>(
        second_config,
        &mut loader,
        None,
        &interrupter,
        Default::default(),
    )
    .unwrap();
    assert_eq!(state.epoch, 2);
    assert_eq!(state.iteration, 6);
    let table = read_metrics_log(&second.path().join(LOGS_FNAME)).unwrap();
    assert!(!table.rows.is_empty());
}
