use crate::data::PoseBatch;
use crate::engine::{Engine, EngineState, Event, Process, SampleProvider};
use crate::handlers::{attach_common_handlers, CommonOptions, NetworkSet};
use crate::loss::{adversarial_loss, mask_l1_loss, prediction_mean, Target};
use crate::metrics::MetricsRecord;
use crate::model::{Discriminator, Generator, ModelConfig};
use crate::pool::ImagePool;
use crate::utils::{fill_template, ImageGrid, Visualizer, TRAIN_IMG_FNAME, VAL_IMG_FNAME};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{CompactRecorder, FileRecorder};
use burn::tensor::backend::AutodiffBackend;
use burn::train::Interrupter;
use std::path::{Path, PathBuf};

/// Stage-2 training configuration, saved as `config.json` in the output directory.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub output_dir: String,
    /// Checkpoint of the already trained stage-1 generator.
    pub generator_1_path: String,
    #[config(default = 2e-5)]
    pub g_lr: f64,
    #[config(default = 2e-5)]
    pub d_lr: f64,
    #[config(default = 0.5)]
    pub beta1: f64,
    #[config(default = 0.999)]
    pub beta2: f64,
    #[config(default = 10.0)]
    pub mask_l1_loss_lambda: f64,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 100)]
    pub epochs: usize,
    #[config(default = 1)]
    pub save_interval: usize,
    #[config(default = 5)]
    pub n_saved: usize,
    #[config(default = 100)]
    pub print_freq: usize,
    #[config(default = 100)]
    pub visual_freq: usize,
    /// Size of the fake image history fed to the discriminator; 0 disables it.
    #[config(default = 0)]
    pub pool_size: usize,
    /// Smooth logged metrics over this many iterations instead of the whole run.
    pub smoothing_window: Option<usize>,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("batch_size must be at least 1"));
        }
        if self.n_saved == 0 {
            return Err(anyhow::anyhow!("n_saved must be at least 1"));
        }
        if self.print_freq == 0 {
            return Err(anyhow::anyhow!("print_freq must be at least 1"));
        }
        Ok(())
    }

    fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta1 as f32)
            .with_beta_2(self.beta2 as f32)
            .with_epsilon(1e-8)
    }
}

/// Mean discriminator probabilities seen during one step.
#[derive(Clone, Debug, PartialEq)]
pub struct Predictions {
    /// D(condition ⊕ composite) during the generator update.
    pub g_fake: f64,
    pub d_fake: f64,
    pub d_real: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Losses {
    pub g_bce: f64,
    pub g_l1: f64,
    pub g_total: f64,
    pub d_real: f64,
    pub d_fake: f64,
    pub d_total: f64,
}

/// Scalars of one generator-2 update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneratorUpdate {
    pub pred_fake: f64,
    pub bce: f64,
    pub l1: f64,
    pub total: f64,
}

/// Scalars of one discriminator update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiscriminatorUpdate {
    pub pred_real: f64,
    pub pred_fake: f64,
    pub real: f64,
    pub fake: f64,
    pub total: f64,
}

/// Host-side scalars produced by one [`Stage2Step`].
#[derive(Clone, Debug, PartialEq)]
pub struct Stage2Output {
    pub predictions: Predictions,
    pub losses: Losses,
}

impl MetricsRecord for Stage2Output {
    fn scalars(&self) -> Vec<(String, f64)> {
        let Predictions {
            g_fake,
            d_fake,
            d_real,
        } = self.predictions;
        let losses = &self.losses;
        [
            ("pred_G_fake", g_fake),
            ("pred_D_fake", d_fake),
            ("pred_D_real", d_real),
            ("loss_G", losses.g_total),
            ("loss_G_bce", losses.g_bce),
            ("loss_G_l1", losses.g_l1),
            ("loss_D", losses.d_total),
            ("loss_D_real", losses.d_real),
            ("loss_D_fake", losses.d_fake),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

/// The three images of the two-stage pipeline.
#[derive(Clone, Debug)]
pub struct Generated<B: Backend> {
    /// Stage-1 output.
    pub coarse: Tensor<B, 4>,
    /// Stage-2 difference map.
    pub residual: Tensor<B, 4>,
    pub composite: Tensor<B, 4>,
}

impl<B: Backend> Generated<B> {
    pub fn refine(
        generator_2: &Generator<B>,
        condition_image: Tensor<B, 4>,
        coarse: Tensor<B, 4>,
    ) -> Self {
        let residual = generator_2.forward(Tensor::cat(vec![condition_image, coarse.clone()], 1));
        let composite = coarse.clone() + residual.clone();
        Self {
            coarse,
            residual,
            composite,
        }
    }

    pub fn images(&self) -> Vec<Tensor<B, 4>> {
        vec![
            self.coarse.clone(),
            self.residual.clone(),
            self.composite.clone(),
        ]
    }
}

impl<B: AutodiffBackend> Generated<B> {
    pub fn inner(&self) -> Generated<B::InnerBackend> {
        Generated {
            coarse: self.coarse.clone().inner(),
            residual: self.residual.clone().inner(),
            composite: self.composite.clone().inner(),
        }
    }
}

/// One PG2 stage-2 update: the frozen stage-1 generator proposes a coarse
/// image, generator 2 refines it, then generator 2 and the discriminator take
/// one Adam step each, in that order.
pub struct Stage2Step<B: AutodiffBackend> {
    config: TrainingConfig,
    output_dir: PathBuf,
    generator_1: Generator<B::InnerBackend>,
    generator_2: Generator<B>,
    discriminator: Discriminator<B>,
    optim_g2: OptimizerAdaptor<Adam, Generator<B>, B>,
    optim_d: OptimizerAdaptor<Adam, Discriminator<B>, B>,
    fake_pool: ImagePool<B::InnerBackend>,
    visualizer: Box<dyn Visualizer<B::InnerBackend>>,
    validation: Option<PoseBatch<B::InnerBackend>>,
}

impl<B: AutodiffBackend> Stage2Step<B> {
    pub fn new(
        config: TrainingConfig,
        generator_1: Generator<B::InnerBackend>,
        visualizer: Box<dyn Visualizer<B::InnerBackend>>,
        validation: Option<PoseBatch<B::InnerBackend>>,
        device: &B::Device,
    ) -> Self {
        let generator_2 = config.model.init_generator_2::<B>(device);
        let discriminator = config.model.init_discriminator::<B>(device);
        let optim_g2 = config.adam().init::<B, Generator<B>>();
        let optim_d = config.adam().init::<B, Discriminator<B>>();
        let fake_pool = ImagePool::new(config.pool_size, config.seed);

        Self {
            output_dir: PathBuf::from(&config.output_dir),
            config,
            generator_1,
            generator_2,
            discriminator,
            optim_g2,
            optim_d,
            fake_pool,
            visualizer,
            validation,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn generator_2(&self) -> &Generator<B> {
        &self.generator_2
    }

    pub fn discriminator(&self) -> &Discriminator<B> {
        &self.discriminator
    }

    /// Run both generators. Stage 1 runs without tracking gradients.
    pub fn generate(
        &self,
        condition_image: Tensor<B, 4>,
        condition_pose: Tensor<B, 4>,
    ) -> Generated<B> {
        let input = Tensor::cat(
            vec![condition_image.clone().inner(), condition_pose.inner()],
            1,
        );
        let coarse = Tensor::from_inner(self.generator_1.forward(input));
        Generated::refine(&self.generator_2, condition_image, coarse)
    }

    /// Write the held-out batch through both generators to `epoch_{epoch}.png`.
    pub fn render_validation(&self, epoch: usize) -> Result<()> {
        let Some(batch) = self.validation.as_ref() else {
            return Ok(());
        };
        let generator_2 = self.generator_2.valid();
        let coarse = self.generator_1.forward(Tensor::cat(
            vec![batch.condition_image.clone(), batch.condition_pose.clone()],
            1,
        ));
        let generated = Generated::refine(&generator_2, batch.condition_image.clone(), coarse);
        let path = self.output_dir.join(fill_template(VAL_IMG_FNAME, epoch, 0));
        self.visualizer
            .render(&path, batch, &generated.images())
            .with_context(|| format!("failed to render validation sample {}", path.display()))
    }

    /// One Adam step on generator 2: fool the discriminator on `fake_pair`
    /// and match the target inside the mask. Only generator 2 moves.
    pub fn update_generator_2(
        &mut self,
        batch: &PoseBatch<B>,
        generated: &Generated<B>,
        fake_pair: Tensor<B, 4>,
    ) -> GeneratorUpdate {
        let logits = self.discriminator.forward(fake_pair);
        let bce = adversarial_loss(logits.clone(), Target::Real);
        let l1 = mask_l1_loss(
            generated.composite.clone(),
            batch.target_image.clone(),
            batch.target_mask.clone(),
        );
        let total = bce.clone() + l1.clone().mul_scalar(self.config.mask_l1_loss_lambda);

        let grads = total.backward();
        let grads = GradientsParams::from_grads(grads, &self.generator_2);
        self.generator_2 = self
            .optim_g2
            .step(self.config.g_lr, self.generator_2.clone(), grads);

        GeneratorUpdate {
            pred_fake: prediction_mean(logits),
            bce: scalar(bce),
            l1: scalar(l1),
            total: scalar(total),
        }
    }

    /// One Adam step on the discriminator: real pairs against `fake_pair`,
    /// which is detached and routed through the image pool first.
    pub fn update_discriminator(
        &mut self,
        batch: &PoseBatch<B>,
        fake_pair: Tensor<B, 4>,
    ) -> DiscriminatorUpdate {
        let real_pair = Tensor::cat(
            vec![batch.condition_image.clone(), batch.target_image.clone()],
            1,
        );
        let fake_pair = Tensor::from_inner(self.fake_pool.query(fake_pair.detach().inner()));

        let real_logits = self.discriminator.forward(real_pair);
        let fake_logits = self.discriminator.forward(fake_pair);
        let real = adversarial_loss(real_logits.clone(), Target::Real);
        let fake = adversarial_loss(fake_logits.clone(), Target::Fake);
        let total = (real.clone() + fake.clone()).mul_scalar(0.5);

        let grads = total.backward();
        let grads = GradientsParams::from_grads(grads, &self.discriminator);
        self.discriminator = self
            .optim_d
            .step(self.config.d_lr, self.discriminator.clone(), grads);

        DiscriminatorUpdate {
            pred_real: prediction_mean(real_logits),
            pred_fake: prediction_mean(fake_logits),
            real: scalar(real),
            fake: scalar(fake),
            total: scalar(total),
        }
    }

    fn check_spatial_size(&self, batch: &PoseBatch<B>) -> Result<()> {
        let [_, _, height, width] = batch.condition_image.dims();
        let multiple = self.config.model.spatial_multiple();
        if height % multiple != 0 || width % multiple != 0 {
            return Err(anyhow::anyhow!(
                "image size {height}x{width} is not divisible by {multiple}"
            ));
        }
        Ok(())
    }
}

impl<B: AutodiffBackend> Process for Stage2Step<B> {
    type Input = PoseBatch<B>;
    type Output = Stage2Output;

    fn step(&mut self, state: &EngineState, batch: PoseBatch<B>) -> Result<Stage2Output> {
        batch.validate()?;
        self.check_spatial_size(&batch)?;

        let generated = self.generate(
            batch.condition_image.clone(),
            batch.condition_pose.clone(),
        );
        let fake_pair = Tensor::cat(
            vec![batch.condition_image.clone(), generated.composite.clone()],
            1,
        );
        let fake_pair_detached = fake_pair.clone().detach();
        let generator_2 = self.update_generator_2(&batch, &generated, fake_pair);
        let discriminator = self.update_discriminator(&batch, fake_pair_detached);

        if self.config.visual_freq > 0 && state.iteration % self.config.visual_freq == 0 {
            let path = self
                .output_dir
                .join(fill_template(TRAIN_IMG_FNAME, state.epoch, state.iteration));
            self.visualizer
                .render(&path, &batch.inner(), &generated.inner().images())
                .with_context(|| format!("failed to render {}", path.display()))?;
        }

        Ok(Stage2Output {
            predictions: Predictions {
                g_fake: generator_2.pred_fake,
                d_fake: discriminator.pred_fake,
                d_real: discriminator.pred_real,
            },
            losses: Losses {
                g_bce: generator_2.bce,
                g_l1: generator_2.l1,
                g_total: generator_2.total,
                d_real: discriminator.real,
                d_fake: discriminator.fake,
                d_total: discriminator.total,
            },
        })
    }
}

impl<B: AutodiffBackend> NetworkSet for Stage2Step<B> {
    fn network_names(&self) -> Vec<String> {
        vec!["G2".to_string(), "D".to_string()]
    }

    fn save_network(&self, name: &str, stem: &Path) -> Result<PathBuf> {
        let recorder = CompactRecorder::new();
        match name {
            "G2" => self
                .generator_2
                .clone()
                .save_file(stem.to_path_buf(), &recorder),
            "D" => self
                .discriminator
                .clone()
                .save_file(stem.to_path_buf(), &recorder),
            other => return Err(anyhow::anyhow!("unknown network {other}")),
        }
        .with_context(|| format!("failed to save {name}"))?;
        Ok(stem.with_extension(<CompactRecorder as FileRecorder<B>>::file_extension()))
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// Load the trained stage-1 generator.
pub fn load_generator_1<B: Backend>(
    model: &ModelConfig,
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<Generator<B>> {
    let path = path.as_ref();
    model
        .init_generator_1::<B>(device)
        .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
        .with_context(|| format!("failed to load generator 1 weights from {}", path.display()))
}

/// Stage-2 part of the progress line.
pub fn add_message(state: &EngineState) -> String {
    format!(
        " | G_loss(all/bce/l1): {:.4}/{:.4}/{:.4} | D_loss(all/fake/real): {:.4}/{:.4}/{:.4} | Pred(G2_fake/D_fake/D_real): {:.4}/{:.4}/{:.4}",
        state.metric("loss_G"),
        state.metric("loss_G_bce"),
        state.metric("loss_G_l1"),
        state.metric("loss_D"),
        state.metric("loss_D_fake"),
        state.metric("loss_D_real"),
        state.metric("pred_G_fake"),
        state.metric("pred_D_fake"),
        state.metric("pred_D_real"),
    )
}

/// Wrap `step` in an engine with the common handlers plus the per-epoch
/// validation sample.
pub fn build_trainer<B: AutodiffBackend>(step: Stage2Step<B>) -> Result<Engine<Stage2Step<B>>> {
    let config = step.config().clone();
    let options = CommonOptions {
        output_dir: PathBuf::from(&config.output_dir),
        epochs: config.epochs,
        print_freq: config.print_freq,
        save_interval: config.save_interval,
        n_saved: config.n_saved,
        output_templates: vec![VAL_IMG_FNAME.to_string(), TRAIN_IMG_FNAME.to_string()],
    };

    let mut engine = Engine::new(step).with_smoothing_window(config.smoothing_window);
    attach_common_handlers(&mut engine, &options, add_message)?;
    engine.add_event_handler(Event::EpochCompleted, |ctx| {
        ctx.process.render_validation(ctx.state.epoch)
    });
    Ok(engine)
}

/// Train generator 2 and the discriminator for `config.epochs` passes over `data`.
///
/// `interrupter` stops the run gracefully; pass one wired up with
/// [`install_interrupt_handler`](crate::engine::install_interrupt_handler) to
/// react to Ctrl-C. The same interrupter can be reused across calls.
pub fn train<B, D>(
    config: TrainingConfig,
    data: &mut D,
    validation: Option<PoseBatch<B::InnerBackend>>,
    interrupter: &Interrupter,
    device: B::Device,
) -> Result<EngineState>
where
    B: AutodiffBackend,
    D: SampleProvider<Item = PoseBatch<B>>,
{
    config.validate()?;
    let output_dir = PathBuf::from(&config.output_dir);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    config
        .save(output_dir.join("config.json"))
        .context("failed to save config.json")?;

    B::seed(&device, config.seed);

    let generator_1 = load_generator_1::<B::InnerBackend>(
        &config.model,
        &config.generator_1_path,
        &device,
    )?;
    log::info!("loaded generator 1 from {}", config.generator_1_path);

    let step = Stage2Step::<B>::new(
        config.clone(),
        generator_1,
        Box::new(ImageGrid),
        validation,
        &device,
    );
    let mut engine = build_trainer(step)?.with_interrupter(interrupter.clone());

    let state = engine.run(data, config.epochs)?;
    log::info!(
        "training finished after {} epochs, {} iterations",
        state.epoch,
        state.iteration
    );
    Ok(state.clone())
}
