use crate::{
    common::*,
    config,
    dataset::ImageLoader,
    logging::{grid_rows, image_grid},
    message as msg,
    model::{
        level_resolution, nchw_to_nhwc, nhwc_to_nchw, GanLoss, LossKind, PhaseSchedule,
        ProgressiveGan, Transition,
    },
};

const ADAM_BETA1: f64 = 0.0;
const ADAM_BETA2: f64 = 0.99;

#[derive(Debug, Clone, Copy)]
pub struct LearningRates {
    pub mapping: f64,
    pub synthesis: f64,
    pub discriminator: f64,
}

#[derive(Debug)]
pub struct StepOutput {
    pub generator_loss: f64,
    pub discriminator_loss: f64,
    /// Set when the update was skipped due to a diverging loss.
    pub skipped: bool,
    /// Generated images of this step, NHWC, detached.
    pub fake: Tensor,
}

/// Performs adversarial updates on a progressive GAN.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Trainer {
    gan: ProgressiveGan,
    loss_kind: LossKind,
    loss: Box<dyn GanLoss>,
    divergence_threshold: f64,
    #[derivative(Debug = "ignore")]
    mapping_opt: nn::Optimizer,
    #[derivative(Debug = "ignore")]
    synthesis_opt: nn::Optimizer,
    #[derivative(Debug = "ignore")]
    discriminator_opt: nn::Optimizer,
}

impl Trainer {
    pub fn new(
        gan: ProgressiveGan,
        loss_kind: LossKind,
        learning_rates: LearningRates,
        divergence_threshold: f64,
    ) -> Result<Self> {
        let mapping_opt = adam(gan.mapping_vs(), learning_rates.mapping)?;
        let synthesis_opt = adam(gan.synthesis_vs(), learning_rates.synthesis)?;
        let discriminator_opt = adam(gan.discriminator_vs(), learning_rates.discriminator)?;

        Ok(Self {
            gan,
            loss_kind,
            loss: loss_kind.build(),
            divergence_threshold,
            mapping_opt,
            synthesis_opt,
            discriminator_opt,
        })
    }

    pub fn gan(&self) -> &ProgressiveGan {
        &self.gan
    }

    pub fn level(&self) -> usize {
        self.gan.level()
    }

    pub fn alpha(&self) -> f64 {
        self.gan.alpha()
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.gan.set_alpha(alpha);
    }

    /// Grows both networks.
    ///
    /// The optimizers pick up the new block parameters with fresh moment
    /// estimates on their next step, while existing parameters keep theirs.
    pub fn grow(&mut self) -> Result<usize> {
        self.gan.grow()
    }

    /// Output mean estimate, reported only for the least-squares loss.
    pub fn output_mean(&self) -> Option<f64> {
        (self.loss_kind == LossKind::LeastSquares)
            .then(|| self.gan.discriminator().output_mean())
    }

    /// Runs one generator and one discriminator update on a NHWC batch of
    /// real images in `[-1, 1]`.
    pub fn step(&mut self, real: &Tensor) -> Result<StepOutput> {
        let (bsize, height, width, _) = real.size4()?;
        let resolution = self.gan.resolution() as i64;
        ensure!(
            height == resolution && width == resolution,
            "expect {}x{} images at level {}, but get {}x{}",
            resolution,
            resolution,
            self.gan.level(),
            height,
            width
        );
        let device = self.gan.device();
        let real = nhwc_to_nchw(&real.to_device(device));

        // generator pass
        let (fake, loss_g) = {
            let latents = self
                .gan
                .generator()
                .sample_latents(bsize as usize, device);
            let fake = self.gan.generator().f_forward_t(&latents, true)?;
            let fake_scores = self.gan.discriminator().f_forward(&fake)?;
            self.gan.discriminator_mut().update_output_mean(&fake_scores);
            let loss_g = self.loss.generator_loss(&fake_scores);
            (fake, loss_g)
        };

        // discriminator pass on detached fakes
        let fake = fake.detach();
        let loss_d = {
            let real_scores = self.gan.discriminator().f_forward(&real)?;
            let fake_scores = self.gan.discriminator().f_forward(&fake)?;
            self.gan.discriminator_mut().update_output_mean(&fake_scores);
            self.loss.discriminator_loss(&real_scores, &fake_scores)
        };

        let generator_loss = f64::from(&loss_g);
        let discriminator_loss = f64::from(&loss_d);
        let threshold = self.divergence_threshold;
        let skipped = !(generator_loss <= threshold && discriminator_loss <= threshold);

        if !skipped {
            self.mapping_opt.zero_grad();
            self.synthesis_opt.zero_grad();
            loss_g.backward();
            self.mapping_opt.step();
            self.synthesis_opt.step();

            // drops gradients the generator loss left on the discriminator
            self.discriminator_opt.zero_grad();
            loss_d.backward();
            self.discriminator_opt.step();
        }

        Ok(StepOutput {
            generator_loss,
            discriminator_loss,
            skipped,
            fake: nchw_to_nhwc(&fake),
        })
    }

    /// Renders an image grid from fixed latents at the current level.
    pub fn infer_grid(&self, latents: &Tensor, rows: usize) -> Result<Tensor> {
        let images = self.gan.generator().f_generate(latents)?;
        image_grid(&images, rows)
    }

    /// Detached CPU copies of every parameter, safe to read after later updates.
    pub fn parameter_snapshot(&self) -> Vec<(String, Tensor)> {
        tch::no_grad(|| {
            self.gan
                .named_parameters()
                .into_iter()
                .map(|(name, tensor)| {
                    let copy = tensor.detach().to_device(Device::Cpu).copy();
                    (name, copy)
                })
                .collect()
        })
    }
}

fn adam(vs: &nn::VarStore, lr: f64) -> Result<nn::Optimizer> {
    Ok(nn::adam(ADAM_BETA1, ADAM_BETA2, 0.0).build(vs, lr)?)
}

/// Largest row count not above the square root that evenly divides `num`.
fn square_grid_rows(num: usize) -> usize {
    let mut rows = (num as f64).sqrt().floor().max(1.0) as usize;
    while num % rows != 0 {
        rows -= 1;
    }
    rows
}

pub fn training_worker(
    config: Arc<config::Config>,
    log_tx: mpsc::Sender<msg::LogMessage>,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let config::Config {
        ref model,
        ref train,
        ref dataset,
        ref logging,
    } = *config;
    let device = train.device;

    let mut loader = ImageLoader::open(&dataset.image_dir, device)?;
    let gan = model.to_init().build(device)?;
    let mut trainer = Trainer::new(
        gan,
        model.loss,
        LearningRates {
            mapping: train.mapping_learning_rate.raw(),
            synthesis: train.synthesis_learning_rate.raw(),
            discriminator: train.discriminator_learning_rate.raw(),
        },
        train.divergence_threshold.raw(),
    )?;

    for _ in 1..train.start_level {
        trainer.grow()?;
    }
    trainer.set_alpha(1.0);
    info!("start training at level {}", trainer.level());

    let max_level = model.max_level;
    let num_steps_to_infer = logging.num_steps_to_infer.get();
    let mut schedule = PhaseSchedule::new(train.num_images_per_phase.get())?;
    let test_latents = trainer
        .gan()
        .generator()
        .sample_latents(logging.num_test_samples.get(), device);
    let test_rows = square_grid_rows(logging.num_test_samples.get());

    macro_rules! send {
        ($msg:expr) => {
            if log_tx.blocking_send($msg).is_err() {
                warn!("logging worker stopped, stop training");
                return Ok(());
            }
        };
    }

    send!(msg::LogMessage::Parameters {
        step: 0,
        parameters: trainer.parameter_snapshot(),
    });

    for step in 1.. {
        if let Some(alpha) = schedule.alpha() {
            trainer.set_alpha(alpha);
        }

        let level = trainer.level();
        let bsize = config.minibatch_size(level)?;

        let minibatch = {
            let instant = Instant::now();
            let minibatch =
                runtime.block_on(loader.minibatch(bsize, level_resolution(level)))?;
            debug!("minibatch load: {:?}", instant.elapsed());
            minibatch
        };

        let output = {
            let instant = Instant::now();
            let output = trainer.step(&minibatch)?;
            debug!("train: {:?}", instant.elapsed());
            output
        };
        let StepOutput {
            generator_loss,
            discriminator_loss,
            skipped,
            ref fake,
        } = output;

        info!(
            "step: {}, level: {}, alpha: {:.4}, g: {:.5}, d: {:.5}",
            step,
            level,
            trainer.alpha(),
            generator_loss,
            discriminator_loss
        );

        if skipped {
            warn!("skip update at step {} due to large loss", step);
            let rows = grid_rows(bsize);
            send!(msg::LogMessage::Image {
                step,
                tag: "large_loss/real".into(),
                grid: image_grid(&minibatch, rows)?,
            });
            send!(msg::LogMessage::Image {
                step,
                tag: "large_loss/fake".into(),
                grid: image_grid(fake, rows)?,
            });
        }

        send!(msg::LogMessage::Loss {
            step,
            level,
            alpha: trainer.alpha(),
            generator_loss,
            discriminator_loss,
            output_mean: trainer.output_mean(),
        });

        let mut should_infer = step % num_steps_to_infer == 0;

        match schedule.record(bsize, level, max_level) {
            Transition::Continue => {}
            Transition::Stabilize => {
                trainer.set_alpha(1.0);
                info!("start stabilizing level {}", trainer.level());
            }
            Transition::Grow => {
                trainer.grow()?;
                trainer.set_alpha(0.0);
                info!("start fading level {}", trainer.level());
                should_infer = true;
            }
        }

        if should_infer {
            let level = trainer.level();
            send!(msg::LogMessage::Image {
                step,
                tag: format!("lv{}", level),
                grid: trainer.infer_grid(&test_latents, test_rows)?,
            });
            send!(msg::LogMessage::Parameters {
                step,
                parameters: trainer.parameter_snapshot(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DiscriminatorInit, GeneratorInit, MappingNetworkInit, ProgressiveGanInit, Regularization,
        SynthesisNetworkInit,
    };
    use std::collections::HashMap;

    fn small_gan() -> Result<ProgressiveGan> {
        ProgressiveGanInit {
            generator: GeneratorInit {
                latent_size: 16,
                mapping: MappingNetworkInit {
                    num_layers: 2,
                    ..Default::default()
                },
                synthesis: SynthesisNetworkInit {
                    style_size: 16,
                    max_level: 2,
                    channel_base_pow: 5,
                    channel_max_pow: 4,
                    ..Default::default()
                },
                ..Default::default()
            },
            discriminator: DiscriminatorInit {
                max_level: 2,
                channel_base_pow: 5,
                channel_max_pow: 4,
                regularization: Regularization::MinibatchStd { group_size: 2 },
                ..Default::default()
            },
        }
        .build(Device::Cpu)
    }

    fn rates() -> LearningRates {
        LearningRates {
            mapping: 1e-3,
            synthesis: 1e-3,
            discriminator: 1e-3,
        }
    }

    fn snapshot(trainer: &Trainer) -> HashMap<String, Tensor> {
        trainer
            .gan()
            .named_parameters()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.copy()))
            .collect()
    }

    fn changed_groups(before: &HashMap<String, Tensor>, trainer: &Trainer) -> Vec<String> {
        trainer
            .gan()
            .named_parameters()
            .into_iter()
            // the style average moves on every training forward pass
            .filter(|(name, _)| !name.ends_with("w_avg"))
            .filter(|(name, tensor)| match before.get(name) {
                Some(prev) => !prev.equal(tensor),
                None => false,
            })
            .filter_map(|(name, _)| name.split('/').next().map(String::from))
            .unique()
            .sorted()
            .collect()
    }

    fn real_batch(bsize: i64, resolution: i64) -> Tensor {
        Tensor::rand(&[bsize, resolution, resolution, 3], FLOAT_CPU) * 2.0 - 1.0
    }

    #[test]
    fn trainer_step_test() -> Result<()> {
        let mut trainer = Trainer::new(small_gan()?, LossKind::LeastSquares, rates(), 1e9)?;
        let before = snapshot(&trainer);

        let output = trainer.step(&real_batch(4, 4))?;
        ensure!(!output.skipped);
        ensure!(output.generator_loss.is_finite() && output.discriminator_loss.is_finite());
        ensure!(output.fake.size() == vec![4, 4, 4, 3]);
        ensure!(trainer.output_mean().is_some());

        let groups = changed_groups(&before, &trainer);
        ensure!(
            groups == vec!["discriminator", "mapping", "synthesis"],
            "unexpected updated groups {:?}",
            groups
        );

        // wrong resolution
        ensure!(trainer.step(&real_batch(4, 8)).is_err());

        Ok(())
    }

    #[test]
    fn divergence_guard_test() -> Result<()> {
        // every loss exceeds a negative threshold
        let mut trainer = Trainer::new(small_gan()?, LossKind::NonSaturating, rates(), -1.0)?;
        let before = snapshot(&trainer);

        let output = trainer.step(&real_batch(4, 4))?;
        ensure!(output.skipped);
        ensure!(trainer.output_mean().is_none());

        let groups = changed_groups(&before, &trainer);
        ensure!(groups.is_empty(), "parameters changed in {:?}", groups);

        Ok(())
    }

    #[test]
    fn output_mean_per_pass_test() -> Result<()> {
        // a skipped step leaves the discriminator untouched, so the fake
        // scores can be recomputed afterwards
        let mut trainer = Trainer::new(small_gan()?, LossKind::LeastSquares, rates(), -1.0)?;
        let output = trainer.step(&real_batch(4, 4))?;
        ensure!(output.skipped);

        let fake = nhwc_to_nchw(&output.fake);
        let score = f64::from(trainer.gan().discriminator().f_forward(&fake)?.mean(Kind::Float));

        // the generator and the discriminator pass both update the estimate,
        // 0.9 * (0.1 * s) + 0.1 * s
        let output_mean = trainer
            .output_mean()
            .ok_or_else(|| format_err!("expect an output mean"))?;
        ensure!(
            (output_mean - 0.19 * score).abs() < 1e-5,
            "expect {}, but get {}",
            0.19 * score,
            output_mean
        );

        Ok(())
    }

    #[test]
    fn trainer_grow_test() -> Result<()> {
        let mut trainer = Trainer::new(small_gan()?, LossKind::NonSaturating, rates(), 1e9)?;
        trainer.step(&real_batch(4, 4))?;

        ensure!(trainer.grow()? == 2);
        trainer.set_alpha(0.5);
        ensure!(trainer.gan().in_sync());

        let before = snapshot(&trainer);
        let output = trainer.step(&real_batch(4, 8))?;
        ensure!(output.fake.size() == vec![4, 8, 8, 3]);

        // new block parameters are trained right after growth
        let after: HashMap<_, _> = trainer.gan().named_parameters().into_iter().collect();
        for name in ["synthesis/to_rgb2.weight", "discriminator/from_rgb2.weight"] {
            let prev = before
                .get(name)
                .ok_or_else(|| format_err!("missing parameter {}", name))?;
            let next = after
                .get(name)
                .ok_or_else(|| format_err!("missing parameter {}", name))?;
            ensure!(!prev.equal(next), "{} is not updated", name);
        }

        ensure!(trainer.grow().is_err());

        let grid = trainer.infer_grid(&trainer.gan().generator().sample_latents(4, Device::Cpu), 2)?;
        ensure!(grid.size() == vec![1, 3, 20, 20]);

        // snapshots do not alias the live parameters
        let snapshot = trainer.parameter_snapshot();
        let (_, to_rgb) = snapshot
            .iter()
            .find(|(name, _)| name == "synthesis/to_rgb2.weight")
            .ok_or_else(|| format_err!("missing to_rgb2 snapshot"))?;
        ensure!(!to_rgb.requires_grad());
        let saved = to_rgb.copy();
        trainer.step(&real_batch(4, 8))?;
        ensure!(to_rgb.equal(&saved));

        Ok(())
    }

    #[test]
    fn square_grid_rows_test() {
        assert_eq!(square_grid_rows(64), 8);
        assert_eq!(square_grid_rows(32), 4);
        assert_eq!(square_grid_rows(7), 1);
        assert_eq!(square_grid_rows(1), 1);
    }
}
