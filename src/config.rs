use crate::{
    common::*,
    model::{
        DiscriminatorInit, GeneratorInit, LossKind, MappingNetworkInit,
        ProgressiveGanInit, Regularization, SynthesisInput, SynthesisNetworkInit,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: Model,
    pub train: Training,
    pub dataset: Dataset,
    pub logging: Logging,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let Self { model, train, .. } = self;

        ensure!(model.max_level >= 1, "max_level must be at least 1");
        ensure!(
            (1..=model.max_level).contains(&train.start_level),
            "start_level must be within [1, {}]",
            model.max_level
        );
        ensure!(
            train.minibatch_size_schedule.len() >= model.max_level,
            "minibatch_size_schedule must cover all {} levels",
            model.max_level
        );
        ensure!(
            (0.0..=1.0).contains(&model.style_mixing_prob.raw()),
            "style_mixing_prob must be within [0, 1]"
        );
        ensure!(
            model.channel_max_pow < model.channel_base_pow,
            "channel_max_pow must be less than channel_base_pow"
        );
        ensure!(
            model.channel_base_pow >= model.max_level,
            "channel_base_pow {} runs out of channels before level {}",
            model.channel_base_pow,
            model.max_level
        );

        if let Regularization::MinibatchStd { group_size } = model.regularization {
            ensure!(group_size > 0, "group_size must be positive");
            for (index, &bsize) in train.minibatch_size_schedule.iter().enumerate() {
                ensure!(
                    bsize.get() % group_size == 0,
                    "minibatch size {} at level {} is not divisible by group size {}",
                    bsize,
                    index + 1,
                    group_size
                );
            }
        }

        if model.regularization == Regularization::AdaptiveNoise
            && model.loss != LossKind::LeastSquares
        {
            warn!("adaptive noise is tuned for the least-squares loss");
        }

        Ok(())
    }

    pub fn minibatch_size(&self, level: usize) -> Result<usize> {
        let size = self
            .train
            .minibatch_size_schedule
            .get(level.wrapping_sub(1))
            .ok_or_else(|| format_err!("no minibatch size for level {}", level))?;
        Ok(size.get())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub latent_size: NonZeroUsize,
    pub style_size: NonZeroUsize,
    pub max_level: usize,
    #[serde(default = "default_channel_base_pow")]
    pub channel_base_pow: usize,
    #[serde(default = "default_channel_max_pow")]
    pub channel_max_pow: usize,
    #[serde(default = "default_mapping_layers")]
    pub mapping_layers: NonZeroUsize,
    #[serde(default = "default_true")]
    pub use_fused_scale: bool,
    #[serde(default = "default_true")]
    pub use_blur: bool,
    #[serde(default = "default_true")]
    pub use_noise: bool,
    #[serde(default = "default_true")]
    pub normalize_latent: bool,
    #[serde(default)]
    pub synthesis_input: SynthesisInput,
    #[serde(default)]
    pub regularization: Regularization,
    #[serde(default = "default_style_mixing_prob")]
    pub style_mixing_prob: R64,
    #[serde(default)]
    pub truncation_psi: Option<R64>,
    #[serde(default)]
    pub loss: LossKind,
}

impl Model {
    pub fn to_init(&self) -> ProgressiveGanInit {
        let Self {
            latent_size,
            style_size,
            max_level,
            channel_base_pow,
            channel_max_pow,
            mapping_layers,
            use_fused_scale,
            use_blur,
            use_noise,
            normalize_latent,
            synthesis_input,
            regularization,
            style_mixing_prob,
            truncation_psi,
            loss: _,
        } = *self;

        ProgressiveGanInit {
            generator: GeneratorInit {
                latent_size: latent_size.get(),
                mapping: MappingNetworkInit {
                    num_layers: mapping_layers.get(),
                    normalize_latent,
                },
                synthesis: SynthesisNetworkInit {
                    style_size: style_size.get(),
                    max_level,
                    channel_base_pow,
                    channel_max_pow,
                    input: synthesis_input,
                    use_blur,
                    use_noise,
                    use_fused_scale,
                },
                style_mixing_prob: style_mixing_prob.raw(),
                truncation_psi: truncation_psi.map(|psi| psi.raw()),
            },
            discriminator: DiscriminatorInit {
                max_level,
                channel_base_pow,
                channel_max_pow,
                use_blur,
                use_fused_scale,
                regularization,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Training {
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    #[serde(default = "default_start_level")]
    pub start_level: usize,
    pub mapping_learning_rate: R64,
    pub synthesis_learning_rate: R64,
    pub discriminator_learning_rate: R64,
    pub minibatch_size_schedule: Vec<NonZeroUsize>,
    pub num_images_per_phase: NonZeroUsize,
    #[serde(default = "default_divergence_threshold")]
    pub divergence_threshold: R64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub image_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub log_dir: PathBuf,
    pub num_steps_to_infer: NonZeroUsize,
    #[serde(default = "default_num_test_samples")]
    pub num_test_samples: NonZeroUsize,
}

fn default_true() -> bool {
    true
}

fn default_channel_base_pow() -> usize {
    11
}

fn default_channel_max_pow() -> usize {
    8
}

fn default_mapping_layers() -> NonZeroUsize {
    NonZeroUsize::new(6).unwrap()
}

fn default_style_mixing_prob() -> R64 {
    r64(0.9)
}

fn default_start_level() -> usize {
    1
}

fn default_divergence_threshold() -> R64 {
    r64(10.0)
}

fn default_num_test_samples() -> NonZeroUsize {
    NonZeroUsize::new(64).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_TEXT: &str = r#"{
        model: {
            latent_size: 256,
            style_size: 256,
            max_level: 7,
            loss: "LeastSquares",
            regularization: "AdaptiveNoise",
        },
        train: {
            device: "cpu",
            mapping_learning_rate: 1e-5,
            synthesis_learning_rate: 1e-3,
            discriminator_learning_rate: 1e-3,
            minibatch_size_schedule: [128, 64, 64, 32, 32, 16, 16],
            num_images_per_phase: 800000,
        },
        dataset: {
            image_dir: "./images",
        },
        logging: {
            log_dir: "./logs",
            num_steps_to_infer: 3000,
        },
    }"#;

    #[test]
    fn parse_config_test() -> Result<()> {
        let config: Config = json5::from_str(CONFIG_TEXT)?;
        config.validate()?;

        ensure!(config.train.device == Device::Cpu);
        ensure!(config.train.start_level == 1);
        ensure!(config.model.loss == LossKind::LeastSquares);
        ensure!(config.model.regularization == Regularization::AdaptiveNoise);
        ensure!(config.model.use_fused_scale && config.model.normalize_latent);
        ensure!(config.train.divergence_threshold == r64(10.0));
        ensure!(config.logging.num_test_samples.get() == 64);
        ensure!(config.minibatch_size(1)? == 128);
        ensure!(config.minibatch_size(7)? == 16);
        ensure!(config.minibatch_size(0).is_err());
        ensure!(config.minibatch_size(8).is_err());

        let init = config.model.to_init();
        ensure!(init.generator.mapping.num_layers == 6);
        ensure!(init.discriminator.max_level == 7);

        Ok(())
    }

    #[test]
    fn invalid_config_test() -> Result<()> {
        let mut config: Config = json5::from_str(CONFIG_TEXT)?;
        config.train.start_level = 8;
        ensure!(config.validate().is_err());

        let mut config: Config = json5::from_str(CONFIG_TEXT)?;
        config.train.minibatch_size_schedule.truncate(6);
        ensure!(config.validate().is_err());

        let mut config: Config = json5::from_str(CONFIG_TEXT)?;
        config.model.regularization = Regularization::MinibatchStd { group_size: 3 };
        ensure!(config.validate().is_err());

        let mut config: Config = json5::from_str(CONFIG_TEXT)?;
        config.model.channel_max_pow = config.model.channel_base_pow;
        ensure!(config.validate().is_err());

        let mut config: Config = json5::from_str(CONFIG_TEXT)?;
        config.model.channel_base_pow = 6;
        config.model.channel_max_pow = 4;
        ensure!(config.validate().is_err());
        config.model.channel_base_pow = 7;
        config.validate()?;

        Ok(())
    }

    #[test]
    fn sample_config_test() -> Result<()> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.json5");
        let config = Config::load(path)?;
        ensure!(config.model.max_level == 7);
        Ok(())
    }
}
