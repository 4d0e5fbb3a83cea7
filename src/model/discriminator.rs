use super::{
    growth::GrowthState,
    misc::{avg_pool2x, lerp, level_channels, Activation},
    modulation::{
        adaptive_noise, adaptive_noise_scale, Blur, MinibatchStdLayer, MinibatchStdLayerInit,
    },
    scaled::{ScaledConv2D, ScaledConv2DInit, ScaledLinear, ScaledLinearInit},
};
use crate::common::*;
use nn::Module as _;

const OUTPUT_MEAN_DECAY: f64 = 0.9;

/// Statistic regularizing the discriminator against mode collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regularization {
    /// Appends a minibatch standard deviation channel before the final block.
    MinibatchStd { group_size: usize },
    /// Multiplies features by noise scaled from the output mean on fakes.
    AdaptiveNoise,
    None,
}

impl Default for Regularization {
    fn default() -> Self {
        Self::MinibatchStd { group_size: 4 }
    }
}

#[derive(Debug, Clone)]
pub struct DiscriminatorInit {
    pub max_level: usize,
    pub channel_base_pow: usize,
    pub channel_max_pow: usize,
    pub use_blur: bool,
    pub use_fused_scale: bool,
    pub regularization: Regularization,
}

impl Default for DiscriminatorInit {
    fn default() -> Self {
        Self {
            max_level: 7,
            channel_base_pow: 11,
            channel_max_pow: 8,
            use_blur: true,
            use_fused_scale: true,
            regularization: Default::default(),
        }
    }
}

impl DiscriminatorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Discriminator> {
        let path = path.borrow();
        let state = GrowthState::new(self.max_level)?;

        let channels = level_channels(self.channel_base_pow, self.channel_max_pow, 1);
        let from_rgb = from_rgb(path / "from_rgb1", channels)?;
        let final_block = FinalBlock::new(path / "final", self.regularization, channels)?;

        Ok(Discriminator {
            init: self,
            state,
            from_rgb_prev: None,
            from_rgb,
            blocks: vec![],
            final_block,
            output_mean: 0.0,
        })
    }
}

/// Growable discriminator mirroring the synthesis network.
#[derive(Debug)]
pub struct Discriminator {
    init: DiscriminatorInit,
    state: GrowthState,
    from_rgb_prev: Option<ScaledConv2D>,
    from_rgb: ScaledConv2D,
    /// Block of level `l` is stored at index `l - 2`.
    blocks: Vec<DiscriminatorBlock>,
    final_block: FinalBlock,
    output_mean: f64,
}

impl Discriminator {
    pub fn state(&self) -> &GrowthState {
        &self.state
    }

    pub fn level(&self) -> usize {
        self.state.level()
    }

    pub fn alpha(&self) -> f64 {
        self.state.alpha()
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.state.set_alpha(alpha);
    }

    pub fn channels(&self, level: usize) -> usize {
        level_channels(self.init.channel_base_pow, self.init.channel_max_pow, level)
    }

    /// Moving average of the scores on generated images.
    pub fn output_mean(&self) -> f64 {
        self.output_mean
    }

    pub fn update_output_mean(&mut self, fake_scores: &Tensor) -> f64 {
        let batch_mean = tch::no_grad(|| f64::from(fake_scores.mean(Kind::Float)));
        self.output_mean =
            OUTPUT_MEAN_DECAY * self.output_mean + (1.0 - OUTPUT_MEAN_DECAY) * batch_mean;
        self.output_mean
    }

    fn noise_scale(&self) -> f64 {
        match self.init.regularization {
            Regularization::AdaptiveNoise => adaptive_noise_scale(self.output_mean),
            _ => 0.0,
        }
    }

    /// Prepends a block for the next level and a new from-image adapter.
    ///
    /// The path must be the one the network was built with.
    pub fn grow<'a>(&mut self, path: impl Borrow<nn::Path<'a>>) -> Result<()> {
        let path = path.borrow();
        let level = self.state.next_level()?;

        let in_c = self.channels(level);
        let out_c = self.channels(level - 1);
        let block = DiscriminatorBlock::new(
            path / format!("block{}", level),
            &self.init,
            in_c,
            out_c,
        )?;
        let from_rgb = from_rgb(path / format!("from_rgb{}", level), in_c)?;

        self.blocks.push(block);
        self.from_rgb_prev = Some(std::mem::replace(&mut self.from_rgb, from_rgb));
        self.state.grow()?;
        debug_assert_eq!(self.blocks.len() + 1, self.state.level());

        Ok(())
    }

    /// Scores a batch of NCHW images at the current resolution, one score per sample.
    pub fn f_forward(&self, input: &Tensor) -> Result<Tensor> {
        let noise_scale = self.noise_scale();

        let xs = match self.f_forward_branches(input, noise_scale)? {
            (None, cur) => cur,
            (Some(prev), cur) => {
                let xs = lerp(&prev, &cur, self.state.alpha());
                let prefix = &self.blocks[..self.blocks.len() - 1];

                prefix
                    .iter()
                    .rev()
                    .try_fold(xs, |xs, block| block.f_forward(&xs, noise_scale))?
            }
        };

        self.final_block.f_forward(&xs, noise_scale)
    }

    /// Returns the features of the downsampled input through the previous
    /// from-image adapter (absent at level 1) and of the full input through
    /// the current adapter and the newest block, before blending.
    pub(crate) fn f_forward_branches(
        &self,
        input: &Tensor,
        noise_scale: f64,
    ) -> Result<(Option<Tensor>, Tensor)> {
        let level = self.state.level();
        let (_, in_c, in_h, in_w) = input.size4()?;
        let resolution = self.state.resolution() as i64;
        ensure!(
            in_c == 3 && in_h == resolution && in_w == resolution,
            "expect [_, 3, {}, {}] images at level {}, but get [_, {}, {}, {}]",
            resolution,
            resolution,
            level,
            in_c,
            in_h,
            in_w
        );

        let last_block = match self.blocks.last() {
            Some(block) => block,
            None => return Ok((None, self.from_rgb.forward(input))),
        };
        let from_rgb_prev = self
            .from_rgb_prev
            .as_ref()
            .ok_or_else(|| format_err!("missing previous from-image adapter"))?;

        let prev = from_rgb_prev.forward(&avg_pool2x(input));
        let cur = last_block.f_forward(&self.from_rgb.forward(input), noise_scale)?;

        Ok((Some(prev), cur))
    }
}

fn from_rgb<'a>(path: impl Borrow<nn::Path<'a>>, out_c: usize) -> Result<ScaledConv2D> {
    ScaledConv2DInit {
        padding: Some(0),
        activation: Activation::LRelu,
        ..Default::default()
    }
    .build(path, 3, out_c, 1)
}

#[derive(Debug)]
struct DiscriminatorBlock {
    conv1: ScaledConv2D,
    blur: Option<Blur>,
    conv2: ScaledConv2D,
    pool: bool,
}

impl DiscriminatorBlock {
    fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: &DiscriminatorInit,
        in_c: usize,
        out_c: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        let conv1 = ScaledConv2DInit::default().build(path / "conv1", in_c, out_c, 3)?;
        let conv2 = ScaledConv2DInit {
            stride: if init.use_fused_scale { 2 } else { 1 },
            ..Default::default()
        }
        .build(path / "conv2", out_c, out_c, 3)?;
        let blur = init.use_blur.then(|| Blur::new(out_c, path.device()));

        Ok(Self {
            conv1,
            blur,
            conv2,
            pool: !init.use_fused_scale,
        })
    }

    fn f_forward(&self, xs: &Tensor, noise_scale: f64) -> Result<Tensor> {
        let xs = adaptive_noise(xs, noise_scale)?;
        let xs = self.conv1.forward(&xs);
        let xs = match &self.blur {
            Some(blur) => blur.f_forward(&xs)?,
            None => xs,
        };
        let xs = adaptive_noise(&xs, noise_scale)?;
        let xs = self.conv2.forward(&xs);
        Ok(if self.pool { avg_pool2x(&xs) } else { xs })
    }
}

#[derive(Debug)]
struct FinalBlock {
    mbstd: Option<MinibatchStdLayer>,
    conv1: ScaledConv2D,
    conv2: ScaledConv2D,
    dense: ScaledLinear,
}

impl FinalBlock {
    fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        regularization: Regularization,
        channels: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        let mbstd = match regularization {
            Regularization::MinibatchStd { group_size } => {
                Some(MinibatchStdLayerInit { group_size }.build()?)
            }
            _ => None,
        };
        let in_c = channels + mbstd.iter().count();

        let conv1 = ScaledConv2DInit::default().build(path / "conv1", in_c, channels, 3)?;
        let conv2 = ScaledConv2DInit {
            padding: Some(0),
            ..Default::default()
        }
        .build(path / "conv2", channels, channels, 4)?;
        let dense = ScaledLinearInit {
            activation: Activation::Linear,
            gain: 1.0,
        }
        .build(path / "dense", channels, 1)?;

        Ok(Self {
            mbstd,
            conv1,
            conv2,
            dense,
        })
    }

    fn f_forward(&self, xs: &Tensor, noise_scale: f64) -> Result<Tensor> {
        let xs = match &self.mbstd {
            Some(mbstd) => mbstd.f_forward(xs)?,
            None => xs.shallow_clone(),
        };
        let xs = adaptive_noise(&xs, noise_scale)?;
        let xs = self.conv1.forward(&xs);
        let xs = adaptive_noise(&xs, noise_scale)?;
        let xs = self.conv2.forward(&xs).flatten(1, -1);
        self.dense.f_forward(&xs)
    }
}
