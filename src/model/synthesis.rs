use super::{
    growth::GrowthState,
    misc::{level_channels, lerp, lrelu, upsample2x, Activation},
    modulation::{AdaIn, Blur, NoiseInjection},
    scaled::{
        ScaledConv2D, ScaledConv2DInit, ScaledConvTranspose2D, ScaledConvTranspose2DInit,
        ScaledLinear, ScaledLinearInit, DEFAULT_GAIN,
    },
};
use crate::common::*;
use nn::Module as _;

const BASE_RESOLUTION: i64 = 4;
const IMAGE_CHANNELS: usize = 3;

/// Source of the 4x4 feature map entering the base block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynthesisInput {
    /// A learned constant shared by every sample.
    Const,
    /// A dense projection of the first style vector.
    Style,
}

impl Default for SynthesisInput {
    fn default() -> Self {
        Self::Const
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisNetworkInit {
    pub style_size: usize,
    pub max_level: usize,
    pub channel_base_pow: usize,
    pub channel_max_pow: usize,
    pub input: SynthesisInput,
    pub use_blur: bool,
    pub use_noise: bool,
    pub use_fused_scale: bool,
}

impl Default for SynthesisNetworkInit {
    fn default() -> Self {
        Self {
            style_size: 256,
            max_level: 7,
            channel_base_pow: 11,
            channel_max_pow: 8,
            input: SynthesisInput::Const,
            use_blur: true,
            use_noise: true,
            use_fused_scale: false,
        }
    }
}

impl SynthesisNetworkInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<SynthesisNetwork> {
        let path = path.borrow();
        let state = GrowthState::new(self.max_level)?;
        ensure!(self.style_size > 0);

        let channels = level_channels(self.channel_base_pow, self.channel_max_pow, 1);
        let base = BaseBlock::new(path / "base", &self, channels)?;
        let to_rgb = to_rgb(path / "to_rgb1", channels)?;

        Ok(SynthesisNetwork {
            init: self,
            state,
            base,
            blocks: vec![],
            to_rgb_prev: None,
            to_rgb,
        })
    }
}

/// Growable image synthesis network.
///
/// Blocks are appended one per level and never rebuilt. Only the to-image
/// adapter is swapped at each growth, with the replaced adapter kept for
/// blending during the fade-in.
#[derive(Debug)]
pub struct SynthesisNetwork {
    init: SynthesisNetworkInit,
    state: GrowthState,
    base: BaseBlock,
    blocks: Vec<SynthesisBlock>,
    to_rgb_prev: Option<ScaledConv2D>,
    to_rgb: ScaledConv2D,
}

impl SynthesisNetwork {
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

    /// Appends a block for the next level and a new to-image adapter.
    ///
    /// The path must be the one the network was built with.
    pub fn grow<'a>(&mut self, path: impl Borrow<nn::Path<'a>>) -> Result<()> {
        let path = path.borrow();
        let level = self.state.next_level()?;

        let in_c = self.channels(level - 1);
        let out_c = self.channels(level);
        let block = SynthesisBlock::new(path / format!("block{}", level), &self.init, in_c, out_c)?;
        let to_rgb = to_rgb(path / format!("to_rgb{}", level), out_c)?;

        self.blocks.push(block);
        self.to_rgb_prev = Some(std::mem::replace(&mut self.to_rgb, to_rgb));
        self.state.grow()?;
        debug_assert_eq!(self.blocks.len() + 1, self.state.level());

        Ok(())
    }

    /// Renders NCHW images from per-level style vectors.
    ///
    /// `styles[l - 1]` drives the modulation of level `l`, so at least
    /// `level` style tensors are expected.
    pub fn f_forward(&self, styles: &[Tensor]) -> Result<Tensor> {
        match self.f_forward_branches(styles)? {
            (None, cur) => Ok(cur),
            (Some(prev), cur) => Ok(lerp(&prev, &cur, self.state.alpha())),
        }
    }

    /// Returns the upsampled previous-level image (absent at level 1) and
    /// the current-level image before blending.
    pub(crate) fn f_forward_branches(
        &self,
        styles: &[Tensor],
    ) -> Result<(Option<Tensor>, Tensor)> {
        let level = self.state.level();
        ensure!(
            styles.len() >= level,
            "expect at least {} style tensors, but get {}",
            level,
            styles.len()
        );

        let xs = self.base.f_forward(&styles[0])?;

        let (last_block, prefix) = match self.blocks.split_last() {
            Some(split) => split,
            None => return Ok((None, self.to_rgb.forward(&xs))),
        };

        let xs = izip!(prefix, &styles[1..])
            .try_fold(xs, |xs, (block, styles)| block.f_forward(&xs, styles))?;

        let prev = {
            let to_rgb_prev = self
                .to_rgb_prev
                .as_ref()
                .ok_or_else(|| format_err!("missing previous to-image adapter"))?;
            upsample2x(&to_rgb_prev.forward(&xs))?
        };
        let cur = {
            let xs = last_block.f_forward(&xs, &styles[level - 1])?;
            self.to_rgb.forward(&xs)
        };

        Ok((Some(prev), cur))
    }
}

fn to_rgb<'a>(path: impl Borrow<nn::Path<'a>>, in_c: usize) -> Result<ScaledConv2D> {
    ScaledConv2DInit {
        padding: Some(0),
        activation: Activation::Linear,
        gain: 1.0,
        ..Default::default()
    }
    .build(path, in_c, IMAGE_CHANNELS, 1)
}

fn conv3x3<'a>(path: impl Borrow<nn::Path<'a>>, in_c: usize, out_c: usize) -> Result<ScaledConv2D> {
    ScaledConv2DInit {
        activation: Activation::Linear,
        ..Default::default()
    }
    .build(path, in_c, out_c, 3)
}

/// Optional noise, activation and modulation following every convolution.
#[derive(Debug)]
struct StyleStage {
    noise: Option<NoiseInjection>,
    ada_in: AdaIn,
}

impl StyleStage {
    fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: &SynthesisNetworkInit,
        channels: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        let noise = init
            .use_noise
            .then(|| NoiseInjection::new(path / "noise", channels));
        let ada_in = AdaIn::new(path / "ada_in", channels, init.style_size)?;
        Ok(Self { noise, ada_in })
    }

    fn f_forward(&self, xs: &Tensor, styles: &Tensor) -> Result<Tensor> {
        let xs = match &self.noise {
            Some(noise) => noise.f_forward(xs)?,
            None => xs.shallow_clone(),
        };
        self.ada_in.f_forward(&lrelu(&xs), styles)
    }
}

#[derive(Debug)]
enum BaseInput {
    Const(Tensor),
    Style(ScaledLinear),
}

#[derive(Debug)]
struct BaseBlock {
    input: BaseInput,
    channels: i64,
    stage1: StyleStage,
    conv: ScaledConv2D,
    stage2: StyleStage,
}

impl BaseBlock {
    fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: &SynthesisNetworkInit,
        channels: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        let input = match init.input {
            SynthesisInput::Const => BaseInput::Const(path.var(
                "const",
                &[1, channels as i64, BASE_RESOLUTION, BASE_RESOLUTION],
                nn::Init::Const(1.0),
            )),
            SynthesisInput::Style => BaseInput::Style(
                ScaledLinearInit {
                    gain: DEFAULT_GAIN / 4.0,
                    ..Default::default()
                }
                .build(
                    path / "input",
                    init.style_size,
                    channels * (BASE_RESOLUTION * BASE_RESOLUTION) as usize,
                )?,
            ),
        };

        Ok(Self {
            input,
            channels: channels as i64,
            stage1: StyleStage::new(path / "stage1", init, channels)?,
            conv: conv3x3(path / "conv", channels, channels)?,
            stage2: StyleStage::new(path / "stage2", init, channels)?,
        })
    }

    fn f_forward(&self, styles: &Tensor) -> Result<Tensor> {
        let (bsize, _) = styles.size2()?;
        let xs = match &self.input {
            BaseInput::Const(input) => input.expand(
                &[bsize, self.channels, BASE_RESOLUTION, BASE_RESOLUTION],
                false,
            ),
            BaseInput::Style(linear) => linear.f_forward(styles)?.view([
                bsize,
                self.channels,
                BASE_RESOLUTION,
                BASE_RESOLUTION,
            ]),
        };

        let xs = self.stage1.f_forward(&xs, styles)?;
        let xs = self.conv.forward(&xs);
        self.stage2.f_forward(&xs, styles)
    }
}

#[derive(Debug)]
enum UpConv {
    Fused(ScaledConvTranspose2D),
    Separate(ScaledConv2D),
}

#[derive(Debug)]
struct SynthesisBlock {
    up_conv: UpConv,
    blur: Option<Blur>,
    stage1: StyleStage,
    conv: ScaledConv2D,
    stage2: StyleStage,
}

impl SynthesisBlock {
    fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: &SynthesisNetworkInit,
        in_c: usize,
        out_c: usize,
    ) -> Result<Self> {
        let path = path.borrow();

        let up_conv = if init.use_fused_scale {
            UpConv::Fused(
                ScaledConvTranspose2DInit {
                    activation: Activation::Linear,
                    ..Default::default()
                }
                .build(path / "conv_up", in_c, out_c)?,
            )
        } else {
            UpConv::Separate(conv3x3(path / "conv_up", in_c, out_c)?)
        };
        let blur = init.use_blur.then(|| Blur::new(out_c, path.device()));

        Ok(Self {
            up_conv,
            blur,
            stage1: StyleStage::new(path / "stage1", init, out_c)?,
            conv: conv3x3(path / "conv", out_c, out_c)?,
            stage2: StyleStage::new(path / "stage2", init, out_c)?,
        })
    }

    fn f_forward(&self, xs: &Tensor, styles: &Tensor) -> Result<Tensor> {
        let xs = match &self.up_conv {
            UpConv::Fused(conv) => conv.forward(xs),
            UpConv::Separate(conv) => conv.forward(&upsample2x(xs)?),
        };
        let xs = match &self.blur {
            Some(blur) => blur.f_forward(&xs)?,
            None => xs,
        };
        let xs = self.stage1.f_forward(&xs, styles)?;
        let xs = self.conv.forward(&xs);
        self.stage2.f_forward(&xs, styles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_init() -> SynthesisNetworkInit {
        SynthesisNetworkInit {
            style_size: 8,
            max_level: 3,
            channel_base_pow: 5,
            channel_max_pow: 4,
            ..Default::default()
        }
    }

    fn styles(level: usize, bsize: i64) -> Vec<Tensor> {
        (0..level)
            .map(|_| Tensor::randn(&[bsize, 8], FLOAT_CPU))
            .collect()
    }

    #[test]
    fn synthesis_level1_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let synthesis = small_init().build(&root / "synthesis")?;

        let (prev, cur) = synthesis.f_forward_branches(&styles(1, 2))?;
        ensure!(prev.is_none());
        ensure!(cur.size() == vec![2, 3, 4, 4]);
        ensure!(synthesis.f_forward(&styles(1, 2))?.size() == vec![2, 3, 4, 4]);

        Ok(())
    }

    #[test]
    fn synthesis_grow_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let path = &root / "synthesis";
        let mut synthesis = small_init().build(&path)?;

        let num_vars = vs.variables().len();
        synthesis.grow(&path)?;
        ensure!(synthesis.level() == 2);
        ensure!(vs.variables().len() > num_vars);

        let ws = styles(2, 2);
        let (prev, cur) = synthesis.f_forward_branches(&ws)?;
        let prev = prev.ok_or_else(|| format_err!("expect previous branch"))?;
        ensure!(prev.size() == vec![2, 3, 8, 8]);
        ensure!(cur.size() == vec![2, 3, 8, 8]);

        synthesis.grow(&path)?;
        ensure!(synthesis.level() == 3);
        ensure!(synthesis.f_forward(&styles(3, 2))?.size() == vec![2, 3, 16, 16]);

        // beyond max level
        let num_vars = vs.variables().len();
        ensure!(synthesis.grow(&path).is_err());
        ensure!(synthesis.level() == 3);
        ensure!(vs.variables().len() == num_vars);

        // too few styles
        ensure!(synthesis.f_forward(&styles(2, 2)).is_err());

        Ok(())
    }

    #[test]
    fn synthesis_blend_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let path = &root / "synthesis";
        let mut synthesis = SynthesisNetworkInit {
            use_noise: false,
            ..small_init()
        }
        .build(&path)?;
        synthesis.grow(&path)?;

        let ws = styles(2, 2);
        let (prev, cur) = synthesis.f_forward_branches(&ws)?;
        let prev = prev.ok_or_else(|| format_err!("expect previous branch"))?;

        synthesis.set_alpha(0.0);
        ensure!(synthesis.f_forward(&ws)?.allclose(&prev, 1e-5, 1e-5, false));

        synthesis.set_alpha(1.0);
        ensure!(synthesis.f_forward(&ws)?.allclose(&cur, 1e-5, 1e-5, false));

        synthesis.set_alpha(0.25);
        let expect = &prev * 0.75 + &cur * 0.25;
        ensure!(synthesis.f_forward(&ws)?.allclose(&expect, 1e-5, 1e-5, false));

        Ok(())
    }

    #[test]
    fn synthesis_growth_continuity_test() -> Result<()> {
        for use_fused_scale in [true, false] {
            let vs = nn::VarStore::new(Device::Cpu);
            let root = vs.root();
            let path = &root / "synthesis";
            let mut synthesis = SynthesisNetworkInit {
                use_noise: false,
                use_fused_scale,
                ..small_init()
            }
            .build(&path)?;
            let ws = styles(3, 2);

            // a freshly grown level at alpha = 0 shows the upsampled output
            // of the network before growth
            for level in 2..=3 {
                let expect = upsample2x(&synthesis.f_forward(&ws[..level - 1])?)?;
                synthesis.grow(&path)?;
                synthesis.set_alpha(0.0);
                let output = synthesis.f_forward(&ws[..level])?;
                ensure!(output.size() == expect.size());
                ensure!(output.allclose(&expect, 1e-5, 1e-5, false));
                synthesis.set_alpha(1.0);
            }
        }

        Ok(())
    }

    #[test]
    fn synthesis_variants_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let path = &root / "synthesis";
        let mut synthesis = SynthesisNetworkInit {
            input: SynthesisInput::Style,
            use_blur: false,
            use_fused_scale: true,
            ..small_init()
        }
        .build(&path)?;
        synthesis.grow(&path)?;
        synthesis.grow(&path)?;

        ensure!(synthesis.f_forward(&styles(3, 4))?.size() == vec![4, 3, 16, 16]);
        Ok(())
    }
}
