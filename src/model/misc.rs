use crate::common::*;

pub const LRELU_SLOPE: f64 = 0.2;
const NORM_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    Linear,
    LRelu,
}

impl Activation {
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Self::Linear => xs.shallow_clone(),
            Self::LRelu => lrelu(xs),
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Self::LRelu
    }
}

pub fn lrelu(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * LRELU_SLOPE))
}

/// Linear interpolation from `a` to `b`. The rate is clamped to `[0, 1]`.
pub fn lerp(a: &Tensor, b: &Tensor, rate: f64) -> Tensor {
    let rate = rate.clamp(0.0, 1.0);
    a + (b - a) * rate
}

/// Normalizes each row by its root mean square along the last axis.
pub fn pixel_norm(xs: &Tensor) -> Tensor {
    let last = xs.dim() as i64 - 1;
    xs * (xs.square().mean_dim(&[last], true, Kind::Float) + NORM_EPS).rsqrt()
}

/// Normalizes each (sample, channel) plane of an NCHW tensor to zero mean and
/// unit variance.
pub fn instance_norm(xs: &Tensor) -> Tensor {
    let mean = xs.mean_dim(&[2, 3], true, Kind::Float);
    let var = xs.var_dim(&[2, 3], false, true);
    (xs - mean) * (var + NORM_EPS).rsqrt()
}

pub fn upsample2x(xs: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = xs.size4()?;
    Ok(xs.upsample_nearest2d(&[h * 2, w * 2], 2.0, 2.0))
}

pub fn avg_pool2x(xs: &Tensor) -> Tensor {
    xs.avg_pool2d(&[2, 2], &[2, 2], &[0, 0], false, true, None::<i64>)
}

/// Number of feature channels at a resolution level, `2^min(base_pow - level, max_pow)`.
pub fn level_channels(channel_base_pow: usize, channel_max_pow: usize, level: usize) -> usize {
    let pow = channel_base_pow.saturating_sub(level).min(channel_max_pow);
    2usize.pow(pow as u32)
}

/// Image side length at a resolution level. Level 1 is 4x4.
pub fn level_resolution(level: usize) -> usize {
    2usize.pow(level as u32 + 1)
}

pub fn nhwc_to_nchw(xs: &Tensor) -> Tensor {
    xs.permute(&[0, 3, 1, 2])
}

pub fn nchw_to_nhwc(xs: &Tensor) -> Tensor {
    xs.permute(&[0, 2, 3, 1])
}
