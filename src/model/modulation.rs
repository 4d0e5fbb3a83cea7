use super::{
    misc::instance_norm,
    scaled::{ScaledLinear, ScaledLinearInit},
};
use crate::common::*;

pub use ada_in::*;
mod ada_in {
    use super::*;

    /// Adaptive instance modulation driven by a style vector.
    #[derive(Debug)]
    pub struct AdaIn {
        pub(crate) scale_transform: ScaledLinear,
        pub(crate) bias_transform: ScaledLinear,
        channels: i64,
        style_size: i64,
    }

    impl AdaIn {
        pub fn new<'a>(
            path: impl Borrow<nn::Path<'a>>,
            channels: usize,
            style_size: usize,
        ) -> Result<Self> {
            let path = path.borrow();
            let init = ScaledLinearInit {
                gain: 1.0,
                ..Default::default()
            };

            let scale_transform = init.clone().build(path / "scale", style_size, channels)?;
            let bias_transform = init.build(path / "bias", style_size, channels)?;

            Ok(Self {
                scale_transform,
                bias_transform,
                channels: channels as i64,
                style_size: style_size as i64,
            })
        }

        pub fn f_forward(&self, xs: &Tensor, styles: &Tensor) -> Result<Tensor> {
            let (bsize, in_c, _, _) = xs.size4()?;
            ensure!(
                in_c == self.channels,
                "expect {} channels, but get {}",
                self.channels,
                in_c
            );
            let (w_bsize, w_dim) = styles.size2()?;
            ensure!(
                w_dim == self.style_size,
                "style vector width mismatch, expect {}, but get {}",
                self.style_size,
                w_dim
            );
            ensure!(w_bsize == bsize, "batch size mismatch between images and styles");

            let scale = self
                .scale_transform
                .f_forward(styles)?
                .view([bsize, in_c, 1, 1]);
            let bias = self
                .bias_transform
                .f_forward(styles)?
                .view([bsize, in_c, 1, 1]);

            Ok(instance_norm(xs) * scale + bias)
        }
    }
}

pub use noise_injection::*;
mod noise_injection {
    use super::*;

    /// Adds a fresh single-channel noise map scaled by a learned per-channel strength.
    #[derive(Debug)]
    pub struct NoiseInjection {
        pub(crate) strength: Tensor,
    }

    impl NoiseInjection {
        pub fn new<'a>(path: impl Borrow<nn::Path<'a>>, channels: usize) -> Self {
            let path = path.borrow();
            let strength = path.zeros("strength", &[1, channels as i64, 1, 1]);
            Self { strength }
        }

        pub fn f_forward(&self, xs: &Tensor) -> Result<Tensor> {
            let (bsize, _, height, width) = xs.size4()?;
            let noise = Tensor::randn(&[bsize, 1, height, width], (xs.kind(), xs.device()));
            Ok(xs + noise * &self.strength)
        }
    }
}

pub use blur::*;
mod blur {
    use super::*;

    /// Depthwise 3x3 binomial low-pass filter, size preserving.
    #[derive(Debug)]
    pub struct Blur {
        kernel: Tensor,
        channels: i64,
    }

    impl Blur {
        pub fn new(channels: usize, device: Device) -> Self {
            let channels = channels as i64;
            let taps = Tensor::of_slice(&[1f32, 2.0, 1.0]).to_device(device);
            let kernel = taps.view([3, 1]) * taps.view([1, 3]);
            let kernel = &kernel / kernel.sum(Kind::Float);
            let kernel = kernel
                .view([1, 1, 3, 3])
                .repeat(&[channels, 1, 1, 1])
                .set_requires_grad(false);

            Self { kernel, channels }
        }

        pub fn f_forward(&self, xs: &Tensor) -> Result<Tensor> {
            let (_, in_c, _, _) = xs.size4()?;
            ensure!(in_c == self.channels);
            Ok(xs.conv2d::<&Tensor>(
                &self.kernel,
                None,
                &[1, 1],
                &[1, 1],
                &[1, 1],
                self.channels,
            ))
        }
    }
}

pub use minibatch_std::*;
mod minibatch_std {
    use super::*;

    const EPS: f64 = 1e-8;

    #[derive(Debug, Clone)]
    pub struct MinibatchStdLayerInit {
        pub group_size: usize,
    }

    impl Default for MinibatchStdLayerInit {
        fn default() -> Self {
            Self { group_size: 4 }
        }
    }

    impl MinibatchStdLayerInit {
        pub fn build(self) -> Result<MinibatchStdLayer> {
            let Self { group_size } = self;
            ensure!(group_size > 0, "group_size must be positive");
            Ok(MinibatchStdLayer {
                group_size: group_size as i64,
            })
        }
    }

    /// Appends one channel holding the average per-pixel standard deviation
    /// within each sample group.
    #[derive(Debug)]
    pub struct MinibatchStdLayer {
        group_size: i64,
    }

    impl MinibatchStdLayer {
        pub fn f_forward(&self, xs: &Tensor) -> Result<Tensor> {
            let group_size = self.group_size;
            let (in_b, in_c, in_h, in_w) = xs.size4()?;
            ensure!(
                in_b % group_size == 0,
                "batch size {} is not divisible by group size {}",
                in_b,
                group_size
            );
            let num_groups = in_b / group_size;

            // sample i belongs to group (i % num_groups)
            let ys = xs.reshape(&[group_size, num_groups, in_c, in_h, in_w]);
            let var = ys.var_dim(&[0], false, false); // [M, c, h, w]

            // shifted so that zero variance maps to exactly zero
            let floor = (var.zeros_like() + EPS).sqrt();
            let stdev = (var + EPS).sqrt() - floor;

            let avg_stdev = stdev
                .mean_dim(&[1, 2, 3], false, Kind::Float) // [M]
                .reshape(&[num_groups, 1, 1, 1])
                .repeat(&[group_size, 1, in_h, in_w]); // [b, 1, h, w]

            Ok(Tensor::cat(&[xs, &avg_stdev], 1))
        }

        pub fn group_size(&self) -> usize {
            self.group_size as usize
        }
    }
}

const ADAPTIVE_NOISE_GAIN: f64 = 0.2;

/// Noise magnitude derived from the discriminator output mean on fakes.
pub fn adaptive_noise_scale(output_mean: f64) -> f64 {
    ADAPTIVE_NOISE_GAIN * (output_mean - 0.5).max(0.0).powi(2)
}

/// Multiplies every channel by `1 + n * scale * sqrt(C)` with `n ~ N(0, 1)`
/// drawn once per channel.
pub fn adaptive_noise(xs: &Tensor, noise_scale: f64) -> Result<Tensor> {
    if noise_scale <= 0.0 {
        return Ok(xs.shallow_clone());
    }
    let (_, in_c, _, _) = xs.size4()?;
    let noise = Tensor::randn(&[1, in_c, 1, 1], (xs.kind(), xs.device()))
        * (noise_scale * (in_c as f64).sqrt())
        + 1.0;
    Ok(xs * noise)
}
