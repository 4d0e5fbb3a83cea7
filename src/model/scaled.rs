//! Equalized learning-rate layers.
//!
//! Weights are initialized from N(0, 1) and the input is multiplied by a
//! constant `gain / sqrt(fan_in)` on every forward pass. The constant is a
//! plain float and never enters the autograd graph.

use super::misc::Activation;
use crate::common::*;

pub const DEFAULT_GAIN: f64 = std::f64::consts::SQRT_2;

fn he_scale(gain: f64, fan_in: usize) -> f64 {
    gain / (fan_in as f64).sqrt()
}

pub use scaled_linear::*;
mod scaled_linear {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct ScaledLinearInit {
        pub activation: Activation,
        pub gain: f64,
    }

    impl Default for ScaledLinearInit {
        fn default() -> Self {
            Self {
                activation: Activation::Linear,
                gain: DEFAULT_GAIN,
            }
        }
    }

    impl ScaledLinearInit {
        pub fn build<'a>(
            self,
            path: impl Borrow<nn::Path<'a>>,
            in_c: usize,
            out_c: usize,
        ) -> Result<ScaledLinear> {
            let path = path.borrow();
            let Self { activation, gain } = self;
            ensure!(in_c > 0 && out_c > 0, "zero-sized linear layer is not allowed");
            ensure!(gain > 0.0);

            let weight = path.randn_standard("weight", &[in_c as i64, out_c as i64]);
            let bias = path.zeros("bias", &[out_c as i64]);

            Ok(ScaledLinear {
                weight,
                bias,
                scale: he_scale(gain, in_c),
                in_c: in_c as i64,
                activation,
            })
        }
    }

    #[derive(Debug)]
    pub struct ScaledLinear {
        pub(crate) weight: Tensor,
        pub(crate) bias: Tensor,
        scale: f64,
        in_c: i64,
        activation: Activation,
    }

    impl ScaledLinear {
        pub fn scale(&self) -> f64 {
            self.scale
        }

        pub fn f_forward(&self, xs: &Tensor) -> Result<Tensor> {
            let Self {
                ref weight,
                ref bias,
                scale,
                in_c,
                activation,
            } = *self;

            let (_, in_c_) = xs.size2()?;
            ensure!(
                in_c_ == in_c,
                "expect input with {} features, but get {}",
                in_c,
                in_c_
            );

            let xs = (xs * scale).matmul(weight) + bias;
            Ok(activation.forward(&xs))
        }
    }
}

pub use scaled_conv_2d::*;
mod scaled_conv_2d {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct ScaledConv2DInit {
        pub stride: usize,
        /// Defaults to `ksize / 2`, which keeps the size for odd kernels at stride 1.
        pub padding: Option<usize>,
        pub activation: Activation,
        pub gain: f64,
    }

    impl Default for ScaledConv2DInit {
        fn default() -> Self {
            Self {
                stride: 1,
                padding: None,
                activation: Activation::LRelu,
                gain: DEFAULT_GAIN,
            }
        }
    }

    impl ScaledConv2DInit {
        pub fn build<'a>(
            self,
            path: impl Borrow<nn::Path<'a>>,
            in_c: usize,
            out_c: usize,
            ksize: usize,
        ) -> Result<ScaledConv2D> {
            let path = path.borrow();
            let Self {
                stride,
                padding,
                activation,
                gain,
            } = self;
            ensure!(in_c > 0 && out_c > 0 && ksize > 0 && stride > 0);
            ensure!(gain > 0.0);
            let padding = padding.unwrap_or(ksize / 2);

            let weight = path.randn_standard(
                "weight",
                &[out_c as i64, in_c as i64, ksize as i64, ksize as i64],
            );
            let bias = path.zeros("bias", &[out_c as i64]);

            Ok(ScaledConv2D {
                weight,
                bias,
                scale: he_scale(gain, in_c * ksize * ksize),
                stride: stride as i64,
                padding: padding as i64,
                activation,
            })
        }
    }

    #[derive(Debug)]
    pub struct ScaledConv2D {
        pub(crate) weight: Tensor,
        pub(crate) bias: Tensor,
        scale: f64,
        stride: i64,
        padding: i64,
        activation: Activation,
    }

    impl nn::Module for ScaledConv2D {
        fn forward(&self, xs: &Tensor) -> Tensor {
            let Self {
                ref weight,
                ref bias,
                scale,
                stride,
                padding,
                activation,
            } = *self;

            let xs = (xs * scale).conv2d(
                weight,
                Some(bias),
                &[stride, stride],
                &[padding, padding],
                &[1, 1],
                1,
            );
            activation.forward(&xs)
        }
    }

    impl ScaledConv2D {
        pub fn scale(&self) -> f64 {
            self.scale
        }
    }
}

pub use scaled_conv_transpose_2d::*;
mod scaled_conv_transpose_2d {
    use super::*;

    /// Transposed convolution doubling the spatial size with a 3x3 kernel.
    #[derive(Debug, Clone)]
    pub struct ScaledConvTranspose2DInit {
        pub ksize: usize,
        pub stride: usize,
        pub activation: Activation,
        pub gain: f64,
    }

    impl Default for ScaledConvTranspose2DInit {
        fn default() -> Self {
            Self {
                ksize: 3,
                stride: 2,
                activation: Activation::LRelu,
                gain: DEFAULT_GAIN,
            }
        }
    }

    impl ScaledConvTranspose2DInit {
        pub fn build<'a>(
            self,
            path: impl Borrow<nn::Path<'a>>,
            in_c: usize,
            out_c: usize,
        ) -> Result<ScaledConvTranspose2D> {
            let path = path.borrow();
            let Self {
                ksize,
                stride,
                activation,
                gain,
            } = self;
            ensure!(in_c > 0 && out_c > 0 && stride > 0);
            ensure!(ksize % 2 == 1, "only odd kernel sizes are supported");
            ensure!(gain > 0.0);

            let weight = path.randn_standard(
                "weight",
                &[in_c as i64, out_c as i64, ksize as i64, ksize as i64],
            );
            let bias = path.zeros("bias", &[out_c as i64]);

            Ok(ScaledConvTranspose2D {
                weight,
                bias,
                scale: he_scale(gain, in_c * ksize * ksize),
                stride: stride as i64,
                padding: ksize as i64 / 2,
                output_padding: stride as i64 - 1,
                activation,
            })
        }
    }

    #[derive(Debug)]
    pub struct ScaledConvTranspose2D {
        weight: Tensor,
        bias: Tensor,
        scale: f64,
        stride: i64,
        padding: i64,
        output_padding: i64,
        activation: Activation,
    }

    impl nn::Module for ScaledConvTranspose2D {
        fn forward(&self, xs: &Tensor) -> Tensor {
            let Self {
                ref weight,
                ref bias,
                scale,
                stride,
                padding,
                output_padding,
                activation,
            } = *self;

            let xs = (xs * scale).conv_transpose2d(
                weight,
                Some(bias),
                &[stride, stride],
                &[padding, padding],
                &[output_padding, output_padding],
                1,
                &[1, 1],
            );
            activation.forward(&xs)
        }
    }

    impl ScaledConvTranspose2D {
        pub fn scale(&self) -> f64 {
            self.scale
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nn::Module as _;

    #[test]
    fn scaled_linear_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let layer = ScaledLinearInit {
            gain: 3.0,
            ..Default::default()
        }
        .build(&root / "linear", 16, 5)?;
        assert_abs_diff_eq!(layer.scale(), 3.0 / 4.0, epsilon = 1e-12);

        let _ = tch::no_grad(|| layer.bias.shallow_clone().normal_(0.0, 1.0));

        let xs = Tensor::randn(&[7, 16], FLOAT_CPU);
        let ys = layer.f_forward(&xs)?;
        let expect = xs.matmul(&layer.weight) * layer.scale() + &layer.bias;
        ensure!(ys.size() == vec![7, 5]);
        ensure!(ys.allclose(&expect, 1e-5, 1e-5, false));

        ensure!(layer.f_forward(&Tensor::randn(&[7, 15], FLOAT_CPU)).is_err());

        Ok(())
    }

    #[test]
    fn scaled_params_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let _layer = ScaledLinearInit::default().build(&root / "linear", 4, 4)?;

        // only weight and bias are trainable
        ensure!(vs.trainable_variables().len() == 2);

        let weight = vs
            .variables()
            .remove("linear.weight")
            .ok_or_else(|| format_err!("missing weight"))?;
        let bias = vs
            .variables()
            .remove("linear.bias")
            .ok_or_else(|| format_err!("missing bias"))?;
        ensure!(bias.equal(&Tensor::zeros(&[4], FLOAT_CPU)));
        ensure!(weight.requires_grad());

        Ok(())
    }

    #[test]
    fn scaled_conv_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let conv = ScaledConv2DInit::default().build(&root / "conv", 8, 4, 3)?;
        assert_abs_diff_eq!(conv.scale(), 2f64.sqrt() / 72f64.sqrt(), epsilon = 1e-12);

        let xs = Tensor::randn(&[2, 8, 6, 6], FLOAT_CPU);
        ensure!(conv.forward(&xs).size() == vec![2, 4, 6, 6]);

        let strided = ScaledConv2DInit {
            stride: 2,
            ..Default::default()
        }
        .build(&root / "strided", 8, 4, 3)?;
        ensure!(strided.forward(&xs).size() == vec![2, 4, 3, 3]);

        let valid = ScaledConv2DInit {
            padding: Some(0),
            ..Default::default()
        }
        .build(&root / "valid", 8, 4, 4)?;
        let xs = Tensor::randn(&[2, 8, 4, 4], FLOAT_CPU);
        ensure!(valid.forward(&xs).size() == vec![2, 4, 1, 1]);

        Ok(())
    }

    #[test]
    fn scaled_conv_transpose_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let conv = ScaledConvTranspose2DInit::default().build(&root / "up", 8, 4)?;
        assert_abs_diff_eq!(conv.scale(), 2f64.sqrt() / 72f64.sqrt(), epsilon = 1e-12);

        let xs = Tensor::randn(&[2, 8, 4, 4], FLOAT_CPU);
        ensure!(conv.forward(&xs).size() == vec![2, 4, 8, 8]);

        Ok(())
    }
}
