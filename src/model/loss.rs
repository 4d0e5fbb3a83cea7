use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LossKind {
    NonSaturating,
    LeastSquares,
}

impl Default for LossKind {
    fn default() -> Self {
        Self::NonSaturating
    }
}

impl LossKind {
    pub fn build(self) -> Box<dyn GanLoss> {
        match self {
            Self::NonSaturating => Box::new(NonSaturatingLoss),
            Self::LeastSquares => Box::new(LeastSquaresLoss),
        }
    }
}

/// Adversarial objective computed from raw discriminator scores.
pub trait GanLoss: std::fmt::Debug + Send {
    fn generator_loss(&self, fake: &Tensor) -> Tensor;
    fn discriminator_loss(&self, real: &Tensor, fake: &Tensor) -> Tensor;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NonSaturatingLoss;

impl GanLoss for NonSaturatingLoss {
    fn generator_loss(&self, fake: &Tensor) -> Tensor {
        (-fake).softplus().mean(Kind::Float)
    }

    fn discriminator_loss(&self, real: &Tensor, fake: &Tensor) -> Tensor {
        (-real).softplus().mean(Kind::Float) + fake.softplus().mean(Kind::Float)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LeastSquaresLoss;

impl GanLoss for LeastSquaresLoss {
    fn generator_loss(&self, fake: &Tensor) -> Tensor {
        (fake - 1.0).square().mean(Kind::Float) / 2.0
    }

    fn discriminator_loss(&self, real: &Tensor, fake: &Tensor) -> Tensor {
        ((real - 1.0).square().mean(Kind::Float) + fake.square().mean(Kind::Float)) / 2.0
    }
}
