use super::{
    misc::{pixel_norm, Activation},
    scaled::{ScaledLinear, ScaledLinearInit},
};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct MappingNetworkInit {
    pub num_layers: usize,
    pub normalize_latent: bool,
}

impl Default for MappingNetworkInit {
    fn default() -> Self {
        Self {
            num_layers: 6,
            normalize_latent: true,
        }
    }
}

impl MappingNetworkInit {
    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        latent_size: usize,
        style_size: usize,
    ) -> Result<MappingNetwork> {
        let path = path.borrow();
        let Self {
            num_layers,
            normalize_latent,
        } = self;
        ensure!(num_layers >= 1, "mapping network needs at least one layer");
        ensure!(latent_size > 0 && style_size > 0);

        // hidden layers keep the latent width, the last one emits styles
        let layers = (0..num_layers)
            .map(|index| {
                let out_c = if index + 1 == num_layers {
                    style_size
                } else {
                    latent_size
                };
                ScaledLinearInit {
                    activation: Activation::LRelu,
                    ..Default::default()
                }
                .build(path / format!("dense{}", index), latent_size, out_c)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(MappingNetwork {
            layers,
            normalize_latent,
            latent_size: latent_size as i64,
        })
    }
}

/// Maps latent vectors to style vectors.
#[derive(Debug)]
pub struct MappingNetwork {
    layers: Vec<ScaledLinear>,
    normalize_latent: bool,
    latent_size: i64,
}

impl MappingNetwork {
    pub fn f_forward(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, latent_size) = latents.size2()?;
        ensure!(
            latent_size == self.latent_size,
            "expect latent size {}, but get {}",
            self.latent_size,
            latent_size
        );

        let xs = if self.normalize_latent {
            pixel_norm(latents)
        } else {
            latents.shallow_clone()
        };

        self.layers
            .iter()
            .try_fold(xs, |xs, layer| layer.f_forward(&xs))
    }
}
