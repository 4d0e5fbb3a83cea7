use super::{
    growth::GrowthState,
    mapping::{MappingNetwork, MappingNetworkInit},
    misc::{lerp, nchw_to_nhwc},
    synthesis::{SynthesisNetwork, SynthesisNetworkInit},
};
use crate::common::*;

const W_AVG_DECAY: f64 = 0.99;

#[derive(Debug, Clone)]
pub struct GeneratorInit {
    pub latent_size: usize,
    pub mapping: MappingNetworkInit,
    pub synthesis: SynthesisNetworkInit,
    /// Probability of mixing two style vectors in a training batch.
    pub style_mixing_prob: f64,
    /// Truncation applied at inference time, disabled if `None`.
    pub truncation_psi: Option<f64>,
}

impl Default for GeneratorInit {
    fn default() -> Self {
        Self {
            latent_size: 256,
            mapping: Default::default(),
            synthesis: Default::default(),
            style_mixing_prob: 0.9,
            truncation_psi: None,
        }
    }
}

impl GeneratorInit {
    pub fn build<'a, 'b>(
        self,
        mapping_path: impl Borrow<nn::Path<'a>>,
        synthesis_path: impl Borrow<nn::Path<'b>>,
    ) -> Result<Generator> {
        let mapping_path = mapping_path.borrow();
        let Self {
            latent_size,
            mapping,
            synthesis,
            style_mixing_prob,
            truncation_psi,
        } = self;
        ensure!(
            (0.0..=1.0).contains(&style_mixing_prob),
            "style_mixing_prob must be within [0, 1]"
        );
        let style_size = synthesis.style_size;

        let mapping = mapping.build(mapping_path, latent_size, style_size)?;
        let synthesis = synthesis.build(synthesis_path)?;
        let w_avg = mapping_path.zeros_no_train("w_avg", &[style_size as i64]);

        Ok(Generator {
            mapping,
            synthesis,
            w_avg,
            latent_size: latent_size as i64,
            style_mixing_prob,
            truncation_psi,
        })
    }
}

/// Style-based generator: mapping network, synthesis network and the running
/// average of the style vectors.
#[derive(Debug)]
pub struct Generator {
    mapping: MappingNetwork,
    synthesis: SynthesisNetwork,
    w_avg: Tensor,
    latent_size: i64,
    style_mixing_prob: f64,
    truncation_psi: Option<f64>,
}

impl Generator {
    pub fn state(&self) -> &GrowthState {
        self.synthesis.state()
    }

    pub fn level(&self) -> usize {
        self.synthesis.level()
    }

    pub fn alpha(&self) -> f64 {
        self.synthesis.alpha()
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.synthesis.set_alpha(alpha);
    }

    pub fn latent_size(&self) -> usize {
        self.latent_size as usize
    }

    pub fn w_avg(&self) -> &Tensor {
        &self.w_avg
    }

    pub fn grow<'a>(&mut self, synthesis_path: impl Borrow<nn::Path<'a>>) -> Result<()> {
        self.synthesis.grow(synthesis_path)
    }

    pub fn sample_latents(&self, bsize: usize, device: Device) -> Tensor {
        Tensor::randn(&[bsize as i64, self.latent_size], (Kind::Float, device))
    }

    /// Generates NCHW images with unbounded pixel values.
    ///
    /// In training mode the running style average is updated and style
    /// mixing may occur. Otherwise the optional truncation is applied.
    pub fn f_forward_t(&self, latents: &Tensor, train: bool) -> Result<Tensor> {
        let level = self.level();
        let styles = self.mapping.f_forward(latents)?;

        let per_level: Vec<Tensor> = if train {
            self.update_w_avg(&styles);

            if thread_rng().gen_bool(self.style_mixing_prob) {
                let mixed = self.mapping.f_forward(&latents.randn_like())?;
                mix_styles(&styles, &mixed, level, &mut thread_rng())?
            } else {
                repeat_styles(&styles, level)
            }
        } else {
            let styles = match self.truncation_psi {
                Some(psi) => self.truncate(&styles, psi),
                None => styles,
            };
            repeat_styles(&styles, level)
        };

        self.synthesis.f_forward(&per_level)
    }

    /// Generates NHWC images in `[-1, 1]` for inference.
    pub fn f_generate(&self, latents: &Tensor) -> Result<Tensor> {
        let images = tch::no_grad(|| self.f_forward_t(latents, false))?;
        Ok(nchw_to_nhwc(&images.clamp(-1.0, 1.0)))
    }

    /// Moves the style vector toward the running average, `w_avg + psi * (w - w_avg)`.
    pub fn truncate(&self, styles: &Tensor, psi: f64) -> Tensor {
        &self.w_avg + (styles - &self.w_avg) * psi
    }

    fn update_w_avg(&self, styles: &Tensor) {
        tch::no_grad(|| {
            let batch_mean = styles.detach().mean_dim(&[0], false, Kind::Float);
            let updated = lerp(&batch_mean, &self.w_avg, W_AVG_DECAY);
            self.w_avg.shallow_clone().copy_(&updated);
        });
    }
}

fn repeat_styles(styles: &Tensor, level: usize) -> Vec<Tensor> {
    iter::repeat_with(|| styles.shallow_clone())
        .take(level)
        .collect()
}

/// Builds per-level styles where levels below a per-sample cutoff use the
/// first style and the rest use the second.
fn mix_styles<R: Rng>(
    first: &Tensor,
    second: &Tensor,
    level: usize,
    rng: &mut R,
) -> Result<Vec<Tensor>> {
    let (bsize, _) = first.size2()?;
    ensure!(first.size() == second.size());

    let cutoffs: Vec<usize> = (0..bsize).map(|_| rng.gen_range(1..=level)).collect();
    let diff = second - first;

    let styles = (1..=level)
        .map(|lv| {
            let mask: Vec<f32> = cutoffs
                .iter()
                .map(|&cutoff| if lv >= cutoff { 1.0 } else { 0.0 })
                .collect();
            let mask = Tensor::of_slice(&mask)
                .view([bsize, 1])
                .to_device(first.device());
            first + &diff * mask
        })
        .collect();

    Ok(styles)
}
