use super::{
    discriminator::{Discriminator, DiscriminatorInit},
    generator::{Generator, GeneratorInit},
    misc::level_resolution,
};
use crate::common::*;

pub use growth_state::*;
mod growth_state {
    use super::*;

    /// Resolution level and blending factor of a growable network.
    ///
    /// Level 1 renders 4x4 images and every level doubles the side length.
    /// `alpha` weights the newest level against the upsampled previous one.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct GrowthState {
        level: usize,
        alpha: f64,
        max_level: usize,
    }

    impl GrowthState {
        pub fn new(max_level: usize) -> Result<Self> {
            ensure!(max_level >= 1, "max_level must be at least 1");
            Ok(Self {
                level: 1,
                alpha: 1.0,
                max_level,
            })
        }

        pub fn level(&self) -> usize {
            self.level
        }

        pub fn alpha(&self) -> f64 {
            self.alpha
        }

        pub fn max_level(&self) -> usize {
            self.max_level
        }

        pub fn resolution(&self) -> usize {
            level_resolution(self.level)
        }

        pub fn set_alpha(&mut self, alpha: f64) {
            self.alpha = alpha.clamp(0.0, 1.0);
        }

        pub fn can_grow(&self) -> bool {
            self.level < self.max_level
        }

        /// The level reached by the next growth, or an error at the maximum level.
        pub fn next_level(&self) -> Result<usize> {
            ensure!(
                self.can_grow(),
                "cannot grow beyond max level {}",
                self.max_level
            );
            Ok(self.level + 1)
        }

        pub fn grow(&mut self) -> Result<usize> {
            self.level = self.next_level()?;
            Ok(self.level)
        }
    }
}

pub use progressive_gan::*;
mod progressive_gan {
    use super::*;

    #[derive(Debug, Clone, Default)]
    pub struct ProgressiveGanInit {
        pub generator: GeneratorInit,
        pub discriminator: DiscriminatorInit,
    }

    impl ProgressiveGanInit {
        pub fn build(self, device: Device) -> Result<ProgressiveGan> {
            let Self {
                generator,
                discriminator,
            } = self;
            ensure!(
                generator.synthesis.max_level == discriminator.max_level,
                "generator and discriminator must share the same max level"
            );
            ensure!(
                (
                    generator.synthesis.channel_base_pow,
                    generator.synthesis.channel_max_pow
                ) == (discriminator.channel_base_pow, discriminator.channel_max_pow),
                "generator and discriminator must share the same channel schedule"
            );

            let mapping_vs = nn::VarStore::new(device);
            let synthesis_vs = nn::VarStore::new(device);
            let discriminator_vs = nn::VarStore::new(device);

            let generator = generator.build(mapping_vs.root(), synthesis_vs.root())?;
            let discriminator = discriminator.build(discriminator_vs.root())?;

            Ok(ProgressiveGan {
                mapping_vs,
                synthesis_vs,
                discriminator_vs,
                generator,
                discriminator,
            })
        }
    }

    /// Generator and discriminator grown in lockstep.
    ///
    /// Parameters live in three variable stores so that the mapping network,
    /// the synthesis network and the discriminator can be optimized separately.
    #[derive(Derivative)]
    #[derivative(Debug)]
    pub struct ProgressiveGan {
        #[derivative(Debug = "ignore")]
        mapping_vs: nn::VarStore,
        #[derivative(Debug = "ignore")]
        synthesis_vs: nn::VarStore,
        #[derivative(Debug = "ignore")]
        discriminator_vs: nn::VarStore,
        generator: Generator,
        discriminator: Discriminator,
    }

    impl ProgressiveGan {
        pub fn generator(&self) -> &Generator {
            &self.generator
        }

        pub fn discriminator(&self) -> &Discriminator {
            &self.discriminator
        }

        pub fn discriminator_mut(&mut self) -> &mut Discriminator {
            &mut self.discriminator
        }

        pub fn mapping_vs(&self) -> &nn::VarStore {
            &self.mapping_vs
        }

        pub fn synthesis_vs(&self) -> &nn::VarStore {
            &self.synthesis_vs
        }

        pub fn discriminator_vs(&self) -> &nn::VarStore {
            &self.discriminator_vs
        }

        pub fn device(&self) -> Device {
            self.mapping_vs.device()
        }

        pub fn in_sync(&self) -> bool {
            self.generator.state() == self.discriminator.state()
        }

        pub fn level(&self) -> usize {
            debug_assert!(self.in_sync());
            self.generator.level()
        }

        pub fn alpha(&self) -> f64 {
            debug_assert!(self.in_sync());
            self.generator.alpha()
        }

        pub fn max_level(&self) -> usize {
            self.generator.state().max_level()
        }

        pub fn resolution(&self) -> usize {
            self.generator.state().resolution()
        }

        pub fn set_alpha(&mut self, alpha: f64) {
            self.generator.set_alpha(alpha);
            self.discriminator.set_alpha(alpha);
        }

        /// Grows both networks by one level. Neither network is modified on failure.
        pub fn grow(&mut self) -> Result<usize> {
            let level = self.generator.state().next_level()?;
            ensure!(self.discriminator.state().next_level()? == level);

            self.generator.grow(self.synthesis_vs.root())?;
            self.discriminator.grow(self.discriminator_vs.root())?;
            debug_assert!(self.in_sync());

            Ok(level)
        }

        /// Every parameter and buffer in use, keyed by `{group}/{name}` and sorted by key.
        ///
        /// Image adapters displaced by two growths stay in the variable stores,
        /// and thus in the optimizers, but no longer take part in either
        /// forward pass. They are left out here.
        pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
            let level = self.level();
            let groups = [
                ("mapping", &self.mapping_vs),
                ("synthesis", &self.synthesis_vs),
                ("discriminator", &self.discriminator_vs),
            ];

            groups
                .iter()
                .flat_map(|(group, vs)| {
                    vs.variables()
                        .into_iter()
                        .filter(move |(name, _)| !is_retired_adapter(name, level))
                        .map(move |(name, tensor)| (format!("{}/{}", group, name), tensor))
                })
                .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
                .collect()
        }
    }

    /// Whether a variable belongs to a to-image or from-image adapter older
    /// than the previous level.
    pub(super) fn is_retired_adapter(name: &str, level: usize) -> bool {
        let suffix = match name
            .strip_prefix("to_rgb")
            .or_else(|| name.strip_prefix("from_rgb"))
        {
            Some(suffix) => suffix,
            None => return false,
        };
        let digits: String = suffix.chars().take_while(char::is_ascii_digit).collect();

        match digits.parse::<usize>() {
            Ok(adapter_level) => adapter_level + 1 < level,
            Err(_) => false,
        }
    }
}

pub use phase_schedule::*;
mod phase_schedule {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Phase {
        /// The newest level is blended in with alpha rising from 0 to 1.
        Fading,
        /// Training at a fixed level with alpha = 1.
        Stabilizing,
    }

    /// Action requested by the schedule after a training step.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Transition {
        Continue,
        /// Fading ended. Set alpha to 1.
        Stabilize,
        /// Stabilizing ended below the max level. Grow both networks and set alpha to 0.
        Grow,
    }

    /// Alternates stabilizing and fading phases of a fixed number of images.
    #[derive(Debug, Clone)]
    pub struct PhaseSchedule {
        phase: Phase,
        image_count: usize,
        num_images_per_phase: usize,
    }

    impl PhaseSchedule {
        pub fn new(num_images_per_phase: usize) -> Result<Self> {
            ensure!(num_images_per_phase > 0, "num_images_per_phase must be positive");
            Ok(Self {
                phase: Phase::Stabilizing,
                image_count: 0,
                num_images_per_phase,
            })
        }

        pub fn phase(&self) -> Phase {
            self.phase
        }

        pub fn image_count(&self) -> usize {
            self.image_count
        }

        /// Blending factor to apply before the next step, `None` while stabilizing.
        pub fn alpha(&self) -> Option<f64> {
            match self.phase {
                Phase::Fading => {
                    Some(self.image_count as f64 / self.num_images_per_phase as f64)
                }
                Phase::Stabilizing => None,
            }
        }

        /// Counts the images consumed by a step and reports a phase change once
        /// the phase is exhausted. The caller performs the transition.
        pub fn record(&mut self, num_images: usize, level: usize, max_level: usize) -> Transition {
            self.image_count += num_images;
            if self.image_count < self.num_images_per_phase {
                return Transition::Continue;
            }
            self.image_count = 0;

            match self.phase {
                Phase::Fading => {
                    self.phase = Phase::Stabilizing;
                    Transition::Stabilize
                }
                Phase::Stabilizing if level >= max_level => Transition::Continue,
                Phase::Stabilizing => {
                    self.phase = Phase::Fading;
                    Transition::Grow
                }
            }
        }
    }
}
