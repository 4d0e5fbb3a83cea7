mod discriminator;
mod generator;
mod growth;
mod loss;
mod mapping;
mod misc;
mod modulation;
mod scaled;
mod synthesis;

pub use discriminator::*;
pub use generator::*;
pub use growth::*;
pub use loss::*;
pub use mapping::*;
pub use misc::*;
pub use modulation::*;
pub use scaled::*;
pub use synthesis::*;
