use crate::common::*;

/// Records sent from the training worker to the logging worker.
#[derive(Debug)]
pub enum LogMessage {
    Loss {
        step: usize,
        level: usize,
        alpha: f64,
        generator_loss: f64,
        discriminator_loss: f64,
        /// Moving average of fake scores, reported for the least-squares loss.
        output_mean: Option<f64>,
    },
    /// Image grid in NCHW layout with pixel values in `[0, 1]`.
    Image {
        step: usize,
        tag: String,
        grid: Tensor,
    },
    /// Named parameter copies written as histograms.
    Parameters {
        step: usize,
        parameters: Vec<(String, Tensor)>,
    },
}
