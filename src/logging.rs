use crate::{common::*, message as msg};
use tfrecord::{
    ColorSpace, EventAsyncWriter, EventWriterConfig, TchChannelOrder, TchTensorAsImageList,
};

pub async fn logging_worker(
    log_dir: impl AsRef<Path>,
    mut log_rx: mpsc::Receiver<msg::LogMessage>,
) -> Result<()> {
    let event_dir = log_dir.as_ref().join("events");
    tokio::fs::create_dir_all(&event_dir).await?;

    let mut event_writer = {
        let event_path_prefix = event_dir
            .join("style-grow")
            .into_os_string()
            .into_string()
            .map_err(|path| format_err!("non-UTF-8 event path {:?}", path))?;

        EventAsyncWriter::from_prefix(event_path_prefix, "", EventWriterConfig::default()).await?
    };

    while let Some(msg) = log_rx.recv().await {
        match msg {
            msg::LogMessage::Loss {
                step,
                level,
                alpha,
                generator_loss,
                discriminator_loss,
                output_mean,
            } => {
                let step = step as i64;

                event_writer
                    .write_scalar(format!("lv{}/loss_g", level), step, generator_loss as f32)
                    .await?;
                event_writer
                    .write_scalar(
                        format!("lv{}/loss_d", level),
                        step,
                        discriminator_loss as f32,
                    )
                    .await?;
                event_writer
                    .write_scalar("params/alpha", step, alpha as f32)
                    .await?;
                event_writer
                    .write_scalar("params/level", step, level as f32)
                    .await?;

                if let Some(output_mean) = output_mean {
                    event_writer
                        .write_scalar(
                            format!("lv{}/dout_mean", level),
                            step,
                            output_mean as f32,
                        )
                        .await?;
                }
            }
            msg::LogMessage::Image { step, tag, grid } => {
                // quantize here, float images are rescaled by their own range
                let pixels = (grid * 255.0).round().clamp(0.0, 255.0).to_kind(Kind::Uint8);
                let images =
                    TchTensorAsImageList::new(ColorSpace::Rgb, TchChannelOrder::CHW, pixels)?;
                event_writer
                    .write_image_list(tag, step as i64, images)
                    .await?;
            }
            msg::LogMessage::Parameters { step, parameters } => {
                let step = step as i64;

                for (name, tensor) in parameters {
                    let result = event_writer
                        .write_histogram(format!("weights/{}", name), step, tensor)
                        .await;

                    // non-finite values cannot be binned
                    if let Err(err) = result {
                        warn!("skip histogram of '{}': {}", name, err);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Tiles a batch of NHWC images in `[-1, 1]` into a single NCHW image in
/// `[0, 1]`, with a one-pixel border around every tile.
pub fn image_grid(images: &Tensor, rows: usize) -> Result<Tensor> {
    let images = images.detach().to_device(Device::Cpu).to_kind(Kind::Float);
    let (bsize, height, width, channels) = images.size4()?;
    let rows = rows as i64;
    ensure!(
        rows > 0 && bsize % rows == 0,
        "cannot arrange {} images in {} rows",
        bsize,
        rows
    );
    let cols = bsize / rows;
    let (height, width) = (height + 2, width + 2);

    let grid = images
        .constant_pad_nd(&[0, 0, 1, 1, 1, 1])
        .reshape(&[rows, cols, height, width, channels])
        .permute(&[0, 2, 1, 3, 4])
        .reshape(&[rows * height, cols * width, channels]);
    let grid = ((grid + 1.0) / 2.0).clamp(0.0, 1.0);

    Ok(grid.permute(&[2, 0, 1]).unsqueeze(0))
}

/// Rows used to tile a batch, four when the batch allows it.
pub fn grid_rows(bsize: usize) -> usize {
    if bsize % 4 == 0 {
        4
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_grid_test() -> Result<()> {
        // every image is filled with its index, mapped to [-1, 1]
        let images: Vec<_> = (0..6)
            .map(|index| Tensor::full(&[1, 2, 3, 3], index as f64 / 5.0 * 2.0 - 1.0, FLOAT_CPU))
            .collect();
        let images = Tensor::cat(&images, 0);

        let grid = image_grid(&images, 2)?;
        ensure!(grid.size() == vec![1, 3, 2 * 4, 3 * 5]);
        ensure!(f64::from(grid.min()) >= 0.0 && f64::from(grid.max()) <= 1.0);

        // image (row 1, col 2) is index 5 and sits at pixel (1 * 4 + 1, 2 * 5 + 1)
        let pixel = grid.get(0).get(0).get(5).get(11);
        ensure!((f64::from(pixel) - 1.0).abs() < 1e-6);

        // borders are mid gray
        let border = grid.get(0).get(1).get(0).get(0);
        ensure!((f64::from(border) - 0.5).abs() < 1e-6);

        ensure!(image_grid(&images, 4).is_err());
        Ok(())
    }

    #[test]
    fn grid_rows_test() {
        assert_eq!(grid_rows(16), 4);
        assert_eq!(grid_rows(6), 1);
    }

    #[tokio::test]
    async fn logging_worker_test() -> Result<()> {
        let log_dir = std::env::temp_dir().join(format!(
            "style-grow-logging-{}",
            Local::now().format(crate::FILE_STRFTIME)
        ));
        let (log_tx, log_rx) = mpsc::channel(4);
        let worker = tokio::spawn(logging_worker(log_dir.clone(), log_rx));

        log_tx
            .send(msg::LogMessage::Loss {
                step: 1,
                level: 1,
                alpha: 1.0,
                generator_loss: 0.7,
                discriminator_loss: 1.3,
                output_mean: Some(0.1),
            })
            .await
            .map_err(|_| format_err!("logging worker stopped"))?;
        log_tx
            .send(msg::LogMessage::Image {
                step: 1,
                tag: "lv1".into(),
                grid: image_grid(&Tensor::zeros(&[4, 4, 4, 3], FLOAT_CPU), 2)?,
            })
            .await
            .map_err(|_| format_err!("logging worker stopped"))?;
        log_tx
            .send(msg::LogMessage::Parameters {
                step: 1,
                parameters: vec![
                    ("synthesis/to_rgb1.weight".into(), Tensor::randn(&[3, 8, 1, 1], FLOAT_CPU)),
                    // a diverged parameter does not stop the worker
                    ("synthesis/to_rgb1.bias".into(), Tensor::full(&[3], f64::NAN, FLOAT_CPU)),
                ],
            })
            .await
            .map_err(|_| format_err!("logging worker stopped"))?;
        drop(log_tx);
        worker.await??;

        let event_files: Vec<_> = fs::read_dir(log_dir.join("events"))?.collect::<Result<_, _>>()?;
        ensure!(event_files.len() == 1);
        ensure!(event_files[0].metadata()?.len() > 0);
        fs::remove_dir_all(&log_dir)?;

        Ok(())
    }
}
