use crate::common::*;
use glob::MatchOptions;
use tch::vision::image;

const NUM_DECODE_WORKERS: usize = 8;

/// Shuffled image source yielding NHWC minibatches in `[-1, 1]`.
///
/// Images are traversed sequentially in a random order. When the order is
/// exhausted the loader reshuffles and starts over, so any batch size is
/// served regardless of the number of images.
#[derive(Debug)]
pub struct ImageLoader {
    paths: Vec<Arc<PathBuf>>,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
    device: Device,
}

impl ImageLoader {
    pub fn open(dir: impl AsRef<Path>, device: Device) -> Result<Self> {
        let dir = dir.as_ref();
        ensure!(dir.is_dir(), "'{}' is not a directory", dir.display());

        let pattern = {
            let dir = dir
                .to_str()
                .ok_or_else(|| format_err!("non-UTF-8 path '{}'", dir.display()))?;
            format!("{}/*.png", glob::Pattern::escape(dir))
        };
        let options = MatchOptions {
            case_sensitive: false,
            ..Default::default()
        };

        let paths: Vec<_> = glob::glob_with(&pattern, options)?
            .map(|path| Ok(Arc::new(path?)))
            .collect::<Result<_>>()?;
        ensure!(!paths.is_empty(), "no PNG images found in '{}'", dir.display());
        info!("{} images found in '{}'", paths.len(), dir.display());

        let mut rng = StdRng::from_entropy();
        let mut order: Vec<_> = (0..paths.len()).collect();
        order.shuffle(&mut rng);

        Ok(Self {
            paths,
            order,
            cursor: 0,
            rng,
            device,
        })
    }

    pub fn num_images(&self) -> usize {
        self.paths.len()
    }

    fn next_paths(&mut self, bsize: usize) -> Vec<Arc<PathBuf>> {
        (0..bsize)
            .map(|_| {
                if self.cursor >= self.order.len() {
                    self.order.shuffle(&mut self.rng);
                    self.cursor = 0;
                }
                let index = self.order[self.cursor];
                self.cursor += 1;
                self.paths[index].clone()
            })
            .collect()
    }

    /// Loads the next `bsize` images center-cropped and resized to
    /// `resolution` x `resolution`, returned as `[bsize, resolution, resolution, 3]`.
    pub async fn minibatch(&mut self, bsize: usize, resolution: usize) -> Result<Tensor> {
        ensure!(bsize > 0 && resolution > 0);
        let resolution = resolution as i64;
        let paths = self.next_paths(bsize);

        // decoded concurrently, gathered in order
        let images: Vec<Tensor> = stream::iter(paths)
            .map(|path| {
                tokio::task::spawn_blocking(move || -> Result<Tensor> {
                    let pixels = image::load_and_resize(&*path, resolution, resolution)
                        .with_context(|| format!("failed to load '{}'", path.display()))?;
                    let (channels, _, _) = pixels.size3()?;
                    ensure!(
                        channels == 3,
                        "expect an RGB image, but '{}' has {} channels",
                        path.display(),
                        channels
                    );
                    Ok(pixels)
                })
                .map(|result| Fallible::Ok(result??))
            })
            .buffered(NUM_DECODE_WORKERS)
            .try_collect()
            .await?;

        let batch = Tensor::stack(&images, 0)
            .to_device(self.device)
            .to_kind(Kind::Float)
            / 127.5
            - 1.0;

        Ok(batch.permute(&[0, 2, 3, 1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_images(dir: &Path, count: usize) -> Result<()> {
        fs::create_dir_all(dir)?;
        for index in 0..count {
            let value = (index * 50) as f64;
            let pixels = Tensor::full(&[3, 6, 6], value, (Kind::Uint8, Device::Cpu));
            image::save(&pixels, dir.join(format!("{:03}.png", index)))?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn image_loader_test() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "style-grow-images-{}",
            Local::now().format(crate::FILE_STRFTIME)
        ));
        write_images(&dir, 3)?;
        fs::write(dir.join("notes.txt"), "not an image")?;

        let mut loader = ImageLoader::open(&dir, Device::Cpu)?;
        ensure!(loader.num_images() == 3);

        // more images than available wraps around
        let batch = loader.minibatch(5, 4).await?;
        ensure!(batch.size() == vec![5, 4, 4, 3]);
        ensure!(batch.kind() == Kind::Float);
        ensure!(f64::from(batch.min()) >= -1.0 && f64::from(batch.max()) <= 1.0);

        // the first epoch visits every image exactly once
        let firsts: Vec<i64> = (0..3)
            .map(|index| {
                let value = f64::from(batch.get(index).mean(Kind::Float));
                ((value + 1.0) * 127.5).round() as i64
            })
            .sorted()
            .collect();
        ensure!(firsts == vec![0, 50, 100]);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn empty_dir_test() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "style-grow-empty-{}",
            Local::now().format(crate::FILE_STRFTIME)
        ));
        fs::create_dir_all(&dir)?;
        ensure!(ImageLoader::open(&dir, Device::Cpu).is_err());
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
