//! Image dataset implementing burn's `Dataset` trait.

use std::ops::Range;
use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use image::imageops::FilterType;

use crate::error::ForgetError;

/// One labelled image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

impl Sample {
    pub fn new(path: impl Into<PathBuf>, label: usize) -> Self {
        Self {
            path: path.into(),
            label,
        }
    }
}

/// A decoded image ready for batching.
#[derive(Debug, Clone)]
pub struct ImageItem {
    /// CHW pixels scaled to [-1, 1], length `3 * height * width`.
    pub image: Vec<f32>,
    pub label: usize,
    pub path: String,
}

impl ImageItem {
    /// Decode, resize and normalize the image at `path`.
    pub fn from_path(
        path: &Path,
        label: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, ForgetError> {
        let img = image::open(path)?
            .resize_exact(width as u32, height as u32, FilterType::Triangle)
            .to_rgb8();

        let plane = height * width;
        let mut image = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for channel in 0..3 {
                // InceptionV3 expects inputs in [-1, 1].
                image[channel * plane + offset] = pixel[channel] as f32 / 127.5 - 1.0;
            }
        }

        Ok(Self {
            image,
            label,
            path: path.to_string_lossy().to_string(),
        })
    }

    /// Mirror the image left to right.
    pub fn flip_horizontal(&mut self, height: usize, width: usize) {
        for row in self.image.chunks_exact_mut(width).take(3 * height) {
            row.reverse();
        }
    }
}

/// Labelled images decoded on demand.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    samples: Vec<Sample>,
    height: usize,
    width: usize,
}

impl ImageDataset {
    pub fn new(samples: Vec<Sample>, height: usize, width: usize) -> Self {
        Self {
            samples,
            height,
            width,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Decode the item at `index`, reporting failures instead of skipping them.
    pub fn load(&self, index: usize) -> Result<ImageItem, ForgetError> {
        let sample = self.samples.get(index).ok_or_else(|| {
            ForgetError::dataset(format!(
                "index {index} out of range for {} samples",
                self.samples.len()
            ))
        })?;
        ImageItem::from_path(&sample.path, sample.label, self.height, self.width)
    }

    /// Decode a contiguous range of items.
    pub fn load_range(&self, range: Range<usize>) -> Result<Vec<ImageItem>, ForgetError> {
        range.map(|i| self.load(i)).collect()
    }

    /// Samples per class, indexed by label.
    pub fn class_distribution(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0usize; num_classes];
        for sample in &self.samples {
            if let Some(count) = counts.get_mut(sample.label) {
                *count += 1;
            }
        }
        counts
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        match self.load(index) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping unreadable image");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let img = RgbImage::from_fn(width, height, |x, _| {
            if x == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) }
        });
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_item_is_chw_and_normalized() {
        let dir = TempDir::new().unwrap();
        let path = write_image(dir.path(), "a.png", 4, 3);
        let item = ImageItem::from_path(&path, 1, 3, 4).unwrap();
        assert_eq!(item.image.len(), 3 * 3 * 4);
        assert_eq!(item.label, 1);
        // Red channel of the first column is 255 -> 1.0, blue is 0 -> -1.0.
        assert!((item.image[0] - 1.0).abs() < 1e-6);
        assert!((item.image[2 * 12] + 1.0).abs() < 1e-6);
        assert!(item.image.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_flip_horizontal() {
        let dir = TempDir::new().unwrap();
        let path = write_image(dir.path(), "b.png", 4, 3);
        let mut item = ImageItem::from_path(&path, 0, 3, 4).unwrap();
        item.flip_horizontal(3, 4);
        // The bright red column moved to the right edge.
        assert!((item.image[3] - 1.0).abs() < 1e-6);
        assert!((item.image[0] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dataset_len_and_errors() {
        let dir = TempDir::new().unwrap();
        let good = write_image(dir.path(), "c.png", 8, 8);
        let dataset = ImageDataset::new(
            vec![Sample::new(good, 0), Sample::new(dir.path().join("missing.png"), 1)],
            8,
            8,
        );
        assert_eq!(dataset.len(), 2);
        assert!(dataset.get(0).is_some());
        assert!(dataset.get(1).is_none());
        assert!(dataset.load(1).is_err());
        assert!(dataset.load(5).is_err());
        assert_eq!(dataset.class_distribution(2), vec![1, 1]);
    }
}
