//! Batch assembly and the endless training stream.

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::Rng;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use super::dataset::{ImageDataset, ImageItem};
use crate::error::ForgetError;

/// A batch of images with shape `[N, 3, H, W]` and integer targets `[N]`.
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stacks decoded images of one size into an [`ImageBatch`].
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    height: usize,
    width: usize,
}

impl ImageBatcher {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn for_dataset(dataset: &ImageDataset) -> Self {
        Self::new(dataset.height(), dataset.width())
    }

    /// Batch after checking that every item has the expected size.
    pub fn try_batch<B: Backend>(
        &self,
        items: &[ImageItem],
        device: &B::Device,
    ) -> Result<ImageBatch<B>, ForgetError> {
        if items.is_empty() {
            return Err(ForgetError::dataset("cannot build an empty batch"));
        }
        let expected = 3 * self.height * self.width;
        if let Some(item) = items.iter().find(|item| item.image.len() != expected) {
            return Err(ForgetError::dataset(format!(
                "{} has {} values, expected {expected}",
                item.path,
                item.image.len()
            )));
        }
        Ok(self.stack(items, device))
    }

    fn stack<B: Backend>(&self, items: &[ImageItem], device: &B::Device) -> ImageBatch<B> {
        let n = items.len();
        let pixels: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();

        let shape = [n, 3, self.height, self.width];
        let images = Tensor::<B, 4>::from_data(TensorData::new(pixels, shape), device);
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [n]), device);
        ImageBatch { images, targets }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        self.stack(&items, device)
    }
}

/// Endless, reshuffling batch source over a dataset.
///
/// Every call yields a full batch; the order is reshuffled each time the
/// dataset is exhausted, so any number of steps per epoch can be drawn.
pub struct BatchStream<'a> {
    dataset: &'a ImageDataset,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: ChaCha8Rng,
    augment: bool,
}

impl<'a> BatchStream<'a> {
    pub fn new(
        dataset: &'a ImageDataset,
        batch_size: usize,
        seed: u64,
        augment: bool,
    ) -> Result<Self, ForgetError> {
        if dataset.is_empty() {
            return Err(ForgetError::dataset("training dataset is empty"));
        }
        if batch_size == 0 {
            return Err(ForgetError::invalid_input("batch size must be greater than 0"));
        }
        let mut stream = Self {
            dataset,
            batch_size,
            order: (0..dataset.len()).collect(),
            cursor: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            augment,
        };
        stream.order.shuffle(&mut stream.rng);
        Ok(stream)
    }

    /// Indices of the next batch.
    pub fn next_indices(&mut self) -> Vec<usize> {
        let mut indices = Vec::with_capacity(self.batch_size);
        while indices.len() < self.batch_size {
            if self.cursor == self.order.len() {
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            indices.push(self.order[self.cursor]);
            self.cursor += 1;
        }
        indices
    }

    /// Decode the next batch, applying augmentation when enabled.
    pub fn next_items(&mut self) -> Result<Vec<ImageItem>, ForgetError> {
        let (height, width) = (self.dataset.height(), self.dataset.width());
        let indices = self.next_indices();
        let mut items = Vec::with_capacity(indices.len());
        for index in indices {
            let mut item = self.dataset.load(index)?;
            if self.augment && self.rng.gen_bool(0.5) {
                item.flip_horizontal(height, width);
            }
            items.push(item);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::Sample;
    use burn::backend::NdArray;
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;

    fn fake_dataset(n: usize) -> ImageDataset {
        let samples = (0..n).map(|i| Sample::new(format!("img_{i}.jpg"), i % 2)).collect();
        ImageDataset::new(samples, 4, 4)
    }

    #[test]
    fn test_stream_covers_dataset_before_repeating() {
        let dataset = fake_dataset(10);
        let mut stream = BatchStream::new(&dataset, 4, 7, false).unwrap();
        let mut seen = HashSet::new();
        for index in stream.next_indices().into_iter().chain(stream.next_indices()) {
            seen.insert(index);
        }
        // 8 draws from a fresh permutation of 10 are all distinct.
        assert_eq!(seen.len(), 8);
        // The third batch wraps around and still has a full batch size.
        assert_eq!(stream.next_indices().len(), 4);
    }

    #[test]
    fn test_stream_is_deterministic_for_seed() {
        let dataset = fake_dataset(16);
        let mut a = BatchStream::new(&dataset, 5, 3, false).unwrap();
        let mut b = BatchStream::new(&dataset, 5, 3, false).unwrap();
        for _ in 0..5 {
            assert_eq!(a.next_indices(), b.next_indices());
        }
    }

    #[test]
    fn test_stream_rejects_empty_dataset() {
        let dataset = fake_dataset(0);
        assert!(BatchStream::new(&dataset, 4, 0, false).is_err());
    }

    fn items(n: usize, len: usize) -> Vec<ImageItem> {
        (0..n)
            .map(|i| ImageItem {
                image: vec![0.5; len],
                label: i % 2,
                path: format!("{i}.jpg"),
            })
            .collect()
    }

    #[test]
    fn test_batch_shapes() {
        let device = Default::default();
        let batch: ImageBatch<TestBackend> =
            ImageBatcher::new(2, 5).try_batch(&items(3, 3 * 2 * 5), &device).unwrap();
        assert_eq!(batch.images.dims(), [3, 3, 2, 5]);
        assert_eq!(batch.len(), 3);
        let targets: Vec<i64> = batch.targets.into_data().to_vec().unwrap();
        assert_eq!(targets, vec![0, 1, 0]);
    }

    #[test]
    fn test_batcher_trait() {
        let device = Default::default();
        let batch: ImageBatch<TestBackend> = ImageBatcher::new(2, 2).batch(items(4, 12), &device);
        assert_eq!(batch.images.dims(), [4, 3, 2, 2]);
    }

    #[test]
    fn test_batch_rejects_wrong_size() {
        let device = Default::default();
        let batcher = ImageBatcher::new(2, 2);
        assert!(batcher.try_batch::<TestBackend>(&items(1, 7), &device).is_err());
        assert!(batcher.try_batch::<TestBackend>(&[], &device).is_err());
    }
}
