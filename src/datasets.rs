//! Synthetic image classification datasets
//!
//! Samples are regenerated on demand from their index, so a dataset of full size
//! images never has to be held in memory.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A single labelled image, `image` is row-major with the dataset's `item_shape`
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Vec<f32>,
    pub label: usize,
}

/// Random access collection of samples, analogous to `torch.utils.data.Dataset`
pub trait Dataset: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of a single image, excluding the batch dimension
    fn item_shape(&self) -> &[usize];

    /// Returns `None` when `index` is out of range
    fn get(&self, index: usize) -> Option<Sample>;
}

/// Random images with random labels, analogous to `torchvision.datasets.FakeData`
///
/// Sample `i` is drawn from a generator seeded with `random_offset + i`. Pixels are
/// random bytes scaled into `[0, 1]`, the same range an image-to-tensor conversion yields.
#[derive(Debug, Clone)]
pub struct FakeData {
    size: usize,
    image_shape: Vec<usize>,
    num_classes: usize,
    random_offset: u64,
}

impl FakeData {
    pub const DEFAULT_IMAGE_SHAPE: [usize; 3] = [3, 224, 224];

    pub fn new(size: usize, image_shape: &[usize], num_classes: usize, random_offset: u64) -> Self {
        Self {
            size,
            image_shape: image_shape.to_vec(),
            num_classes,
            random_offset,
        }
    }

    /// A dataset whose offset is drawn from the thread rng
    pub fn random(size: usize, image_shape: &[usize], num_classes: usize) -> Self {
        Self::new(size, image_shape, num_classes, rand::rng().random())
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn image_len(&self) -> usize {
        self.image_shape.iter().product()
    }
}

impl Dataset for FakeData {
    fn len(&self) -> usize {
        self.size
    }

    fn item_shape(&self) -> &[usize] {
        &self.image_shape
    }

    fn get(&self, index: usize) -> Option<Sample> {
        if index >= self.size {
            return None;
        }
        let mut rng = Pcg64Mcg::seed_from_u64(self.random_offset.wrapping_add(index as u64));
        let label = if self.num_classes == 0 {
            0
        } else {
            rng.random_range(0..self.num_classes)
        };
        let mut pixels = vec![0u8; self.image_len()];
        rng.fill(&mut pixels[..]);
        let image = pixels.into_iter().map(|p| p as f32 / 255.0).collect();
        Some(Sample { image, label })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_data() {
        let dataset = FakeData::new(8, &[3, 4, 4], 10, 7);
        assert_eq!(dataset.len(), 8);
        assert_eq!(dataset.item_shape(), &[3, 4, 4]);
        for i in 0..dataset.len() {
            let sample = dataset.get(i).unwrap();
            assert_eq!(sample.image.len(), 48);
            assert!(sample.label < 10);
            assert!(sample.image.iter().all(|p| (0.0..=1.0).contains(p)));
        }
        assert_eq!(dataset.get(8), None);
    }

    #[test]
    fn test_fake_data_is_deterministic() {
        let a = FakeData::new(4, &[3, 2, 2], 5, 42);
        let b = FakeData::new(4, &[3, 2, 2], 5, 42);
        assert_eq!(a.get(3), b.get(3));
        // each index gets its own stream
        assert_ne!(a.get(0).unwrap().image, a.get(1).unwrap().image);
    }

    #[test]
    fn test_fake_data_offsets_differ() {
        let a = FakeData::new(4, &[3, 8, 8], 5, 0);
        let b = FakeData::new(4, &[3, 8, 8], 5, 1_000_000);
        assert_ne!(a.get(0).unwrap().image, b.get(0).unwrap().image);
    }
}
