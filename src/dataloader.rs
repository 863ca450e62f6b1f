//! Data loader

use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    datasets::{Dataset, Sample},
    values::{Value, ValueError},
};

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,
    #[error("Dataset is empty")]
    EmptyDataset,
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// A batch of images `[n, ..item_shape]` and their `n` class labels
#[derive(Debug)]
pub struct Batch {
    pub images: Value,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
///
/// The last batch is smaller when the dataset size is not a multiple of the batch size.
pub struct DataLoader<D> {
    dataset: D,
    batch_size: usize,
    shuffle: bool,
    rng: Pcg64Mcg,
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: D, batch_size: usize, shuffle: bool) -> Result<Self, DataLoaderError> {
        Self::with_rng(dataset, batch_size, shuffle, Pcg64Mcg::from_rng(&mut rand::rng()))
    }

    /// A loader whose shuffling order is reproducible
    pub fn seeded(
        dataset: D,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self, DataLoaderError> {
        Self::with_rng(dataset, batch_size, shuffle, Pcg64Mcg::seed_from_u64(seed))
    }

    fn with_rng(
        dataset: D,
        batch_size: usize,
        shuffle: bool,
        rng: Pcg64Mcg,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if dataset.is_empty() {
            return Err(DataLoaderError::EmptyDataset);
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            rng,
        })
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per pass
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a new pass over the dataset, reshuffling if enabled
    pub fn iter(&mut self) -> DataLoaderIterator<'_, D> {
        let mut indices = (0..self.dataset.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(&mut self.rng);
        }
        DataLoaderIterator {
            dataset: &self.dataset,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset
pub struct DataLoaderIterator<'a, D> {
    dataset: &'a D,
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl<D: Dataset> Iterator for DataLoaderIterator<'_, D> {
    type Item = Result<Batch, DataLoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.curr_iter..end];
        self.curr_iter = end;

        // samples are generated on the current rayon pool (the device's, when installed),
        // the batch tensor is assembled afterwards
        let samples = batch_indices
            .par_iter()
            .filter_map(|&i| self.dataset.get(i))
            .collect::<Vec<Sample>>();

        let mut shape = vec![samples.len()];
        shape.extend_from_slice(self.dataset.item_shape());
        let mut images = Vec::with_capacity(shape.iter().product());
        let mut labels = Vec::with_capacity(samples.len());
        for sample in samples {
            images.extend(sample.image);
            labels.push(sample.label);
        }
        Some(
            Value::constant(&shape, images)
                .map(|images| Batch { images, labels })
                .map_err(DataLoaderError::from),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.indices.len() - self.curr_iter).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl<D: Dataset> ExactSizeIterator for DataLoaderIterator<'_, D> {}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use super::*;
    use crate::device::Device;

    /// Sample `i` is an image filled with `i` and labelled `i`
    struct Counting(usize);

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.0
        }

        fn item_shape(&self) -> &[usize] {
            &[1, 3]
        }

        fn get(&self, index: usize) -> Option<Sample> {
            (index < self.0).then(|| Sample {
                image: vec![index as f32; 3],
                label: index,
            })
        }
    }

    #[test]
    fn test_dataloader() {
        let mut dataloader = DataLoader::new(Counting(2), 2, false).unwrap();
        let mut iter = dataloader.iter();
        let batch = iter.next().unwrap().unwrap();
        assert_eq!(batch.images.shape(), vec![2, 1, 3]);
        assert_eq!(
            batch.images,
            Value::constant(&[2, 1, 3], vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap()
        );
        assert_eq!(batch.labels, vec![0, 1]);
        assert!(!batch.images.requires_grad());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_dataloader_partial_last_batch() {
        let mut dataloader = DataLoader::new(Counting(5), 2, false).unwrap();
        assert_eq!(dataloader.len(), 3);
        let sizes = dataloader
            .iter()
            .map(|b| b.unwrap().len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_dataloader_batch_count() {
        let mut dataloader = DataLoader::new(Counting(10000), 500, true).unwrap();
        assert_eq!(dataloader.len(), 20);
        assert_eq!(dataloader.iter().len(), 20);
    }

    #[test]
    fn test_dataloader_shuffle() {
        let seed = 42;
        let mut a = DataLoader::seeded(Counting(50), 10, true, seed).unwrap();
        let mut b = DataLoader::seeded(Counting(50), 10, true, seed).unwrap();
        let labels = |loader: &mut DataLoader<Counting>| {
            loader
                .iter()
                .flat_map(|batch| batch.unwrap().labels)
                .collect::<Vec<_>>()
        };
        let first = labels(&mut a);
        assert_eq!(first, labels(&mut b));
        // every sample is visited exactly once
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_ne!(first, sorted);
        // a new pass reshuffles
        assert_ne!(first, labels(&mut a));
    }

    /// Records which rayon worker generated each sample
    struct ThreadRecorder {
        len: usize,
        workers: Mutex<HashSet<Option<usize>>>,
    }

    impl Dataset for ThreadRecorder {
        fn len(&self) -> usize {
            self.len
        }

        fn item_shape(&self) -> &[usize] {
            &[1]
        }

        fn get(&self, index: usize) -> Option<Sample> {
            self.workers
                .lock()
                .unwrap()
                .insert(rayon::current_thread_index());
            (index < self.len).then(|| Sample {
                image: vec![0.0],
                label: 0,
            })
        }
    }

    fn workers_used(device: Device) -> HashSet<Option<usize>> {
        let dataset = ThreadRecorder {
            len: 4000,
            workers: Mutex::new(HashSet::new()),
        };
        let mut dataloader = DataLoader::new(dataset, 4000, false).unwrap();
        let pool = device.thread_pool().unwrap();
        pool.install(|| {
            let batch = dataloader.iter().next().unwrap().unwrap();
            assert_eq!(batch.len(), 4000);
        });
        dataloader.dataset().workers.lock().unwrap().clone()
    }

    #[test]
    fn test_dataloader_stays_on_device_threads() {
        let single = workers_used(Device::Cpu);
        assert_eq!(single, HashSet::from([Some(0)]));

        let pair = workers_used(Device::with_threads(2));
        assert!(!pair.is_empty());
        assert!(pair.iter().all(|w| matches!(w, Some(0) | Some(1))));
    }

    #[test]
    fn test_dataloader_errors() {
        assert!(matches!(
            DataLoader::new(Counting(2), 0, false),
            Err(DataLoaderError::ZeroBatchSize)
        ));
        assert!(matches!(
            DataLoader::new(Counting(0), 2, false),
            Err(DataLoaderError::EmptyDataset)
        ));
    }
}
