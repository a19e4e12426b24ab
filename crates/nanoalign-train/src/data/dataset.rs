//! Dataset trait and batched loader for masked language-model training.

use candle_core::{Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// One training row. All three vectors have the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub input_ids: Vec<u32>,
    /// `input_ids` shifted left by one.
    pub target_ids: Vec<u32>,
    /// 1.0 where the target contributes to the loss.
    pub loss_mask: Vec<f32>,
}

impl Example {
    pub fn n_loss_tokens(&self) -> usize {
        self.loss_mask.iter().filter(|&&m| m > 0.0).count()
    }
}

pub trait Dataset {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get_item(&self, idx: usize) -> Example;
}

/// A stacked batch of examples.
pub struct Batch {
    pub input_ids: Tensor,
    pub target_ids: Tensor,
    pub loss_mask: Tensor,
    /// Tokens that contribute to the loss.
    pub n_tokens: usize,
}

impl Batch {
    pub fn from_examples(examples: &[Example], device: &Device) -> Result<Self> {
        let batch_size = examples.len();
        let Some(first) = examples.first() else {
            candle_core::bail!("cannot build an empty batch");
        };
        let seq_len = first.input_ids.len();
        if examples.iter().any(|e| e.input_ids.len() != seq_len) {
            candle_core::bail!("examples in a batch must share one sequence length");
        }

        let n_tokens = examples.iter().map(Example::n_loss_tokens).sum();
        let inputs: Vec<u32> = examples.iter().flat_map(|e| e.input_ids.iter().copied()).collect();
        let targets: Vec<u32> = examples
            .iter()
            .flat_map(|e| e.target_ids.iter().copied())
            .collect();
        let mask: Vec<f32> = examples.iter().flat_map(|e| e.loss_mask.iter().copied()).collect();

        Ok(Self {
            input_ids: Tensor::from_vec(inputs, (batch_size, seq_len), device)?,
            target_ids: Tensor::from_vec(targets, (batch_size, seq_len), device)?,
            loss_mask: Tensor::from_vec(mask, (batch_size, seq_len), device)?,
            n_tokens,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

/// Batched iterator; the final batch may be smaller.
pub struct DataLoader<'a> {
    dataset: &'a dyn Dataset,
    batch_size: usize,
    indices: Vec<usize>,
    pos: usize,
    device: Device,
}

impl<'a> DataLoader<'a> {
    pub fn new(
        dataset: &'a dyn Dataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: &Device,
    ) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            indices.shuffle(&mut rng);
        }
        Self {
            dataset,
            batch_size: batch_size.max(1),
            indices,
            pos: 0,
            device: device.clone(),
        }
    }

    pub fn n_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.indices.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.indices.len());
        let examples: Vec<Example> = self.indices[self.pos..end]
            .iter()
            .map(|&idx| self.dataset.get_item(idx))
            .collect();
        self.pos = end;
        Some(Batch::from_examples(&examples, &self.device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        n: usize,
    }

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.n
        }

        fn get_item(&self, idx: usize) -> Example {
            let base = idx as u32 * 10;
            Example {
                input_ids: vec![base, base + 1, base + 2],
                target_ids: vec![base + 1, base + 2, base + 3],
                loss_mask: vec![1.0, 1.0, 0.0],
            }
        }
    }

    #[test]
    fn test_loader_yields_smaller_last_batch() {
        let ds = Counting { n: 5 };
        let loader = DataLoader::new(&ds, 2, false, 0, &Device::Cpu);
        assert_eq!(loader.n_batches(), 3);

        let batches: Vec<Batch> = loader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].input_ids.dims(), &[2, 3]);
        assert_eq!(batches[2].batch_size(), 1);
        assert_eq!(batches[0].n_tokens, 4);
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let ds = Counting { n: 8 };
        let first_col = |seed| -> Vec<u32> {
            DataLoader::new(&ds, 8, true, seed, &Device::Cpu)
                .next()
                .unwrap()
                .unwrap()
                .input_ids
                .narrow(1, 0, 1)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<u32>()
                .unwrap()
        };
        assert_eq!(first_col(7), first_col(7));
        let mut sorted = first_col(7);
        sorted.sort_unstable();
        assert_eq!(sorted, (0..8).map(|i| i * 10).collect::<Vec<u32>>());
    }

    #[test]
    fn test_ragged_batch_rejected() {
        let a = Example {
            input_ids: vec![1, 2],
            target_ids: vec![2, 3],
            loss_mask: vec![1.0, 1.0],
        };
        let b = Example {
            input_ids: vec![1],
            target_ids: vec![2],
            loss_mask: vec![1.0],
        };
        assert!(Batch::from_examples(&[a, b], &Device::Cpu).is_err());
        assert!(Batch::from_examples(&[], &Device::Cpu).is_err());
    }
}
