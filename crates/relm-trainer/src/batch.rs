//! Batching of encoded examples into tensors.

use anyhow::{Result, bail};
use candle_core::{Device, Tensor};
use oorandom::Rand32;

use relm_core::{Feature, TaskName};

/// Stacked model inputs of one batch. `features` keeps the host-side
/// labels and slot layout.
pub struct Batch {
    pub input_ids: Tensor,
    pub token_type_ids: Tensor,
    pub attention_mask: Tensor,
    pub features: Vec<Feature>,
    pub seq_len: usize,
}

impl Batch {
    /// Stack padded features into `(batch, seq)` tensors.
    pub fn new(features: Vec<Feature>, device: &Device) -> Result<Self> {
        let Some(first) = features.first() else {
            bail!("empty batch");
        };
        let seq_len = first.input_ids.len();
        if features.iter().any(|f| f.input_ids.len() != seq_len) {
            bail!("features of one batch must share the padded length");
        }
        let rows = features.len();
        let stack = |flat: Vec<u32>| Tensor::from_vec(flat, (rows, seq_len), device);
        let input_ids = stack(features.iter().flat_map(|f| f.input_ids.iter().copied()).collect())?;
        let token_type_ids =
            stack(features.iter().flat_map(|f| f.token_type_ids.iter().copied()).collect())?;
        let attention_mask =
            stack(features.iter().flat_map(|f| f.attention_mask.iter().copied()).collect())?;
        Ok(Self {
            input_ids,
            token_type_ids,
            attention_mask,
            features,
            seq_len,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Batch rows grouped by task, in task order.
    #[must_use]
    pub fn rows_by_task(&self) -> Vec<(TaskName, Vec<u32>)> {
        let mut groups: Vec<(TaskName, Vec<u32>)> = Vec::new();
        for (row, feature) in self.features.iter().enumerate() {
            match groups.iter_mut().find(|(t, _)| *t == feature.task) {
                Some((_, rows)) => rows.push(row as u32),
                None => groups.push((feature.task, vec![row as u32])),
            }
        }
        groups.sort_by_key(|(t, _)| *t);
        groups
    }

    /// Flattened labelled positions of `rows` with their target ids.
    #[must_use]
    pub fn labelled_positions(&self, rows: &[u32]) -> (Vec<u32>, Vec<u32>) {
        let mut positions = Vec::new();
        let mut targets = Vec::new();
        for &row in rows {
            let feature = &self.features[row as usize];
            for (pos, label) in feature.masked_positions().into_iter().zip(feature.compact_labels()) {
                positions.push((row as usize * self.seq_len + pos) as u32);
                targets.push(label);
            }
        }
        (positions, targets)
    }

    /// Flattened slot positions of `rows`, one per kept source character.
    #[must_use]
    pub fn slot_positions(&self, rows: &[u32]) -> Vec<u32> {
        rows.iter()
            .flat_map(|&row| {
                let base = row as usize * self.seq_len;
                self.features[row as usize]
                    .slot_range()
                    .map(move |pos| (base + pos) as u32)
            })
            .collect()
    }
}

/// Splits example indices into batches.
#[derive(Debug, Clone, Copy)]
pub struct DataLoader {
    len: usize,
    batch_size: usize,
}

impl DataLoader {
    pub fn new(len: usize, batch_size: usize) -> Self {
        Self {
            len,
            batch_size: batch_size.max(1),
        }
    }

    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    /// Batches in dataset order.
    #[must_use]
    pub fn sequential(&self) -> Vec<Vec<usize>> {
        let order: Vec<usize> = (0..self.len).collect();
        self.chunk(&order)
    }

    /// Batches over a fresh permutation, so tasks of a multi-task run mix.
    pub fn shuffled(&self, rng: &mut Rand32) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len).collect();
        for i in (1..order.len()).rev() {
            let j = rng.rand_range(0..(i as u32 + 1)) as usize;
            order.swap(i, j);
        }
        self.chunk(&order)
    }

    fn chunk(&self, order: &[usize]) -> Vec<Vec<usize>> {
        order.chunks(self.batch_size).map(<[usize]>::to_vec).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relm_core::IGNORE_INDEX;

    fn feature(task: TaskName, labels: Vec<i64>) -> Feature {
        let len = labels.len();
        Feature {
            task,
            input_ids: vec![1; len],
            attention_mask: vec![1; len],
            token_type_ids: vec![0; len],
            labels,
            class_label: None,
            slot_start: 2,
            source_len: 1,
        }
    }

    #[test]
    fn test_shuffled_is_permutation() {
        let loader = DataLoader::new(10, 3);
        let batches = loader.shuffled(&mut Rand32::new(7));
        assert_eq!(batches.len(), 4);
        let mut all: Vec<usize> = batches.concat();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequential() {
        let loader = DataLoader::new(5, 2);
        assert_eq!(loader.sequential(), vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn test_batch_positions() {
        let features = vec![
            feature(TaskName::Ecspell, vec![IGNORE_INDEX, 7, IGNORE_INDEX, 9]),
            feature(TaskName::Tnews, vec![IGNORE_INDEX; 4]),
            feature(TaskName::Ecspell, vec![IGNORE_INDEX, IGNORE_INDEX, 5, IGNORE_INDEX]),
        ];
        let batch = Batch::new(features, &Device::Cpu).unwrap();
        assert_eq!(batch.input_ids.dims(), &[3, 4]);

        let groups = batch.rows_by_task();
        assert_eq!(groups, vec![(TaskName::Ecspell, vec![0, 2]), (TaskName::Tnews, vec![1])]);

        let (positions, targets) = batch.labelled_positions(&[0, 2]);
        assert_eq!(positions, vec![1, 3, 10]);
        assert_eq!(targets, vec![7, 9, 5]);
        assert_eq!(batch.slot_positions(&[0, 2]), vec![2, 10]);
    }

    #[test]
    fn test_ragged_batch_is_rejected() {
        let features = vec![
            feature(TaskName::Ecspell, vec![IGNORE_INDEX; 4]),
            feature(TaskName::Ecspell, vec![IGNORE_INDEX; 3]),
        ];
        assert!(Batch::new(features, &Device::Cpu).is_err());
    }
}
