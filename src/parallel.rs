//! Caller-selected execution strategies for a pure forward pass.
//!
//! The networks never look at how many shards run them; callers wrap a
//! forward closure in a strategy instead.

use log::debug;
use tch::Tensor;

use crate::error::{Error, Result};

pub trait ForwardStrategy {
    /// Runs `forward` over `inputs` (and the matching `labels`, if any) and
    /// returns outputs in original batch order.
    fn run<F>(&self, inputs: &Tensor, labels: Option<&Tensor>, forward: F) -> Result<Tensor>
    where
        F: FnMut(&Tensor, Option<&Tensor>) -> Result<Tensor>;
}

/// Whole batch in one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleForward;

impl ForwardStrategy for SingleForward {
    fn run<F>(&self, inputs: &Tensor, labels: Option<&Tensor>, mut forward: F) -> Result<Tensor>
    where
        F: FnMut(&Tensor, Option<&Tensor>) -> Result<Tensor>,
    {
        forward(inputs, labels)
    }
}

/// Splits the batch axis into up to `shards` contiguous slices, runs each
/// slice through the same forward pass and concatenates the results.
#[derive(Debug, Clone, Copy)]
pub struct ShardedForward {
    shards: usize,
}

impl ShardedForward {
    pub fn new(shards: usize) -> Result<Self> {
        if shards == 0 {
            return Err(Error::config("shard count must be at least 1"));
        }
        Ok(Self { shards })
    }

    pub fn shards(&self) -> usize {
        self.shards
    }
}

impl ForwardStrategy for ShardedForward {
    fn run<F>(&self, inputs: &Tensor, labels: Option<&Tensor>, mut forward: F) -> Result<Tensor>
    where
        F: FnMut(&Tensor, Option<&Tensor>) -> Result<Tensor>,
    {
        let batch = match inputs.size().first() {
            Some(&batch) if batch > 0 => batch,
            _ => return Err(Error::contract("sharded forward needs a non-empty batch axis")),
        };
        if let Some(labels) = labels {
            if labels.dim() != 1 || labels.size()[0] != batch {
                return Err(Error::contract(format!(
                    "sharded forward: expected {batch} labels, got {:?}",
                    labels.size()
                )));
            }
        }

        let shards = (self.shards as i64).min(batch);
        let input_chunks = inputs.chunk(shards, 0);
        let label_chunks = labels.map(|labels| labels.chunk(shards, 0));
        debug!("running batch of {} as {} shards", batch, input_chunks.len());

        let outputs = input_chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let label_chunk = label_chunks.as_ref().map(|chunks| &chunks[index]);
                forward(chunk, label_chunk)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outputs, 0))
    }
}
