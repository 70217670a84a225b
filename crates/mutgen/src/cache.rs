//! Mutation cache for single-compute-op inputs.
//!
//! Results of a normal-conv search are keyed by the operator's structural
//! hash mixed with prime-weighted dot products of its input and output dims,
//! so two convolutions with the same parameters and shapes share one entry.
//! The cache is owned by its generator; callers that search from several
//! threads keep one generator (and therefore one cache) per thread.

use hashbrown::HashMap;

use crate::graph::SubGraph;
use crate::ops::{OpKind, Operator};

const INPUT_PRIMES: [u64; 4] = [10_000_019, 10_000_079, 10_000_103, 10_000_121];
const OUTPUT_PRIMES: [u64; 4] = [10_000_139, 10_000_141, 10_000_169, 10_000_189];

#[derive(Debug, Default)]
pub struct MutationCache {
    entries: HashMap<u64, Vec<SubGraph>>,
    matmul_counter: u64,
}

impl MutationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for a bound single compute operator. Matmul keys fall back
    /// to a monotone counter, which keeps their entries private.
    pub fn key_for(&mut self, op: &Operator, graph: &SubGraph) -> Option<u64> {
        match op.kind() {
            OpKind::Conv => {
                let input = &graph.tensor_ref(op.inputs[0]).dims;
                let output = &graph.tensor_ref(op.outputs[0]).dims;
                if input.len() != 4 || output.len() != 4 {
                    return None;
                }
                let mut hash = op.op_hash();
                for (d, p) in input.iter().zip(INPUT_PRIMES.iter()) {
                    hash = hash.wrapping_add((*d as u64).wrapping_mul(*p));
                }
                for (d, p) in output.iter().zip(OUTPUT_PRIMES.iter()) {
                    hash = hash.wrapping_add((*d as u64).wrapping_mul(*p));
                }
                Some(hash)
            }
            OpKind::Matmul => {
                let key = self.matmul_counter;
                self.matmul_counter += 1;
                Some(key)
            }
            _ => None,
        }
    }

    pub fn get(&self, key: u64) -> Option<&[SubGraph]> {
        self.entries.get(&key).map(|v| v.as_slice())
    }

    /// Stores search results for a key, first writer wins.
    pub fn insert(&mut self, key: u64, graphs: &[SubGraph]) {
        self.entries.entry(key).or_insert_with(|| graphs.to_vec());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
