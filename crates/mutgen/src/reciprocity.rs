//! Reciprocity: transpose chains that compose back to the identity.
//!
//! Before the mutation search proper, the same DFS runs once on a trivial
//! identity subgraph with the transpose candidates only; every accepted
//! result is a chain of operator hashes that reproduces its input. During
//! expansion, any op list whose transpose tail replays a known chain has
//! just undone itself and is pruned.

use log::debug;

use crate::config::Options;
use crate::graph::SubGraph;
use crate::ops::Operator;
use crate::search::Generator;

/// Chains longer than this are not searched for; the pruning window walks
/// back at most this many operators.
pub const MAX_RECIPROCITY_DETECT_DEPTH: usize = 3;

/// Shape of the probe tensor the identity subgraph is built on.
const PROBE_DIMS: [usize; 4] = [6, 6, 14, 14];

#[derive(Debug, Default)]
pub struct Reciprocity {
    chains: Vec<Vec<u64>>,
}

impl Reciprocity {
    /// Searches the transpose subset of `candidate_ops` for identity chains.
    pub fn detect(candidate_ops: &[Operator], options: &Options) -> Self {
        let transposes: Vec<Operator> = candidate_ops
            .iter()
            .filter(|op| op.is_transpose_op())
            .map(|op| {
                let mut template = op.clone();
                template.clear();
                template
            })
            .collect();
        if transposes.is_empty() {
            return Self::default();
        }

        let mut graph = SubGraph::new();
        let input = graph.tensor(PROBE_DIMS.to_vec());
        if graph.identity(input).is_err() || graph.finalize().is_err() {
            return Self::default();
        }

        let mut finder = Generator::with_mode(options.clone(), false);
        let results = finder.run(&mut graph, MAX_RECIPROCITY_DETECT_DEPTH, transposes, 0.99);

        let chains: Vec<Vec<u64>> = results
            .iter()
            .map(|graph| graph.ops().iter().map(|op| op.op_hash()).collect())
            .collect();
        debug!("detected {} reciprocity chain(s)", chains.len());
        Self { chains }
    }

    pub fn chains(&self) -> &[Vec<u64>] {
        &self.chains
    }

    /// Walks the contiguous transpose tail of `oplist` backwards (always
    /// through input 0, matching the single-predecessor policy of the chain
    /// search) and reports whether any known chain is a suffix of it.
    pub fn is_tail_reciprocity(&self, oplist: &[Operator], graph: &SubGraph) -> bool {
        if self.chains.is_empty() || oplist.is_empty() {
            return false;
        }
        let mut tail: Vec<u64> = Vec::with_capacity(MAX_RECIPROCITY_DETECT_DEPTH);
        let mut current = oplist.last();
        for _ in 0..MAX_RECIPROCITY_DETECT_DEPTH {
            match current {
                Some(op) if op.is_transpose_op() => {
                    tail.push(op.op_hash());
                    current = graph.producer_of(op.inputs[0]);
                }
                _ => break,
            }
        }
        if tail.is_empty() {
            return false;
        }
        // `tail` is bottom-up; the stored chains are top-down.
        self.chains.iter().any(|chain| {
            chain.len() <= tail.len()
                && chain
                    .iter()
                    .enumerate()
                    .all(|(i, hash)| *hash == tail[tail.len() - 1 - i])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::TransKind;

    fn n2h() -> Operator {
        Operator::transpose_split(0, vec![vec![0], vec![1], vec![-1, 2], vec![3]], 2, TransKind::N2H)
    }

    fn h2n() -> Operator {
        Operator::transpose_split(2, vec![vec![0, 2], vec![1], vec![-1], vec![3]], -2, TransKind::H2N)
    }

    #[test]
    fn inverse_pair_is_detected() {
        let reciprocity = Reciprocity::detect(&[n2h(), h2n()], &Options::default());
        assert!(!reciprocity.chains().is_empty());
        let expected = vec![n2h().op_hash(), h2n().op_hash()];
        assert!(reciprocity.chains().iter().any(|c| *c == expected));
    }

    #[test]
    fn tail_match_prunes_an_undoing_pair() {
        let reciprocity = Reciprocity::detect(&[n2h(), h2n()], &Options::default());

        let mut graph = SubGraph::new();
        let input = graph.tensor(vec![4, 6, 14, 14]);
        let mid = graph
            .add_op(n2h(), vec![input])
            .expect("n2h applies to the probe shape")[0];
        graph.add_op(h2n(), vec![mid]).expect("h2n inverts n2h");
        graph.finalize().unwrap();

        assert!(reciprocity.is_tail_reciprocity(graph.ops(), &graph));
        assert!(!reciprocity.is_tail_reciprocity(&graph.ops()[..1], &graph));
    }

    #[test]
    fn no_transpose_candidates_mean_no_chains() {
        let reciprocity = Reciprocity::detect(&[Operator::concat(0)], &Options::default());
        assert!(reciprocity.chains().is_empty());
    }
}
