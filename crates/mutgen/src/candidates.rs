//! Candidate-op libraries.
//!
//! For each shape kind a fixed list of operator templates drives the DFS,
//! together with the recommended search depth and, for grouped shapes, the
//! group size that offsets the expansion windows.

use crate::classify::SgKind;
use crate::config::Options;
use crate::graph::SubGraph;
use crate::ops::{OpParams, Operator, Padding, TransKind};

/// Candidate templates plus the search parameters they imply.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub ops: Vec<Operator>,
    pub max_depth: usize,
    pub group_size: usize,
}

impl CandidateSet {
    fn with_depth(max_depth: usize) -> Self {
        Self {
            ops: Vec::new(),
            max_depth,
            group_size: 0,
        }
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub(crate) fn gcd_all(values: &[usize]) -> usize {
    values.iter().copied().fold(0, gcd).max(1)
}

fn conv_params(graph: &SubGraph) -> Option<&crate::ops::ConvParams> {
    match &graph.ops().first()?.params {
        OpParams::Conv(p) => Some(p),
        _ => None,
    }
}

/// Last-two-axes swap on rank-4 tensors.
pub(crate) fn swap_rs() -> Operator {
    Operator::transpose(vec![0, 1, 3, 2])
}

/// Builds the candidate set for a classified subgraph, honoring the
/// equivalence gates.
pub fn for_kind(kind: SgKind, graph: &SubGraph, options: &Options) -> CandidateSet {
    match kind {
        SgKind::Conv1x1 => CandidateSet::with_depth(3),
        SgKind::NormalConv => normal_conv(graph),
        SgKind::NormalOddConv => normal_odd_conv(graph, options),
        SgKind::DilatedConv => dilated_conv(graph, options),
        SgKind::TransKernelConv => trans_kernel_conv(graph),
        SgKind::GroupConv => group_conv(graph),
        SgKind::TransposeGroupConv => transpose_group_conv(graph),
        SgKind::NormalMatmul => normal_matmul(options),
        SgKind::BatchMatmul => CandidateSet::with_depth(4),
        SgKind::Empty | SgKind::Others => CandidateSet::with_depth(3),
    }
}

fn normal_conv(graph: &SubGraph) -> CandidateSet {
    let mut set = CandidateSet::with_depth(3);
    let Some(conv) = conv_params(graph) else {
        return set;
    };
    let pm = conv.padding;

    // n->h and back
    set.ops.push(Operator::transpose_split(
        0,
        vec![vec![0], vec![1], vec![-1, 2], vec![3]],
        2,
        TransKind::N2H,
    ));
    set.ops.push(Operator::transpose_split(
        2,
        vec![vec![0, 2], vec![1], vec![-1], vec![3]],
        -2,
        TransKind::H2N,
    ));

    // n->w and back
    set.ops.push(Operator::transpose_split(
        0,
        vec![vec![0], vec![1], vec![2], vec![-1, 3]],
        2,
        TransKind::N2W,
    ));
    set.ops.push(Operator::transpose_split(
        3,
        vec![vec![0, 3], vec![1], vec![2], vec![-1]],
        -2,
        TransKind::W2N,
    ));

    // c->h
    set.ops.push(Operator::transpose_split(
        1,
        vec![vec![0], vec![1], vec![2, -1], vec![3]],
        2,
        TransKind::C2H,
    ));
    set.ops.push(Operator::conv(pm, (2, 1), (1, 1)));

    // c->w
    set.ops.push(Operator::transpose_split(
        1,
        vec![vec![0], vec![1], vec![2], vec![3, -1]],
        2,
        TransKind::C2W,
    ));
    set.ops.push(Operator::conv(pm, (1, 2), (1, 1)));

    // c->hw
    set.ops.push(Operator::conv(pm, (2, 2), (1, 1)));

    // the original op
    set.ops.push(Operator::conv(pm, (1, 1), (1, 1)));
    set
}

fn normal_odd_conv(graph: &SubGraph, options: &Options) -> CandidateSet {
    let mut set = CandidateSet::with_depth(3);
    if !options.enable_nonequivalent {
        return set;
    }
    let Some(conv) = conv_params(graph) else {
        return set;
    };
    set.ops
        .push(Operator::pad(vec![0, 0, 0, 0], vec![0, 0, 1, 1]));
    set.ops
        .push(Operator::slice(vec![0, 0, 0, 0], vec![0, 0, 1, 1]));
    set.ops.push(Operator::conv(conv.padding, (1, 1), (1, 1)));
    set
}

fn dilated_conv(graph: &SubGraph, options: &Options) -> CandidateSet {
    let mut set = CandidateSet::with_depth(3);
    if !options.enable_nonequivalent {
        return set;
    }
    let Some(conv) = conv_params(graph) else {
        return set;
    };
    let d2h = |factor| {
        Operator::transpose_split(
            2,
            vec![vec![0], vec![1], vec![-1, 2], vec![3]],
            factor,
            TransKind::D2H,
        )
    };
    let d2w = |factor| {
        Operator::transpose_split(
            3,
            vec![vec![0], vec![1], vec![2], vec![-1, 3]],
            factor,
            TransKind::D2W,
        )
    };
    set.ops.push(d2h(2));
    set.ops.push(d2w(2));
    set.ops.push(d2h(-2));
    set.ops.push(d2w(-2));
    set.ops.push(Operator::conv(conv.padding, (1, 1), (1, 1)));
    set.ops.push(Operator::conv(conv.padding, (1, 1), (2, 1)));
    set.ops.push(Operator::conv(conv.padding, (1, 1), (1, 2)));
    set
}

fn trans_kernel_conv(graph: &SubGraph) -> CandidateSet {
    let mut set = CandidateSet::with_depth(4);
    let Some(conv) = conv_params(graph) else {
        return set;
    };
    set.ops.push(swap_rs());
    set.ops.push(Operator::conv(conv.padding, (1, 1), (1, 1)));
    set
}

fn group_conv(graph: &SubGraph) -> CandidateSet {
    let mut set = CandidateSet::with_depth(4);
    let fvec: Vec<usize> = graph
        .ops()
        .iter()
        .map(|op| graph.tensor_ref(op.inputs[1]).dims[0])
        .collect();
    let fgcd = gcd_all(&fvec);
    let split_ratios: Vec<usize> = fvec.iter().map(|f| f / fgcd).collect();

    // The original conv, parameters and all.
    if let Some(conv) = conv_params(graph) {
        set.ops.push(Operator::conv_with(conv.clone()));
    }
    set.ops.push(Operator::concat(0));
    set.ops.push(Operator::concat(1));
    set.ops.push(Operator::split(1, split_ratios));
    set.group_size = fvec.len();
    set
}

fn transpose_group_conv(graph: &SubGraph) -> CandidateSet {
    let mut set = CandidateSet::with_depth(4);
    set.ops.push(Operator::conv(Padding::Same, (1, 1), (1, 1)));
    set.ops.push(Operator::concat(0));
    set.ops.push(Operator::concat(1));
    set.ops
        .push(Operator::split(1, vec![1; graph.ops().len()]));
    set.ops.push(swap_rs());
    set
}

fn normal_matmul(options: &Options) -> CandidateSet {
    let mut set = CandidateSet::with_depth(4);
    if !options.enable_equivalent {
        return set;
    }
    set.ops.push(Operator::matmul(true, false));
    set.ops.push(Operator::matmul(true, true));
    set.ops.push(Operator::matmul(false, false));
    set.ops.push(Operator::matmul(false, true));
    set.ops.push(Operator::transpose(vec![0, 2, 1]));
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;

    fn normal_conv_graph() -> SubGraph {
        let mut g = SubGraph::new();
        let i = g.tensor(vec![2, 4, 6, 6]);
        let w = g.tensor(vec![4, 4, 3, 3]);
        g.conv(i, w, Padding::Fixed(1, 1), (1, 1), (1, 1)).unwrap();
        g.finalize().unwrap();
        g
    }

    #[test]
    fn normal_conv_library_has_transpose_pairs() {
        let g = normal_conv_graph();
        let set = for_kind(classify(&g), &g, &Options::default());
        assert_eq!(set.max_depth, 3);
        assert_eq!(set.ops.iter().filter(|o| o.is_transpose_op()).count(), 6);
        assert_eq!(set.ops.iter().filter(|o| o.is_compute_op()).count(), 4);
    }

    #[test]
    fn group_conv_split_sizes_are_gcd_derived() {
        let mut g = SubGraph::new();
        for f in [4usize, 8] {
            let i = g.tensor(vec![1, 2, 8, 8]);
            let w = g.tensor(vec![f, 2, 3, 3]);
            g.conv(i, w, Padding::Same, (1, 1), (1, 1)).unwrap();
        }
        g.finalize().unwrap();
        let set = for_kind(SgKind::GroupConv, &g, &Options::default());
        assert_eq!(set.group_size, 2);
        let split = set
            .ops
            .iter()
            .find_map(|o| match &o.params {
                OpParams::Split(p) => Some(p.sizes.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(split, vec![1, 2]);
    }

    #[test]
    fn non_equivalent_gate_empties_the_odd_conv_library() {
        let mut g = SubGraph::new();
        let i = g.tensor(vec![1, 2, 5, 5]);
        let w = g.tensor(vec![4, 2, 3, 3]);
        g.conv(i, w, Padding::Fixed(1, 1), (1, 1), (1, 1)).unwrap();
        g.finalize().unwrap();

        let open = for_kind(SgKind::NormalOddConv, &g, &Options::default());
        assert_eq!(open.ops.len(), 3);

        let gated = Options {
            enable_nonequivalent: false,
            ..Options::default()
        };
        assert!(for_kind(SgKind::NormalOddConv, &g, &gated).ops.is_empty());
    }
}
