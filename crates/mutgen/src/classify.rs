//! Subgraph shape classifier.
//!
//! Maps an input subgraph to the kind tag that selects the candidate-op
//! library and the preprocess path.

use strum_macros::Display;

use crate::graph::SubGraph;
use crate::ops::{OpKind, OpParams};

/// Shape kind of an input subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SgKind {
    Empty,
    Conv1x1,
    NormalConv,
    NormalOddConv,
    DilatedConv,
    TransKernelConv,
    GroupConv,
    TransposeGroupConv,
    NormalMatmul,
    BatchMatmul,
    Others,
}

/// Classifies a subgraph. Mirrors the reference rules: single convs are told
/// apart by kernel, dilation and spatial parity; homogeneous groups of convs
/// or matmuls are checked for fusability.
pub fn classify(graph: &SubGraph) -> SgKind {
    let ops = graph.ops();
    match ops.len() {
        0 => SgKind::Empty,
        1 => match &ops[0].params {
            OpParams::Conv(conv) => {
                let in_dims = &graph.tensor_ref(ops[0].inputs[0]).dims;
                let w_dims = &graph.tensor_ref(ops[0].inputs[1]).dims;
                if in_dims.len() != 4 || w_dims.len() != 4 {
                    return SgKind::Others;
                }
                let (r, s) = (w_dims[2], w_dims[3]);
                let (dh, dw) = conv.dilation;
                if dh == 1 && dw == 1 && r == 1 && s == 1 {
                    SgKind::Conv1x1
                } else if dh == 2 || dw == 2 {
                    SgKind::DilatedConv
                } else if in_dims[2] % 2 == 1 && in_dims[3] % 2 == 1 {
                    SgKind::NormalOddConv
                } else if r != s {
                    SgKind::TransKernelConv
                } else {
                    SgKind::NormalConv
                }
            }
            OpParams::Matmul(_) => SgKind::NormalMatmul,
            _ => SgKind::Others,
        },
        _ => classify_group(graph),
    }
}

fn classify_group(graph: &SubGraph) -> SgKind {
    let ops = graph.ops();
    let kind = ops[0].kind();
    if ops.iter().any(|op| op.kind() != kind) {
        return SgKind::Others;
    }

    match kind {
        OpKind::Conv => {
            let first = match &ops[0].params {
                OpParams::Conv(p) => p,
                _ => unreachable!(),
            };
            for op in &ops[1..] {
                match &op.params {
                    OpParams::Conv(p) if p == first => {}
                    _ => return SgKind::Others,
                }
            }
            let in_dims = &graph.tensor_ref(ops[0].inputs[0]).dims;
            if ops[1..]
                .iter()
                .any(|op| &graph.tensor_ref(op.inputs[0]).dims != in_dims)
            {
                return SgKind::Others;
            }

            let w0 = &graph.tensor_ref(ops[0].inputs[1]).dims;
            let group = ops[1..].iter().all(|op| {
                let w = &graph.tensor_ref(op.inputs[1]).dims;
                w[1] == w0[1] && w[2] == w0[2] && w[3] == w0[3] && w[2] == w[3]
            });
            if group {
                return SgKind::GroupConv;
            }
            let trans_group = ops[1..].iter().all(|op| {
                let w = &graph.tensor_ref(op.inputs[1]).dims;
                w[0] == w0[0]
                    && w[1] == w0[1]
                    && ((w[2] == w0[2] && w[3] == w0[3]) || (w[2] == w0[3] && w[3] == w0[2]))
            });
            if trans_group {
                return SgKind::TransposeGroupConv;
            }
            SgKind::Others
        }
        OpKind::Matmul => {
            let first = match &ops[0].params {
                OpParams::Matmul(p) => p,
                _ => unreachable!(),
            };
            for op in &ops[1..] {
                match &op.params {
                    // Mismatched flags are simply not a batch.
                    OpParams::Matmul(p) => {
                        if p.trans_a != first.trans_a || p.trans_b != first.trans_b {
                            return SgKind::Others;
                        }
                    }
                    _ => return SgKind::Others,
                }
            }
            for pair in ops.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                if graph.tensor_ref(a.inputs[0]).dims != graph.tensor_ref(b.inputs[0]).dims
                    || graph.tensor_ref(a.inputs[1]).dims != graph.tensor_ref(b.inputs[1]).dims
                {
                    return SgKind::Others;
                }
            }
            SgKind::BatchMatmul
        }
        _ => SgKind::Others,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Padding;

    #[test]
    fn empty_graph() {
        let mut g = SubGraph::new();
        g.finalize().unwrap();
        assert_eq!(classify(&g), SgKind::Empty);
    }

    #[test]
    fn single_conv_kinds() {
        let build = |in_dims: Vec<usize>, w_dims: Vec<usize>, dilation: (usize, usize)| {
            let mut g = SubGraph::new();
            let i = g.tensor(in_dims);
            let w = g.tensor(w_dims);
            g.conv(i, w, Padding::Same, (1, 1), dilation).unwrap();
            g.finalize().unwrap();
            classify(&g)
        };

        assert_eq!(build(vec![1, 2, 4, 4], vec![4, 2, 1, 1], (1, 1)), SgKind::Conv1x1);
        assert_eq!(build(vec![1, 2, 4, 4], vec![4, 2, 3, 3], (2, 2)), SgKind::DilatedConv);
        assert_eq!(build(vec![1, 2, 5, 5], vec![4, 2, 3, 3], (1, 1)), SgKind::NormalOddConv);
        assert_eq!(build(vec![1, 2, 4, 4], vec![4, 2, 1, 3], (1, 1)), SgKind::TransKernelConv);
        assert_eq!(build(vec![1, 2, 4, 4], vec![4, 2, 3, 3], (1, 1)), SgKind::NormalConv);
    }

    #[test]
    fn homogeneous_conv_groups() {
        let mut g = SubGraph::new();
        for _ in 0..3 {
            let i = g.tensor(vec![1, 2, 8, 8]);
            let w = g.tensor(vec![4, 2, 3, 3]);
            g.conv(i, w, Padding::Same, (1, 1), (1, 1)).unwrap();
        }
        g.finalize().unwrap();
        assert_eq!(classify(&g), SgKind::GroupConv);
    }

    #[test]
    fn swapped_kernel_makes_a_transpose_group() {
        let mut g = SubGraph::new();
        for k in 0..4 {
            let i = g.tensor(vec![2, 8, 8, 8]);
            let w = if k == 3 {
                g.tensor(vec![4, 8, 3, 1])
            } else {
                g.tensor(vec![4, 8, 1, 3])
            };
            g.conv(i, w, Padding::Same, (1, 1), (1, 1)).unwrap();
        }
        g.finalize().unwrap();
        assert_eq!(classify(&g), SgKind::TransposeGroupConv);
    }

    #[test]
    fn shared_lhs_matmuls_are_a_batch() {
        let mut g = SubGraph::new();
        let i = g.tensor(vec![1, 4, 8]);
        for _ in 0..3 {
            let w = g.tensor(vec![1, 8, 8]);
            g.matmul(i, w, false, false).unwrap();
        }
        g.finalize().unwrap();
        assert_eq!(classify(&g), SgKind::BatchMatmul);
    }

    #[test]
    fn mixed_kinds_are_others() {
        let mut g = SubGraph::new();
        let i = g.tensor(vec![1, 2, 4, 4]);
        let w = g.tensor(vec![4, 2, 3, 3]);
        g.conv(i, w, Padding::Same, (1, 1), (1, 1)).unwrap();
        let a = g.tensor(vec![1, 4, 8]);
        let b = g.tensor(vec![1, 8, 8]);
        g.matmul(a, b, false, false).unwrap();
        g.finalize().unwrap();
        assert_eq!(classify(&g), SgKind::Others);
    }
}
