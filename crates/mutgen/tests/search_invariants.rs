//! Post-run invariants, boundary behavior, reciprocity pruning and the
//! mutation cache.

use mutgen::{
    candidate_ops_for, classify, Generator, OpKind, OpParams, Operator, Options, Padding,
    Reciprocity, SubGraph, Tensor, TransposePos,
};

fn normal_conv() -> SubGraph {
    let mut graph = SubGraph::new();
    let input = graph.tensor(vec![2, 4, 6, 6]);
    let weight = graph.tensor(vec![4, 4, 3, 3]);
    graph
        .conv(input, weight, Padding::Fixed(1, 1), (1, 1), (1, 1))
        .unwrap();
    graph.finalize().unwrap();
    graph
}

/// Every operator of every emitted mutant re-infers to the shape it carries.
fn assert_shapes_consistent(mutant: &SubGraph) {
    for op in mutant.ops() {
        let ins: Vec<&Tensor> = op.inputs.iter().map(|&id| mutant.tensor_ref(id)).collect();
        let shapes = op.infer_shapes(&ins).expect("emitted op must infer");
        for (&out, dims) in op.outputs.iter().zip(shapes.iter()) {
            assert_eq!(&mutant.tensor_ref(out).dims, dims);
        }
    }
}

#[test]
fn auto_search_upholds_the_run_invariants() {
    let mut graph = normal_conv();
    let options = Options::default();
    let mut generator = Generator::new(options.clone());
    let mutants = generator.run(&mut graph, 3, Vec::new(), 0.7);

    assert!(!mutants.is_empty());
    assert_eq!(generator.pending_ops(), 0);
    assert_eq!(generator.live_tensors(), graph.inputs().len());

    let mut hashes: Vec<u64> = mutants.iter().map(|m| m.graph_hash()).collect();
    hashes.sort_unstable();
    let before = hashes.len();
    hashes.dedup();
    assert_eq!(hashes.len(), before);

    let candidates = candidate_ops_for(classify(&graph), &graph, &options);
    let reciprocity = Reciprocity::detect(&candidates.ops, &options);
    for mutant in &mutants {
        assert_eq!(mutant.counted_outputs().count(), graph.outputs().len());
        for (mutant_out, &graph_out) in mutant.counted_outputs().zip(graph.outputs()) {
            assert_eq!(
                mutant.tensor_ref(mutant_out).dims,
                graph.tensor_ref(graph_out).dims
            );
        }
        assert_shapes_consistent(mutant);
        assert!(!reciprocity.is_tail_reciprocity(mutant.ops(), mutant));
    }
}

#[test]
fn repeated_single_conv_runs_hit_the_cache() {
    let mut graph = normal_conv();
    let mut generator = Generator::new(Options::default());

    let first = generator.run(&mut graph, 3, Vec::new(), 0.7);
    let second = generator.run(&mut graph, 3, Vec::new(), 0.7);

    let mut first_hashes: Vec<u64> = first.iter().map(|m| m.graph_hash()).collect();
    let mut second_hashes: Vec<u64> = second.iter().map(|m| m.graph_hash()).collect();
    first_hashes.sort_unstable();
    second_hashes.sort_unstable();
    assert_eq!(first_hashes, second_hashes);
}

/// Shape-changing candidates can never be accepted on their own: the outputs
/// would no longer match the input subgraph.
#[test]
fn shape_changing_candidates_yield_nothing() {
    let mut graph = normal_conv();
    let mut generator = Generator::new(Options::default());
    let mutants = generator.run(&mut graph, 3, vec![Operator::split(1, vec![1, 1])], 0.7);
    assert!(mutants.is_empty());
    assert_eq!(generator.pending_ops(), 0);
}

/// The automatic matmul library rewrites a single matmul through every
/// (transA, transB) combination, pairing transposes with the flags.
#[test]
fn matmul_family_covers_all_transpose_flags() {
    let mut graph = SubGraph::new();
    let lhs = graph.tensor(vec![1, 8, 4]);
    let rhs = graph.tensor(vec![1, 4, 8]);
    graph.matmul(lhs, rhs, false, false).unwrap();
    graph.finalize().unwrap();

    let mut generator = Generator::new(Options::default());
    let mutants = generator.run(&mut graph, 4, Vec::new(), 0.7);

    for (trans_a, trans_b) in [(false, false), (true, false), (false, true), (true, true)] {
        assert!(
            mutants.iter().any(|m| m.ops().iter().any(|op| match &op.params {
                OpParams::Matmul(p) => p.trans_a == trans_a && p.trans_b == trans_b,
                _ => false,
            })),
            "missing a rewrite with transA={trans_a} transB={trans_b}"
        );
    }
    for mutant in &mutants {
        assert_eq!(mutant.counted_outputs().count(), 1);
        assert_shapes_consistent(mutant);
    }
}

/// An identity-permutation transpose composes to the identity all by itself;
/// the reciprocity search finds the one-op chain and prunes it thereafter.
#[test]
fn identity_transpose_is_its_own_reciprocity() {
    let identity = Operator::transpose(vec![0, 1, 2, 3]);
    let reciprocity = Reciprocity::detect(&[identity.clone()], &Options::default());

    let expected = vec![identity.op_hash()];
    assert!(reciprocity.chains().iter().any(|c| *c == expected));

    let mut graph = SubGraph::new();
    let input = graph.tensor(vec![2, 3, 4, 5]);
    graph.add_op(identity, vec![input]).unwrap();
    graph.finalize().unwrap();
    assert!(reciprocity.is_tail_reciprocity(graph.ops(), &graph));
}

/// A dilated convolution turns into deinterleave -> dense conv ->
/// interleave; the emitted transposes carry their pre/post position tags.
#[test]
fn dilated_conv_rewrites_carry_position_tags() {
    let mut graph = SubGraph::new();
    let input = graph.tensor(vec![1, 2, 8, 8]);
    let weight = graph.tensor(vec![4, 2, 3, 3]);
    graph
        .conv(input, weight, Padding::Same, (1, 1), (2, 2))
        .unwrap();
    graph.finalize().unwrap();

    let mut generator = Generator::new(Options::default());
    let mutants = generator.run(&mut graph, 3, Vec::new(), 0.7);
    assert!(!mutants.is_empty());

    let sandwich = mutants
        .iter()
        .find(|m| {
            m.ops().len() == 3
                && m.ops()[0].kind() == OpKind::Transpose
                && m.ops()[1].kind() == OpKind::Conv
                && m.ops()[2].kind() == OpKind::Transpose
        })
        .expect("a transpose-conv-transpose rewrite");
    let pos_of = |op: &Operator| match &op.params {
        OpParams::Transpose(t) => t.pos,
        _ => unreachable!(),
    };
    assert_eq!(pos_of(&sandwich.ops()[0]), TransposePos::Pre);
    assert_eq!(pos_of(&sandwich.ops()[2]), TransposePos::Post);
}

/// Odd-spatial convolutions go through pad -> conv -> slice; with the box
/// verifier enabled the rewrite is exact over every box.
#[test]
fn odd_conv_pad_slice_passes_box_verification() {
    let mut graph = SubGraph::new();
    let input = graph.tensor(vec![1, 2, 5, 5]);
    let weight = graph.tensor(vec![4, 2, 3, 3]);
    graph
        .conv(input, weight, Padding::Fixed(1, 1), (1, 1), (1, 1))
        .unwrap();
    graph.finalize().unwrap();

    let options = Options {
        box_verification: true,
        ..Options::default()
    };
    let mut generator = Generator::new(options);
    let mutants = generator.run(&mut graph, 3, Vec::new(), 0.7);

    assert_eq!(mutants.len(), 1);
    let kinds: Vec<OpKind> = mutants[0].ops().iter().map(|op| op.kind()).collect();
    assert_eq!(kinds, vec![OpKind::Pad, OpKind::Conv, OpKind::Slice]);
    for (mutant_out, &graph_out) in mutants[0].counted_outputs().zip(graph.outputs()) {
        assert_eq!(
            mutants[0].tensor_ref(mutant_out).dims,
            graph.tensor_ref(graph_out).dims
        );
    }
}
