//! Searches over single compute operators: extend/conv rewrites, transposed
//! matmuls and the 1x1-conv-as-matmul path.

use mutgen::{Generator, OpKind, Operator, Options, Padding, SubGraph};
use pretty_assertions::assert_eq;

fn generator() -> Generator {
    Generator::new(Options::default())
}

/// One 3x3 conv over {1,2,4,4}; candidates are a channel extend and the conv
/// itself. The rebuild and the extend-then-conv rewrite are the only
/// acceptable two-op mutants.
#[test]
fn extend_conv_search_finds_both_rewrites() {
    let mut graph = SubGraph::new();
    let input = graph.tensor(vec![1, 2, 4, 4]);
    let weight = graph.tensor(vec![4, 2, 3, 3]);
    let output = graph
        .conv(input, weight, Padding::Fixed(1, 1), (1, 1), (1, 1))
        .unwrap();
    graph.finalize().unwrap();

    let candidates = vec![
        Operator::extend(1, 1),
        Operator::conv(Padding::Fixed(1, 1), (1, 1), (1, 1)),
    ];
    let mut generator = generator();
    let mutants = generator.run(&mut graph, 2, candidates, 0.7);

    assert_eq!(mutants.len(), 2);
    for mutant in &mutants {
        assert_eq!(mutant.outputs().len(), 1);
        assert_eq!(
            mutant.tensor_ref(mutant.outputs()[0]).dims,
            graph.tensor_ref(output).dims
        );
    }
    assert!(mutants
        .iter()
        .any(|m| m.ops().iter().any(|op| op.kind() == OpKind::Extend)));
    assert_ne!(mutants[0].graph_hash(), mutants[1].graph_hash());
}

/// {1,8,4} x {1,4,8} with a transA matmul and a last-two-axes transpose:
/// exactly one rewrite survives, transpose-then-matmul-with-transA.
#[test]
fn transposed_matmul_has_a_single_rewrite() {
    let mut graph = SubGraph::new();
    let lhs = graph.tensor(vec![1, 8, 4]);
    let rhs = graph.tensor(vec![1, 4, 8]);
    graph.matmul(lhs, rhs, false, false).unwrap();
    graph.finalize().unwrap();

    let candidates = vec![Operator::matmul(true, false), Operator::transpose(vec![0, 2, 1])];
    let mut generator = generator();
    let mutants = generator.run(&mut graph, 2, candidates, 0.7);

    assert_eq!(mutants.len(), 1);
    let kinds: Vec<OpKind> = mutants[0].ops().iter().map(|op| op.kind()).collect();
    assert_eq!(kinds, vec![OpKind::Transpose, OpKind::Matmul]);
    match &mutants[0].ops()[1].params {
        mutgen::OpParams::Matmul(p) => {
            assert!(p.trans_a);
            assert!(!p.trans_b);
        }
        other => panic!("expected a matmul, got {other:?}"),
    }
}

/// A 1x1 convolution lowers to reshape -> matmul -> reshape. The rewrite is
/// exact, so it survives even the strict threshold.
#[test]
fn conv1x1_lowers_to_matmul() {
    let mut graph = SubGraph::new();
    let input = graph.tensor(vec![1, 4, 6, 6]);
    let weight = graph.tensor(vec![8, 4, 1, 1]);
    graph
        .conv(input, weight, Padding::Valid, (1, 1), (1, 1))
        .unwrap();
    graph.finalize().unwrap();

    let mut generator = generator();
    let mutants = generator.run(&mut graph, 3, Vec::new(), 0.99);

    assert_eq!(mutants.len(), 1);
    let kinds: Vec<OpKind> = mutants[0].ops().iter().map(|op| op.kind()).collect();
    assert_eq!(
        kinds,
        vec![OpKind::Reshape, OpKind::Reshape, OpKind::Matmul, OpKind::Reshape]
    );
    assert_eq!(
        mutants[0].tensor_ref(mutants[0].outputs()[0]).dims,
        vec![1, 8, 6, 6]
    );
}

/// The batched variant replicates the reshaped weight across the batch.
#[test]
fn conv1x1_with_batches_replicates_the_weight() {
    let mut graph = SubGraph::new();
    let input = graph.tensor(vec![2, 4, 6, 6]);
    let weight = graph.tensor(vec![8, 4, 1, 1]);
    graph
        .conv(input, weight, Padding::Valid, (1, 1), (1, 1))
        .unwrap();
    graph.finalize().unwrap();

    let mut generator = generator();
    let mutants = generator.run(&mut graph, 3, Vec::new(), 0.99);

    assert_eq!(mutants.len(), 1);
    assert!(mutants[0]
        .ops()
        .iter()
        .any(|op| op.kind() == OpKind::Concat));
    assert_eq!(
        mutants[0].tensor_ref(mutants[0].outputs()[0]).dims,
        vec![2, 8, 6, 6]
    );
}
