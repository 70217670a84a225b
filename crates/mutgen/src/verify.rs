//! Equivalence verifiers.
//!
//! The sampling verifier probes a handful of fixed positions per output; the
//! splitting-point box verifier derives a grid of axis-aligned boxes from the
//! merged splitting points of both subgraphs, probes each box at its corner
//! and one neighbor per free axis, and weights the verdict by box volume.

use rand::rngs::StdRng;
use rand::Rng;

use crate::graph::SubGraph;
use crate::tensor::TensorId;

/// Samples taken per output of the input subgraph.
pub const SAMPLES_PER_OUTPUT: usize = 8;

/// Fixed sampling scheme: per dim, `((rand % 2) + 1) * dim / 3`.
pub(crate) fn sample_positions(rng: &mut StdRng, dims: &[usize]) -> Vec<Vec<usize>> {
    (0..SAMPLES_PER_OUTPUT)
        .map(|_| {
            dims.iter()
                .map(|&d| ((rng.gen_range(0..2usize) + 1) * d) / 3)
                .collect()
        })
        .collect()
}

/// Point-sampling check of one mutant output against stored reference values.
pub(crate) fn sampled_equal(
    mutant: &SubGraph,
    mutant_out: TensorId,
    expected_dims: &[usize],
    samples: &[(Vec<usize>, i32)],
    threshold: f32,
) -> bool {
    if mutant.tensor_ref(mutant_out).dims != expected_dims {
        return false;
    }
    let mut equal = 0usize;
    for (pos, reference) in samples {
        match mutant.value_at(mutant_out, pos) {
            Some(v) if v == *reference => equal += 1,
            Some(_) => {}
            None => return false,
        }
    }
    equal as f32 / samples.len() as f32 > threshold
}

/// Dense comparison used when the candidate was fully computed (all-transpose
/// op lists in the reciprocity search). The reference side is back-computed
/// on demand so it always reflects the current input data.
pub(crate) fn full_equal(
    mutant: &SubGraph,
    mutant_out: TensorId,
    in_graph: &SubGraph,
    in_out: TensorId,
    threshold: f32,
) -> bool {
    let tensor = mutant.tensor_ref(mutant_out);
    if tensor.dims != in_graph.tensor_ref(in_out).dims {
        return false;
    }
    let total = tensor.size();
    if total == 0 {
        return false;
    }
    // Acceptance needs equal/total > threshold, so the comparison can stop
    // as soon as the mismatches alone rule that out.
    let max_unequal = total - (threshold * total as f32) as usize;
    let mut equal = 0usize;
    let mut unequal = 0usize;
    for offset in 0..total {
        let pos = tensor.pos_of(offset as u64);
        let (Some(mv), Some(iv)) = (
            mutant.value_at(mutant_out, &pos),
            in_graph.value_at(in_out, &pos),
        ) else {
            return false;
        };
        if mv == iv {
            equal += 1;
        } else {
            unequal += 1;
            if unequal >= max_unequal {
                return false;
            }
        }
    }
    equal as f32 / total as f32 > threshold
}

/// Weighted accuracy of the splitting-point box verifier, or `None` when the
/// candidate cannot be evaluated at a probe.
pub(crate) fn box_accuracy(
    mutant: &SubGraph,
    mutant_out: TensorId,
    in_graph: &SubGraph,
    in_out: TensorId,
) -> Option<f32> {
    let dims = &in_graph.tensor_ref(in_out).dims;
    if &mutant.tensor_ref(mutant_out).dims != dims {
        return Some(0.0);
    }
    let rank = dims.len();

    // Merge both splitting-point sets, with 0 as every dim's first boundary.
    let mut merged: Vec<Vec<usize>> = Vec::with_capacity(rank);
    for d in 0..rank {
        let mut points = vec![0usize];
        points.extend_from_slice(&in_graph.tensor_ref(in_out).splitting_points[d]);
        points.extend_from_slice(&mutant.tensor_ref(mutant_out).splitting_points[d]);
        points.sort_unstable();
        points.dedup();
        points.retain(|&p| p < dims[d]);
        merged.push(points);
    }

    let mut box_elems: Vec<usize> = Vec::new();
    let mut probes: Vec<(Vec<usize>, usize)> = Vec::new();
    enumerate_boxes(
        &merged,
        dims,
        0,
        &mut Vec::new(),
        &mut Vec::new(),
        &mut box_elems,
        &mut probes,
    );

    let mut box_errors = vec![0usize; box_elems.len()];
    for (pos, box_id) in &probes {
        let mv = mutant.value_at(mutant_out, pos)?;
        let iv = in_graph.value_at(in_out, pos)?;
        if mv != iv {
            box_errors[*box_id] += 1;
        }
    }

    let total: usize = dims.iter().product();
    let equal: usize = box_elems
        .iter()
        .zip(box_errors.iter())
        .filter(|(_, &errors)| errors == 0)
        .map(|(&elems, _)| elems)
        .sum();
    Some(equal as f32 / total as f32)
}

fn enumerate_boxes(
    merged: &[Vec<usize>],
    dims: &[usize],
    depth: usize,
    index: &mut Vec<usize>,
    pos: &mut Vec<usize>,
    box_elems: &mut Vec<usize>,
    probes: &mut Vec<(Vec<usize>, usize)>,
) {
    if depth == merged.len() {
        let box_id = box_elems.len();
        let mut elems = 1usize;
        for d in 0..merged.len() {
            let cur = merged[d][index[d]];
            let next = merged[d]
                .get(index[d] + 1)
                .copied()
                .unwrap_or(dims[d]);
            elems *= next - cur;
        }
        box_elems.push(elems);
        probes.push((pos.clone(), box_id));
        // One extra probe along every axis where the box has room.
        for d in 0..merged.len() {
            let has_room = match merged[d].get(index[d] + 1) {
                Some(&next) => merged[d][index[d]] + 1 < next,
                None => pos[d] + 1 < dims[d],
            };
            if has_room {
                pos[d] += 1;
                probes.push((pos.clone(), box_id));
                pos[d] -= 1;
            }
        }
        return;
    }
    for i in 0..merged[depth].len() {
        index.push(i);
        pos.push(merged[depth][i]);
        enumerate_boxes(merged, dims, depth + 1, index, pos, box_elems, probes);
        pos.pop();
        index.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn positions_use_the_two_interior_anchors() {
        let mut rng = StdRng::seed_from_u64(11);
        let positions = sample_positions(&mut rng, &[9, 6]);
        assert_eq!(positions.len(), SAMPLES_PER_OUTPUT);
        for pos in positions {
            assert!(pos[0] == 3 || pos[0] == 6);
            assert!(pos[1] == 2 || pos[1] == 4);
        }
    }

    #[test]
    fn identical_graphs_pass_full_comparison() {
        let mut g = SubGraph::new();
        let i = g.tensor(vec![2, 3]);
        let o = g.identity(i).unwrap();
        g.finalize().unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        g.tensor_ref(i).fill_random(&mut rng);

        assert!(full_equal(&g, o, &g, o, 0.99));
    }

    #[test]
    fn box_grid_covers_every_element() {
        let mut g = SubGraph::new();
        let i = g.tensor(vec![4, 6]);
        let o = g.identity(i).unwrap();
        g.finalize().unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        g.tensor_ref(i).fill_random(&mut rng);

        let accuracy = box_accuracy(&g, o, &g, o).unwrap();
        assert!((accuracy - 1.0).abs() < f32::EPSILON);
    }
}
