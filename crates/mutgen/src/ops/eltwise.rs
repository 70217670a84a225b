//! Elementwise binary operators and softmax.

use super::{normalize_points, Fetch, SoftmaxParams};
use crate::tensor::{Shape, Tensor};

pub(crate) fn infer_binary(ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() != 2 || ins[0].dims != ins[1].dims {
        return None;
    }
    Some(ins[0].dims.clone())
}

pub(crate) fn splitting_union(ins: &[&Tensor], out_dims: &Shape) -> Vec<Vec<usize>> {
    (0..out_dims.len())
        .map(|d| {
            let mut pts = ins[0].splitting_points[d].clone();
            pts.extend_from_slice(&ins[1].splitting_points[d]);
            normalize_points(pts, out_dims[d])
        })
        .collect()
}

/// Integer surrogate for softmax: values are shifted by the maximum along the
/// axis. Shift-invariant like the real thing, and exact equality of the
/// surrogate is implied by exact equality of the inputs, which is all the
/// verifier needs.
pub(crate) fn point_softmax(
    params: &SoftmaxParams,
    ins: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let len = ins[0].dims[params.axis];
    let mut max = i32::MIN;
    let mut probe = pos.to_vec();
    for i in 0..len {
        probe[params.axis] = i;
        max = max.max(fetch(0, &probe)?);
    }
    Some(fetch(0, pos)?.wrapping_sub(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, TensorRole};

    #[test]
    fn binary_shapes_must_match() {
        let a = Tensor::new(vec![2, 3], DType::Int32, TensorRole::Input, 1);
        let b = Tensor::new(vec![2, 3], DType::Int32, TensorRole::Input, 2);
        let c = Tensor::new(vec![3, 2], DType::Int32, TensorRole::Input, 3);
        assert_eq!(infer_binary(&[&a, &b]), Some(vec![2, 3]));
        assert_eq!(infer_binary(&[&a, &c]), None);
    }

    #[test]
    fn softmax_shifts_by_axis_max() {
        let t = Tensor::new(vec![1, 3], DType::Int32, TensorRole::Input, 1);
        let p = SoftmaxParams::new(1);
        let vals = [2, 7, 4];
        let mut fetch = |_k: usize, pos: &[usize]| Some(vals[pos[1]]);
        assert_eq!(point_softmax(&p, &[&t], &[0, 0], &mut fetch), Some(-5));
        assert_eq!(point_softmax(&p, &[&t], &[0, 1], &mut fetch), Some(0));
    }
}
