//! Batched matrix multiplication reference semantics.
//!
//! Operands are rank-3: `{b, m, k} x {b, k, n} -> {b, m, n}`, with the
//! transpose flags swapping the trailing two dims of the respective operand.

use super::{Fetch, MatmulParams};
use crate::tensor::{Shape, Tensor};

struct MatmulGeometry {
    b: usize,
    m: usize,
    k: usize,
    n: usize,
}

fn geometry(params: &MatmulParams, a: &[usize], b: &[usize]) -> Option<MatmulGeometry> {
    if a.len() != 3 || b.len() != 3 || a[0] != b[0] {
        return None;
    }
    let (ka, m) = if params.trans_a {
        (a[1], a[2])
    } else {
        (a[2], a[1])
    };
    let (n, kb) = if params.trans_b {
        (b[1], b[2])
    } else {
        (b[2], b[1])
    };
    if ka != kb || ka == 0 {
        return None;
    }
    Some(MatmulGeometry {
        b: a[0],
        m,
        k: ka,
        n,
    })
}

pub(crate) fn infer(params: &MatmulParams, ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() < 2 || ins.len() > 3 {
        return None;
    }
    let geo = geometry(params, &ins[0].dims, &ins[1].dims)?;
    if let Some(bias) = ins.get(2) {
        if bias.dims != vec![geo.n] {
            return None;
        }
    }
    Some(vec![geo.b, geo.m, geo.n])
}

pub(crate) fn point(
    params: &MatmulParams,
    ins: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let geo = geometry(params, &ins[0].dims, &ins[1].dims)?;
    let (bb, i, j) = (pos[0], pos[1], pos[2]);
    let mut acc: i32 = 0;
    for kk in 0..geo.k {
        let a_pos = if params.trans_a {
            [bb, kk, i]
        } else {
            [bb, i, kk]
        };
        let b_pos = if params.trans_b {
            [bb, j, kk]
        } else {
            [bb, kk, j]
        };
        let av = fetch(0, &a_pos)?;
        let bv = fetch(1, &b_pos)?;
        acc = acc.wrapping_add(av.wrapping_mul(bv));
    }
    if ins.len() == 3 {
        acc = acc.wrapping_add(fetch(2, &[j])?);
    }
    Some(params.act.apply(acc))
}

/// The contraction axis is fully reduced; batch, row and column
/// discontinuities carry straight through from the matching operand.
pub(crate) fn splitting(params: &MatmulParams, ins: &[&Tensor], out_dims: &Shape) -> Vec<Vec<usize>> {
    let mut out = vec![Vec::new(); out_dims.len()];
    let a = ins[0];
    let b = ins[1];
    let mut batch: Vec<usize> = a.splitting_points[0].clone();
    batch.extend_from_slice(&b.splitting_points[0]);
    out[0] = super::normalize_points(batch, out_dims[0]);
    let m_axis = if params.trans_a { 2 } else { 1 };
    let n_axis = if params.trans_b { 1 } else { 2 };
    out[1] = a.splitting_points[m_axis].clone();
    out[2] = b.splitting_points[n_axis].clone();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ActKind;
    use crate::tensor::{DType, TensorRole};

    fn tensor(dims: Vec<usize>) -> Tensor {
        Tensor::new(dims, DType::Int32, TensorRole::Input, 1)
    }

    #[test]
    fn shapes_follow_transpose_flags() {
        let a = tensor(vec![1, 8, 4]);
        let b = tensor(vec![1, 4, 8]);
        let plain = MatmulParams::new(false, false, ActKind::None);
        assert_eq!(infer(&plain, &[&a, &b]), Some(vec![1, 8, 8]));

        // transA reads the lhs as {b, k, m}: k = 8 does not match.
        let ta = MatmulParams::new(true, false, ActKind::None);
        assert_eq!(infer(&ta, &[&a, &b]), None);

        let at = tensor(vec![1, 4, 8]);
        assert_eq!(infer(&ta, &[&at, &b]), Some(vec![1, 8, 8]));
    }

    #[test]
    fn point_is_a_dot_product() {
        let a = tensor(vec![1, 1, 3]);
        let b = tensor(vec![1, 3, 1]);
        let p = MatmulParams::new(false, false, ActKind::None);
        // a = [1, 2, 3], b = [4, 5, 6]
        let mut fetch = |k: usize, pos: &[usize]| {
            Some(match (k, pos[1], pos[2]) {
                (0, _, j) => [1, 2, 3][j],
                (1, i, _) => [4, 5, 6][i],
                _ => unreachable!(),
            })
        };
        assert_eq!(point(&p, &[&a, &b], &[0, 0, 0], &mut fetch), Some(32));
    }
}
