//! Data-movement operators: pad, slice, concat, split, extend, reshape,
//! gather.

use super::{
    normalize_points, ConcatParams, ExtendParams, Fetch, GatherParams, PadParams, ReshapeParams,
    SliceParams, SplitParams,
};
use crate::tensor::{Shape, Tensor};

pub(crate) fn infer_pad(params: &PadParams, ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() != 1 {
        return None;
    }
    let dims = &ins[0].dims;
    if params.begin.len() != dims.len() || params.end.len() != dims.len() {
        return None;
    }
    Some(
        dims.iter()
            .zip(params.begin.iter().zip(params.end.iter()))
            .map(|(&d, (&b, &e))| d + b + e)
            .collect(),
    )
}

pub(crate) fn point_pad(
    params: &PadParams,
    ins: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let dims = &ins[0].dims;
    let mut in_pos = Vec::with_capacity(pos.len());
    for d in 0..pos.len() {
        let p = pos[d] as isize - params.begin[d] as isize;
        if p < 0 || p >= dims[d] as isize {
            return Some(0);
        }
        in_pos.push(p as usize);
    }
    fetch(0, &in_pos)
}

pub(crate) fn splitting_pad(params: &PadParams, ins: &[&Tensor], out_dims: &Shape) -> Vec<Vec<usize>> {
    let input = ins[0];
    (0..out_dims.len())
        .map(|d| {
            let mut pts: Vec<usize> = input.splitting_points[d]
                .iter()
                .map(|&p| p + params.begin[d])
                .collect();
            // Boundaries where the zero padding meets the payload.
            if params.begin[d] > 0 {
                pts.push(params.begin[d]);
            }
            if params.end[d] > 0 {
                pts.push(params.begin[d] + input.dims[d]);
            }
            normalize_points(pts, out_dims[d])
        })
        .collect()
}

pub(crate) fn infer_slice(params: &SliceParams, ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() != 1 {
        return None;
    }
    let dims = &ins[0].dims;
    if params.begin.len() != dims.len() || params.end.len() != dims.len() {
        return None;
    }
    let mut out = Vec::with_capacity(dims.len());
    for d in 0..dims.len() {
        let trimmed = dims[d].checked_sub(params.begin[d] + params.end[d])?;
        if trimmed == 0 {
            return None;
        }
        out.push(trimmed);
    }
    Some(out)
}

pub(crate) fn point_slice(params: &SliceParams, pos: &[usize], fetch: Fetch<'_>) -> Option<i32> {
    let in_pos: Vec<usize> = pos
        .iter()
        .zip(params.begin.iter())
        .map(|(&p, &b)| p + b)
        .collect();
    fetch(0, &in_pos)
}

pub(crate) fn splitting_slice(
    params: &SliceParams,
    ins: &[&Tensor],
    out_dims: &Shape,
) -> Vec<Vec<usize>> {
    let input = ins[0];
    (0..out_dims.len())
        .map(|d| {
            let pts = input.splitting_points[d]
                .iter()
                .filter_map(|&p| p.checked_sub(params.begin[d]))
                .collect();
            normalize_points(pts, out_dims[d])
        })
        .collect()
}

pub(crate) fn infer_concat(params: &ConcatParams, ins: &[&Tensor]) -> Option<Shape> {
    let first = ins.first()?;
    let rank = first.dims.len();
    if params.axis >= rank {
        return None;
    }
    let mut out = first.dims.clone();
    for t in &ins[1..] {
        if t.dims.len() != rank {
            return None;
        }
        for d in 0..rank {
            if d == params.axis {
                out[d] += t.dims[d];
            } else if t.dims[d] != out[d] {
                return None;
            }
        }
    }
    Some(out)
}

pub(crate) fn point_concat(
    params: &ConcatParams,
    ins: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let mut p = pos[params.axis];
    for (k, t) in ins.iter().enumerate() {
        let len = t.dims[params.axis];
        if p < len {
            let mut in_pos = pos.to_vec();
            in_pos[params.axis] = p;
            return fetch(k, &in_pos);
        }
        p -= len;
    }
    None
}

pub(crate) fn splitting_concat(
    params: &ConcatParams,
    ins: &[&Tensor],
    out_dims: &Shape,
) -> Vec<Vec<usize>> {
    (0..out_dims.len())
        .map(|d| {
            let mut pts = Vec::new();
            if d == params.axis {
                let mut offset = 0;
                for t in ins {
                    if offset > 0 {
                        pts.push(offset);
                    }
                    pts.extend(t.splitting_points[d].iter().map(|&p| p + offset));
                    offset += t.dims[d];
                }
            } else {
                for t in ins {
                    pts.extend_from_slice(&t.splitting_points[d]);
                }
            }
            normalize_points(pts, out_dims[d])
        })
        .collect()
}

/// Relative split sizes resolve against the axis length: each output gets
/// `dim * size / sum(sizes)`.
pub(crate) fn split_widths(params: &SplitParams, axis_len: usize) -> Option<Vec<usize>> {
    let total: usize = params.sizes.iter().sum();
    if total == 0 || axis_len % total != 0 || params.sizes.iter().any(|&s| s == 0) {
        return None;
    }
    let unit = axis_len / total;
    Some(params.sizes.iter().map(|&s| s * unit).collect())
}

pub(crate) fn infer_split(params: &SplitParams, ins: &[&Tensor]) -> Option<Vec<Shape>> {
    if ins.len() != 1 {
        return None;
    }
    let dims = &ins[0].dims;
    if params.axis >= dims.len() {
        return None;
    }
    let widths = split_widths(params, dims[params.axis])?;
    Some(
        widths
            .into_iter()
            .map(|w| {
                let mut out = dims.clone();
                out[params.axis] = w;
                out
            })
            .collect(),
    )
}

pub(crate) fn point_split(
    params: &SplitParams,
    ins: &[&Tensor],
    _outs: &[&Tensor],
    out_slot: usize,
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let widths = split_widths(params, ins[0].dims[params.axis])?;
    let offset: usize = widths[..out_slot].iter().sum();
    let mut in_pos = pos.to_vec();
    in_pos[params.axis] += offset;
    fetch(0, &in_pos)
}

pub(crate) fn splitting_split(
    params: &SplitParams,
    ins: &[&Tensor],
    out_dims: &[Shape],
) -> Vec<Vec<Vec<usize>>> {
    let input = ins[0];
    let widths = split_widths(params, input.dims[params.axis]).unwrap_or_default();
    let mut offset = 0usize;
    out_dims
        .iter()
        .enumerate()
        .map(|(slot, dims)| {
            let width = widths.get(slot).copied().unwrap_or(0);
            let sp = (0..dims.len())
                .map(|d| {
                    if d == params.axis {
                        let pts = input.splitting_points[d]
                            .iter()
                            .filter(|&&p| p > offset && p < offset + width)
                            .map(|&p| p - offset)
                            .collect();
                        normalize_points(pts, dims[d])
                    } else {
                        input.splitting_points[d].clone()
                    }
                })
                .collect();
            offset += width;
            sp
        })
        .collect()
}

pub(crate) fn infer_extend(params: &ExtendParams, ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() != 1 {
        return None;
    }
    let dims = &ins[0].dims;
    if params.axis >= dims.len() || params.num == 0 {
        return None;
    }
    let mut out = dims.clone();
    out[params.axis] *= params.num + 1;
    Some(out)
}

pub(crate) fn point_extend(
    params: &ExtendParams,
    ins: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let mut in_pos = pos.to_vec();
    in_pos[params.axis] %= ins[0].dims[params.axis];
    fetch(0, &in_pos)
}

pub(crate) fn splitting_extend(
    params: &ExtendParams,
    ins: &[&Tensor],
    out_dims: &Shape,
) -> Vec<Vec<usize>> {
    let input = ins[0];
    (0..out_dims.len())
        .map(|d| {
            if d == params.axis {
                let len = input.dims[d];
                let mut pts = Vec::new();
                for copy in 0..=params.num {
                    if copy > 0 {
                        pts.push(copy * len);
                    }
                    pts.extend(input.splitting_points[d].iter().map(|&p| p + copy * len));
                }
                normalize_points(pts, out_dims[d])
            } else {
                input.splitting_points[d].clone()
            }
        })
        .collect()
}

pub(crate) fn infer_reshape(params: &ReshapeParams, ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() != 1 || params.target.is_empty() {
        return None;
    }
    (params.target.iter().product::<usize>() == ins[0].size()).then(|| params.target.clone())
}

pub(crate) fn point_reshape(
    ins: &[&Tensor],
    outs: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let offset = outs[0].offset_of(pos)?;
    let in_pos = ins[0].pos_of(offset);
    fetch(0, &in_pos)
}

/// Identical shapes carry their points over; a genuine reshape scrambles the
/// axes and the points are dropped.
pub(crate) fn splitting_reshape(ins: &[&Tensor], out_dims: &Shape) -> Vec<Vec<usize>> {
    if ins[0].dims == *out_dims {
        ins[0].splitting_points.clone()
    } else {
        vec![Vec::new(); out_dims.len()]
    }
}

pub(crate) fn infer_gather(params: &GatherParams, ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() != 2 {
        return None;
    }
    let data = &ins[0].dims;
    let indices = &ins[1].dims;
    if params.axis >= data.len() || indices.len() != 1 || indices[0] == 0 {
        return None;
    }
    let mut out = data.clone();
    out[params.axis] = indices[0];
    Some(out)
}

pub(crate) fn point_gather(
    params: &GatherParams,
    ins: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let idx = fetch(1, &[pos[params.axis]])?;
    if idx < 0 || idx as usize >= ins[0].dims[params.axis] {
        return None;
    }
    let mut in_pos = pos.to_vec();
    in_pos[params.axis] = idx as usize;
    fetch(0, &in_pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Operator;
    use crate::tensor::{DType, TensorRole};

    fn tensor(dims: Vec<usize>) -> Tensor {
        Tensor::new(dims, DType::Int32, TensorRole::Input, 1)
    }

    #[test]
    fn pad_then_slice_round_trips_shape() {
        let t = tensor(vec![1, 2, 5, 5]);
        let pad = Operator::pad(vec![0, 0, 0, 0], vec![0, 0, 1, 1]);
        let padded = pad.infer_shapes(&[&t]).unwrap();
        assert_eq!(padded[0], vec![1, 2, 6, 6]);

        let padded_t = tensor(padded[0].clone());
        let slice = Operator::slice(vec![0, 0, 0, 0], vec![0, 0, 1, 1]);
        assert_eq!(slice.infer_shapes(&[&padded_t]).unwrap()[0], vec![1, 2, 5, 5]);
    }

    #[test]
    fn split_sizes_are_ratios() {
        let t = tensor(vec![2, 6, 2, 2]);
        let op = Operator::split(1, vec![1, 2]);
        let shapes = op.infer_shapes(&[&t]).unwrap();
        assert_eq!(shapes[0], vec![2, 2, 2, 2]);
        assert_eq!(shapes[1], vec![2, 4, 2, 2]);

        let odd = tensor(vec![2, 5, 2, 2]);
        assert_eq!(op.infer_shapes(&[&odd]), None);
    }

    #[test]
    fn concat_requires_matching_off_axis_dims() {
        let a = tensor(vec![2, 2, 2, 2]);
        let b = tensor(vec![2, 3, 2, 2]);
        let op = Operator::concat(1);
        assert_eq!(op.infer_shapes(&[&a, &b]).unwrap()[0], vec![2, 5, 2, 2]);

        let c = tensor(vec![1, 3, 2, 2]);
        assert_eq!(op.infer_shapes(&[&a, &c]), None);
    }

    #[test]
    fn extend_appends_copies() {
        let t = tensor(vec![1, 2, 4, 4]);
        let op = Operator::extend(1, 1);
        assert_eq!(op.infer_shapes(&[&t]).unwrap()[0], vec![1, 4, 4, 4]);

        let mut fetch = |_k: usize, pos: &[usize]| Some(pos[1] as i32);
        let p = match &op.params {
            crate::ops::OpParams::Extend(p) => p,
            _ => unreachable!(),
        };
        // The copy reads the original channel.
        assert_eq!(point_extend(p, &[&t], &[0, 3, 1, 1], &mut fetch), Some(1));
    }

    #[test]
    fn pad_marks_payload_boundaries() {
        let t = tensor(vec![1, 1, 4, 4]);
        let p = PadParams::new(vec![0, 0, 1, 0], vec![0, 0, 1, 1]);
        let out_dims = vec![1, 1, 6, 5];
        let sp = splitting_pad(&p, &[&t], &out_dims);
        assert_eq!(sp[2], vec![1, 5]);
        assert_eq!(sp[3], vec![4]);
    }
}
