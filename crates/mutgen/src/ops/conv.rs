//! Convolution and pooling reference semantics.
//!
//! Layout is NCHW for activations and FCRS for weights. A convolution whose
//! input channel count is a multiple of the weight channel count is a grouped
//! convolution with `groups = c / wc`; output channels are assigned to groups
//! in contiguous blocks.

use super::{normalize_points, ConvParams, Fetch, PoolParams};
use crate::tensor::{Shape, Tensor};

pub(crate) struct ConvGeometry {
    pub groups: usize,
    pub pad: (usize, usize),
    pub out: Shape,
}

pub(crate) fn geometry(params: &ConvParams, x: &[usize], w: &[usize]) -> Option<ConvGeometry> {
    if x.len() != 4 || w.len() != 4 {
        return None;
    }
    let (n, c, h, wdim) = (x[0], x[1], x[2], x[3]);
    let (f, wc, r, s) = (w[0], w[1], w[2], w[3]);
    if wc == 0 || c % wc != 0 {
        return None;
    }
    let groups = c / wc;
    if groups == 0 || f % groups != 0 {
        return None;
    }
    let (dh, dw) = params.dilation;
    let (sh, sw) = params.stride;
    if sh == 0 || sw == 0 || dh == 0 || dw == 0 {
        return None;
    }
    let (ph, pw) = params.padding.resolve((r, s), (dh, dw));
    let span_h = dh.checked_mul(r.checked_sub(1)?)?.checked_add(1)?;
    let span_w = dw.checked_mul(s.checked_sub(1)?)?.checked_add(1)?;
    let padded_h = h + 2 * ph;
    let padded_w = wdim + 2 * pw;
    if padded_h < span_h || padded_w < span_w {
        return None;
    }
    let oh = (padded_h - span_h) / sh + 1;
    let ow = (padded_w - span_w) / sw + 1;
    Some(ConvGeometry {
        groups,
        pad: (ph, pw),
        out: vec![n, f, oh, ow],
    })
}

pub(crate) fn infer(params: &ConvParams, ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() < 2 || ins.len() > 3 {
        return None;
    }
    let geo = geometry(params, &ins[0].dims, &ins[1].dims)?;
    if let Some(bias) = ins.get(2) {
        if bias.dims != vec![ins[1].dims[0]] {
            return None;
        }
    }
    Some(geo.out)
}

pub(crate) fn point(
    params: &ConvParams,
    ins: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
) -> Option<i32> {
    let x = &ins[0].dims;
    let w = &ins[1].dims;
    let geo = geometry(params, x, w)?;
    let (nn, ff, oh, ow) = (pos[0], pos[1], pos[2], pos[3]);
    let (f, wc, r, s) = (w[0], w[1], w[2], w[3]);
    let (sh, sw) = params.stride;
    let (dh, dw) = params.dilation;
    let (ph, pw) = geo.pad;
    let group = ff / (f / geo.groups);

    let mut acc: i32 = 0;
    for cw in 0..wc {
        let c = group * wc + cw;
        for rr in 0..r {
            for ss in 0..s {
                let ih = (oh * sh + rr * dh) as isize - ph as isize;
                let iw = (ow * sw + ss * dw) as isize - pw as isize;
                if ih < 0 || iw < 0 || ih >= x[2] as isize || iw >= x[3] as isize {
                    // Zero padding contributes nothing.
                    continue;
                }
                let xv = fetch(0, &[nn, c, ih as usize, iw as usize])?;
                let wv = fetch(1, &[ff, cw, rr, ss])?;
                acc = acc.wrapping_add(xv.wrapping_mul(wv));
            }
        }
    }
    if ins.len() == 3 {
        acc = acc.wrapping_add(fetch(2, &[ff])?);
    }
    Some(params.act.apply(acc))
}

pub(crate) fn infer_pool(params: &PoolParams, ins: &[&Tensor]) -> Option<Shape> {
    if ins.len() != 1 {
        return None;
    }
    let x = &ins[0].dims;
    if x.len() != 4 {
        return None;
    }
    let (kh, kw) = params.kernel;
    let (ph, pw) = params.padding;
    let (sh, sw) = params.stride;
    let (dh, dw) = params.dilation;
    if kh == 0 || kw == 0 || sh == 0 || sw == 0 || dh == 0 || dw == 0 {
        return None;
    }
    let span_h = dh * (kh - 1) + 1;
    let span_w = dw * (kw - 1) + 1;
    if x[2] + 2 * ph < span_h || x[3] + 2 * pw < span_w {
        return None;
    }
    let oh = (x[2] + 2 * ph - span_h) / sh + 1;
    let ow = (x[3] + 2 * pw - span_w) / sw + 1;
    Some(vec![x[0], x[1], oh, ow])
}

pub(crate) fn point_pool(
    params: &PoolParams,
    ins: &[&Tensor],
    pos: &[usize],
    fetch: Fetch<'_>,
    is_max: bool,
) -> Option<i32> {
    let x = &ins[0].dims;
    let (kh, kw) = params.kernel;
    let (ph, pw) = params.padding;
    let (sh, sw) = params.stride;
    let (dh, dw) = params.dilation;
    let (nn, cc, oh, ow) = (pos[0], pos[1], pos[2], pos[3]);

    let mut acc: i64 = 0;
    let mut best = i32::MIN;
    let mut seen = false;
    for rr in 0..kh {
        for ss in 0..kw {
            let ih = (oh * sh + rr * dh) as isize - ph as isize;
            let iw = (ow * sw + ss * dw) as isize - pw as isize;
            if ih < 0 || iw < 0 || ih >= x[2] as isize || iw >= x[3] as isize {
                continue;
            }
            let v = fetch(0, &[nn, cc, ih as usize, iw as usize])?;
            seen = true;
            best = best.max(v);
            acc += v as i64;
        }
    }
    if is_max {
        Some(if seen { best } else { 0 })
    } else {
        // Fixed divisor: padded positions count as zeros.
        Some((acc / (kh * kw) as i64) as i32)
    }
}

/// Maps an input spatial discontinuity through a sliding window: every output
/// position whose receptive field can straddle the point is marked. An
/// over-approximation only shrinks the verification boxes.
fn window_points(
    points: &[usize],
    pad: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    out_dim: usize,
) -> Vec<usize> {
    let span = dilation * kernel.saturating_sub(1);
    let mut out = Vec::new();
    for &p in points {
        let hi = (p + pad) / stride;
        let lo = (p + pad).saturating_sub(span) / stride;
        for q in lo..=hi.saturating_add(1) {
            out.push(q);
        }
    }
    normalize_points(out, out_dim)
}

pub(crate) fn splitting(params: &ConvParams, ins: &[&Tensor], out_dims: &Shape) -> Vec<Vec<usize>> {
    let x = ins[0];
    let w = &ins[1].dims;
    let mut out = vec![Vec::new(); 4];
    let Some(geo) = geometry(params, &x.dims, w) else {
        return out;
    };
    out[0] = x.splitting_points[0].clone();
    if geo.groups > 1 {
        let per_group = out_dims[1] / geo.groups;
        out[1] = (1..geo.groups).map(|g| g * per_group).collect();
    }
    let (sh, sw) = params.stride;
    let (dh, dw) = params.dilation;
    out[2] = window_points(&x.splitting_points[2], geo.pad.0, w[2], sh, dh, out_dims[2]);
    out[3] = window_points(&x.splitting_points[3], geo.pad.1, w[3], sw, dw, out_dims[3]);
    out
}

pub(crate) fn splitting_pool(
    params: &PoolParams,
    ins: &[&Tensor],
    out_dims: &Shape,
) -> Vec<Vec<usize>> {
    let x = ins[0];
    let mut out = vec![Vec::new(); 4];
    out[0] = x.splitting_points[0].clone();
    out[1] = x.splitting_points[1].clone();
    out[2] = window_points(
        &x.splitting_points[2],
        params.padding.0,
        params.kernel.0,
        params.stride.0,
        params.dilation.0,
        out_dims[2],
    );
    out[3] = window_points(
        &x.splitting_points[3],
        params.padding.1,
        params.kernel.1,
        params.stride.1,
        params.dilation.1,
        out_dims[3],
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{ActKind, Padding};
    use crate::tensor::{DType, TensorRole};

    fn tensor(dims: Vec<usize>) -> Tensor {
        Tensor::new(dims, DType::Int32, TensorRole::Input, 1)
    }

    fn conv_params(padding: Padding, stride: (usize, usize), dilation: (usize, usize)) -> ConvParams {
        ConvParams::new(padding, stride, dilation, ActKind::None)
    }

    #[test]
    fn same_padding_preserves_spatial_dims() {
        let p = conv_params(Padding::Same, (1, 1), (1, 1));
        let x = tensor(vec![1, 2, 4, 4]);
        let w = tensor(vec![4, 2, 3, 3]);
        assert_eq!(infer(&p, &[&x, &w]), Some(vec![1, 4, 4, 4]));
    }

    #[test]
    fn grouped_channels_must_divide() {
        let p = conv_params(Padding::Same, (1, 1), (1, 1));
        let x = tensor(vec![1, 3, 4, 4]);
        let w = tensor(vec![4, 2, 3, 3]);
        assert_eq!(infer(&p, &[&x, &w]), None);

        let x = tensor(vec![1, 4, 4, 4]);
        let w = tensor(vec![6, 2, 3, 3]);
        assert_eq!(infer(&p, &[&x, &w]), Some(vec![1, 6, 4, 4]));
    }

    #[test]
    fn strided_output_shrinks() {
        let p = conv_params(Padding::Fixed(1, 1), (2, 2), (1, 1));
        let x = tensor(vec![1, 2, 8, 8]);
        let w = tensor(vec![4, 2, 3, 3]);
        assert_eq!(infer(&p, &[&x, &w]), Some(vec![1, 4, 4, 4]));
    }

    #[test]
    fn point_matches_direct_sum() {
        // 1x1 input window, 1x1 kernel: the conv value is x * w.
        let p = conv_params(Padding::Valid, (1, 1), (1, 1));
        let x = tensor(vec![1, 1, 1, 1]);
        let w = tensor(vec![1, 1, 1, 1]);
        let mut fetch = |k: usize, _pos: &[usize]| Some(if k == 0 { 3 } else { 5 });
        let v = point(&p, &[&x, &w], &[0, 0, 0, 0], &mut fetch);
        assert_eq!(v, Some(15));
    }

    #[test]
    fn pool_shapes() {
        let p = PoolParams::new((3, 3), (1, 1), (2, 2), (1, 1));
        let x = tensor(vec![1, 2, 8, 8]);
        assert_eq!(infer_pool(&p, &[&x]), Some(vec![1, 2, 4, 4]));
    }
}
