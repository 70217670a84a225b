//! Transpose with a dimension split/merge schema.
//!
//! Besides plain axis permutations, a transpose may factor one input
//! dimension into a (remaining, piece) pair and distribute the parts over the
//! output dimensions, merging them with other axes. The schema lists, per
//! output dimension, the components that make it up, high-order first.
//!
//! Encoding: with a positive `factor` the extracted piece is the minor factor
//! of the split dimension (`i = rem * F + piece`) and `-1` in the schema
//! names the piece; with a negative `factor` the piece is the major factor
//! (`i = piece * rem_len + rem`), `-1` names the remaining part and the
//! split-dimension index names the piece. Under this encoding each candidate
//! pair (N2H/H2N, N2W/W2N, D2H with factors 2/-2, ...) composes to the
//! identity, which is what the reciprocity search detects.

use strum_macros::Display;

use super::{normalize_points, Fetch};
use crate::hashing::Fnv;
use crate::tensor::{Shape, Tensor};

/// Semantic tag describing which dims a transpose trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TransKind {
    None,
    N2H,
    H2N,
    N2W,
    W2N,
    C2H,
    C2W,
    D2H,
    D2W,
}

/// Position of a transpose within an emitted mutant, set for downstream code
/// generation when the mutant has the transpose-conv-transpose shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TransposePos {
    Pre,
    Mid,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransposeParams {
    /// Input dimension being factored, if any.
    pub split_dim: Option<usize>,
    /// Per output dimension, its components (see module docs).
    pub perm: Vec<Vec<isize>>,
    /// Factor magnitude and orientation; 0 for plain permutations.
    pub factor: isize,
    pub kind: TransKind,
    /// Emission metadata; not part of the structural hash.
    pub pos: TransposePos,
}

impl TransposeParams {
    pub fn permute(perm: Vec<isize>) -> Self {
        Self {
            split_dim: None,
            perm: perm.into_iter().map(|d| vec![d]).collect(),
            factor: 0,
            kind: TransKind::None,
            pos: TransposePos::Mid,
        }
    }

    pub fn split(split_dim: usize, perm: Vec<Vec<isize>>, factor: isize, kind: TransKind) -> Self {
        Self {
            split_dim: Some(split_dim),
            perm,
            factor,
            kind,
            pos: TransposePos::Mid,
        }
    }

    pub(crate) fn write_hash(&self, h: &mut Fnv) {
        h.write_i64(self.split_dim.map(|d| d as i64).unwrap_or(-1));
        h.write_i64(self.factor as i64);
        h.write_usize(self.perm.len());
        for item in &self.perm {
            h.write_usize(item.len());
            for &r in item {
                h.write_i64(r as i64);
            }
        }
        h.write_u64(self.kind as u64);
    }
}

/// Where a resolved component draws its index from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompSrc {
    /// An unsplit input dimension.
    Dim(usize),
    /// The remaining part of the split dimension.
    Remaining,
    /// The extracted piece of the split dimension.
    Piece,
}

#[derive(Debug, Clone, Copy)]
struct Component {
    src: CompSrc,
    len: usize,
}

struct Layout {
    out: Vec<Vec<Component>>,
    piece_len: usize,
    rem_len: usize,
}

impl Layout {
    fn out_dims(&self) -> Shape {
        self.out
            .iter()
            .map(|comps| comps.iter().map(|c| c.len).product())
            .collect()
    }
}

impl TransposeParams {
    fn resolve(&self, in_dims: &[usize]) -> Option<Layout> {
        let rank = in_dims.len();
        let (piece_len, rem_len) = match self.split_dim {
            None => (1, 1),
            Some(d) => {
                let f = self.factor.unsigned_abs();
                if d >= rank || f == 0 || in_dims[d] % f != 0 {
                    return None;
                }
                (f, in_dims[d] / f)
            }
        };

        let mut used = vec![false; rank];
        let mut used_piece = false;
        let mut out = Vec::with_capacity(self.perm.len());
        for item in &self.perm {
            let mut comps = Vec::with_capacity(item.len());
            for &r in item {
                let src = match (r, self.split_dim) {
                    (-1, Some(_)) => {
                        if self.factor > 0 {
                            CompSrc::Piece
                        } else {
                            CompSrc::Remaining
                        }
                    }
                    (r, Some(d)) if r >= 0 && r as usize == d => {
                        if self.factor > 0 {
                            CompSrc::Remaining
                        } else {
                            CompSrc::Piece
                        }
                    }
                    (r, _) if r >= 0 && (r as usize) < rank => CompSrc::Dim(r as usize),
                    _ => return None,
                };
                match src {
                    CompSrc::Dim(d) => {
                        if used[d] {
                            return None;
                        }
                        used[d] = true;
                    }
                    CompSrc::Piece => {
                        if used_piece {
                            return None;
                        }
                        used_piece = true;
                    }
                    CompSrc::Remaining => {
                        let d = self.split_dim.unwrap();
                        if used[d] {
                            return None;
                        }
                        used[d] = true;
                    }
                }
                let len = match src {
                    CompSrc::Dim(d) => in_dims[d],
                    CompSrc::Remaining => rem_len,
                    CompSrc::Piece => piece_len,
                };
                if len == 0 {
                    return None;
                }
                comps.push(Component { src, len });
            }
            if comps.is_empty() {
                return None;
            }
            out.push(comps);
        }
        if !used.iter().all(|&u| u) || (self.split_dim.is_some() && !used_piece) {
            return None;
        }
        Some(Layout {
            out,
            piece_len,
            rem_len,
        })
    }

    pub(crate) fn infer(&self, ins: &[&Tensor]) -> Option<Shape> {
        if ins.len() != 1 {
            return None;
        }
        let layout = self.resolve(&ins[0].dims)?;
        let dims = layout.out_dims();
        (dims.iter().product::<usize>() == ins[0].size()).then_some(dims)
    }

    /// Maps an output position back to the input position it reads.
    fn input_pos(&self, in_dims: &[usize], out_pos: &[usize]) -> Option<Shape> {
        let layout = self.resolve(in_dims)?;
        if out_pos.len() != layout.out.len() {
            return None;
        }

        let mut dim_val = vec![0usize; in_dims.len()];
        let mut rem_val = 0usize;
        let mut piece_val = 0usize;
        for (comps, &p) in layout.out.iter().zip(out_pos.iter()) {
            let mut rest = p;
            // Components are high-order first.
            for (i, comp) in comps.iter().enumerate() {
                let stride: usize = comps[i + 1..].iter().map(|c| c.len).product();
                let val = rest / stride;
                rest %= stride;
                if val >= comp.len {
                    return None;
                }
                match comp.src {
                    CompSrc::Dim(d) => dim_val[d] = val,
                    CompSrc::Remaining => rem_val = val,
                    CompSrc::Piece => piece_val = val,
                }
            }
        }
        if let Some(d) = self.split_dim {
            dim_val[d] = if self.factor > 0 {
                rem_val * layout.piece_len + piece_val
            } else {
                piece_val * layout.rem_len + rem_val
            };
        }
        Some(dim_val)
    }

    pub(crate) fn point(&self, ins: &[&Tensor], pos: &[usize], fetch: Fetch<'_>) -> Option<i32> {
        let in_pos = self.input_pos(&ins[0].dims, pos)?;
        fetch(0, &in_pos)
    }

    /// Remaps splitting points through the schema. Split-dimension points are
    /// over-approximated onto both parts; merged dimensions gain the block
    /// boundaries of their low-order component.
    pub(crate) fn splitting(&self, ins: &[&Tensor], out_dims: &Shape) -> Vec<Vec<usize>> {
        let input = ins[0];
        let Some(layout) = self.resolve(&input.dims) else {
            return vec![Vec::new(); out_dims.len()];
        };

        let src_points = |src: CompSrc| -> Vec<usize> {
            match src {
                CompSrc::Dim(d) => input.splitting_points[d].clone(),
                CompSrc::Remaining | CompSrc::Piece => {
                    let d = self.split_dim.unwrap();
                    let mut pts = Vec::new();
                    for &p in &input.splitting_points[d] {
                        let (rem, piece) = if self.factor > 0 {
                            (p / layout.piece_len, p % layout.piece_len)
                        } else {
                            (p % layout.rem_len, p / layout.rem_len)
                        };
                        match src {
                            CompSrc::Remaining => {
                                pts.push(rem);
                                pts.push(rem + 1);
                            }
                            CompSrc::Piece => {
                                pts.push(piece);
                                pts.push(piece + 1);
                            }
                            CompSrc::Dim(_) => unreachable!(),
                        }
                    }
                    pts
                }
            }
        };

        layout
            .out
            .iter()
            .zip(out_dims.iter())
            .map(|(comps, &dim)| {
                let mut pts = Vec::new();
                let last = comps.last().unwrap();
                if comps.len() == 1 {
                    pts.extend(src_points(last.src));
                } else {
                    // Block boundaries of the low-order component; jumps of the
                    // higher components land on these as well.
                    let mut q = last.len;
                    while q < dim {
                        pts.push(q);
                        q += last.len;
                    }
                    for &p in &src_points(last.src) {
                        let mut base = 0;
                        while base < dim {
                            pts.push(base + p);
                            base += last.len;
                        }
                    }
                }
                normalize_points(pts, dim)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, TensorRole};

    fn tensor(dims: Vec<usize>) -> Tensor {
        Tensor::new(dims, DType::Int32, TensorRole::Input, 1)
    }

    fn n2h() -> TransposeParams {
        TransposeParams::split(0, vec![vec![0], vec![1], vec![-1, 2], vec![3]], 2, TransKind::N2H)
    }

    fn h2n() -> TransposeParams {
        TransposeParams::split(2, vec![vec![0, 2], vec![1], vec![-1], vec![3]], -2, TransKind::H2N)
    }

    #[test]
    fn plain_permutation_shapes() {
        let p = TransposeParams::permute(vec![0, 1, 3, 2]);
        let t = tensor(vec![2, 3, 4, 5]);
        assert_eq!(p.infer(&[&t]), Some(vec![2, 3, 5, 4]));
        assert_eq!(p.input_pos(&[2, 3, 4, 5], &[1, 2, 4, 3]), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn n2h_moves_a_batch_factor_into_rows() {
        let t = tensor(vec![6, 6, 14, 14]);
        assert_eq!(n2h().infer(&[&t]), Some(vec![3, 6, 28, 14]));
        // out (a, c, t*h + hi, w) reads in (a*2 + t, c, hi, w)
        assert_eq!(
            n2h().input_pos(&[6, 6, 14, 14], &[2, 0, 17, 3]),
            Some(vec![5, 0, 3, 3])
        );
    }

    #[test]
    fn h2n_inverts_n2h() {
        let in_dims = vec![6, 6, 14, 14];
        let mid_dims = n2h().infer(&[&tensor(in_dims.clone())]).unwrap();
        let back = h2n().infer(&[&tensor(mid_dims.clone())]).unwrap();
        assert_eq!(back, in_dims);

        // Composing the two position maps is the identity.
        for probe in [[0usize, 0, 0, 0], [5, 3, 13, 7], [2, 1, 9, 11]] {
            let mid = h2n().input_pos(&mid_dims, &probe).unwrap();
            let orig = n2h().input_pos(&in_dims, &mid).unwrap();
            assert_eq!(orig.as_slice(), probe.as_slice());
        }
    }

    #[test]
    fn odd_factor_is_rejected() {
        let t = tensor(vec![5, 6, 14, 14]);
        assert_eq!(n2h().infer(&[&t]), None);
    }

    #[test]
    fn last_two_swap_on_rank3() {
        let p = TransposeParams::permute(vec![0, 2, 1]);
        let t = tensor(vec![1, 8, 4]);
        assert_eq!(p.infer(&[&t]), Some(vec![1, 4, 8]));
    }

    #[test]
    fn merged_dimension_gains_block_boundaries() {
        let mut t = tensor(vec![6, 6, 14, 14]);
        t.init_splitting_points();
        t.splitting_points[2] = vec![5];
        let out_dims = n2h().infer(&[&t]).unwrap();
        let sp = n2h().splitting(&[&t], &out_dims);
        // dim 2 merges [piece(2), h(14)]: boundary at 14 plus 5 and 19.
        assert_eq!(sp[2], vec![5, 14, 19]);
    }
}
