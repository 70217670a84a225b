//! Operator model.
//!
//! Operators are a tagged variant over kinds with per-kind parameter structs.
//! Every variant exposes the same capability surface: shape inference, integer
//! reference computation (point-wise and full-buffer), a structural hash over
//! its parameters, splitting-point inference and cloning. Binding state (the
//! input/output tensor ids) lives next to the parameters so a candidate
//! template is just an operator with empty bindings.

pub(crate) mod conv;
pub(crate) mod eltwise;
pub(crate) mod layout;
pub(crate) mod matmul;
pub(crate) mod transpose;

use derive_new::new;
use strum_macros::Display;

use crate::hashing::Fnv;
use crate::tensor::{Shape, Tensor, TensorId};

pub use transpose::{TransKind, TransposeParams, TransposePos};

/// Fieldless operator kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum OpKind {
    Conv,
    Matmul,
    Pad,
    Slice,
    Activation,
    MaxPool,
    AvgPool,
    Add,
    Mul,
    Transpose,
    Gather,
    Split,
    Concat,
    Extend,
    Reshape,
    Softmax,
}

/// Fused or standalone activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ActKind {
    None,
    Relu,
    Sigmoid,
}

impl ActKind {
    /// Integer surrogate of the activation, applied to reference values.
    pub(crate) fn apply(self, value: i32) -> i32 {
        match self {
            ActKind::None => value,
            ActKind::Relu => value.max(0),
            // Unit step: the closest integer-valued stand-in for a sigmoid.
            ActKind::Sigmoid => (value > 0) as i32,
        }
    }
}

/// Convolution padding specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Padding {
    /// Pad so a stride-1 convolution preserves the spatial dims.
    Same,
    /// No padding.
    Valid,
    /// Explicit (ph, pw).
    Fixed(usize, usize),
}

impl Padding {
    /// Resolves to concrete (ph, pw) for a kernel and dilation.
    pub(crate) fn resolve(self, kernel: (usize, usize), dilation: (usize, usize)) -> (usize, usize) {
        match self {
            Padding::Same => (
                (kernel.0.saturating_sub(1)) * dilation.0 / 2,
                (kernel.1.saturating_sub(1)) * dilation.1 / 2,
            ),
            Padding::Valid => (0, 0),
            Padding::Fixed(ph, pw) => (ph, pw),
        }
    }
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub padding: Padding,
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub act: ActKind,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct MatmulParams {
    pub trans_a: bool,
    pub trans_b: bool,
    pub act: ActKind,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct PadParams {
    pub begin: Vec<usize>,
    pub end: Vec<usize>,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct SliceParams {
    pub begin: Vec<usize>,
    pub end: Vec<usize>,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    pub kernel: (usize, usize),
    pub padding: (usize, usize),
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct SplitParams {
    pub axis: usize,
    /// Relative sizes; the split dim is divided proportionally.
    pub sizes: Vec<usize>,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct ConcatParams {
    pub axis: usize,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct ExtendParams {
    pub axis: usize,
    /// Number of extra copies appended along the axis.
    pub num: usize,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct ReshapeParams {
    pub target: Shape,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct GatherParams {
    pub axis: usize,
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct SoftmaxParams {
    pub axis: usize,
}

/// Parameter payload per operator kind.
#[derive(Debug, Clone, PartialEq)]
pub enum OpParams {
    Conv(ConvParams),
    Matmul(MatmulParams),
    Pad(PadParams),
    Slice(SliceParams),
    Activation(ActKind),
    MaxPool(PoolParams),
    AvgPool(PoolParams),
    Add,
    Mul,
    Transpose(TransposeParams),
    Gather(GatherParams),
    Split(SplitParams),
    Concat(ConcatParams),
    Extend(ExtendParams),
    Reshape(ReshapeParams),
    Softmax(SoftmaxParams),
}

/// How the DFS binds inputs for a template of this kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arity {
    Unary,
    Binary,
    /// One input, `sizes.len()` outputs.
    Split,
    /// Group-collected variadic input.
    Concat,
}

/// Callback used by the reference computation to read an input value.
/// The first argument is the input ordinal, the second the position.
pub(crate) type Fetch<'a> = &'a mut dyn FnMut(usize, &[usize]) -> Option<i32>;

/// An operator: parameters plus (possibly empty) tensor bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub params: OpParams,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl Operator {
    pub fn unbound(params: OpParams) -> Self {
        Self {
            params,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    // Template constructors, mirroring the candidate libraries.

    pub fn conv(padding: Padding, stride: (usize, usize), dilation: (usize, usize)) -> Self {
        Self::unbound(OpParams::Conv(ConvParams::new(
            padding,
            stride,
            dilation,
            ActKind::None,
        )))
    }

    pub fn conv_with(params: ConvParams) -> Self {
        Self::unbound(OpParams::Conv(params))
    }

    pub fn matmul(trans_a: bool, trans_b: bool) -> Self {
        Self::unbound(OpParams::Matmul(MatmulParams::new(
            trans_a,
            trans_b,
            ActKind::None,
        )))
    }

    /// Plain axis permutation.
    pub fn transpose(perm: Vec<isize>) -> Self {
        Self::unbound(OpParams::Transpose(TransposeParams::permute(perm)))
    }

    /// Dimension-splitting transpose with a nested-index schema.
    pub fn transpose_split(
        split_dim: usize,
        schema: Vec<Vec<isize>>,
        factor: isize,
        kind: TransKind,
    ) -> Self {
        Self::unbound(OpParams::Transpose(TransposeParams::split(
            split_dim, schema, factor, kind,
        )))
    }

    pub fn pad(begin: Vec<usize>, end: Vec<usize>) -> Self {
        Self::unbound(OpParams::Pad(PadParams::new(begin, end)))
    }

    pub fn slice(begin: Vec<usize>, end: Vec<usize>) -> Self {
        Self::unbound(OpParams::Slice(SliceParams::new(begin, end)))
    }

    pub fn split(axis: usize, sizes: Vec<usize>) -> Self {
        Self::unbound(OpParams::Split(SplitParams::new(axis, sizes)))
    }

    pub fn concat(axis: usize) -> Self {
        Self::unbound(OpParams::Concat(ConcatParams::new(axis)))
    }

    pub fn extend(axis: usize, num: usize) -> Self {
        Self::unbound(OpParams::Extend(ExtendParams::new(axis, num)))
    }

    pub fn reshape(target: Shape) -> Self {
        Self::unbound(OpParams::Reshape(ReshapeParams::new(target)))
    }

    pub fn kind(&self) -> OpKind {
        match &self.params {
            OpParams::Conv(_) => OpKind::Conv,
            OpParams::Matmul(_) => OpKind::Matmul,
            OpParams::Pad(_) => OpKind::Pad,
            OpParams::Slice(_) => OpKind::Slice,
            OpParams::Activation(_) => OpKind::Activation,
            OpParams::MaxPool(_) => OpKind::MaxPool,
            OpParams::AvgPool(_) => OpKind::AvgPool,
            OpParams::Add => OpKind::Add,
            OpParams::Mul => OpKind::Mul,
            OpParams::Transpose(_) => OpKind::Transpose,
            OpParams::Gather(_) => OpKind::Gather,
            OpParams::Split(_) => OpKind::Split,
            OpParams::Concat(_) => OpKind::Concat,
            OpParams::Extend(_) => OpKind::Extend,
            OpParams::Reshape(_) => OpKind::Reshape,
            OpParams::Softmax(_) => OpKind::Softmax,
        }
    }

    /// Convolutions and matmuls; everything else only moves data around.
    pub fn is_compute_op(&self) -> bool {
        matches!(self.params, OpParams::Conv(_) | OpParams::Matmul(_))
    }

    pub fn is_transpose_op(&self) -> bool {
        matches!(self.params, OpParams::Transpose(_))
    }

    pub(crate) fn arity(&self) -> Arity {
        match &self.params {
            OpParams::Conv(_) | OpParams::Matmul(_) | OpParams::Add | OpParams::Mul => Arity::Binary,
            OpParams::Gather(_) => Arity::Binary,
            OpParams::Split(_) => Arity::Split,
            OpParams::Concat(_) => Arity::Concat,
            _ => Arity::Unary,
        }
    }

    pub(crate) fn num_outputs(&self) -> usize {
        match &self.params {
            OpParams::Split(params) => params.sizes.len(),
            _ => 1,
        }
    }

    /// Structural hash over kind and parameters. Equal hashes imply equal
    /// semantics on identical inputs; the transpose position tag is emission
    /// metadata and is excluded.
    pub fn op_hash(&self) -> u64 {
        let mut h = Fnv::new();
        h.write_u64(self.kind() as u64);
        match &self.params {
            OpParams::Conv(p) => {
                match p.padding {
                    Padding::Same => h.write_u64(1),
                    Padding::Valid => h.write_u64(2),
                    Padding::Fixed(ph, pw) => {
                        h.write_u64(3);
                        h.write_usize(ph);
                        h.write_usize(pw);
                    }
                }
                h.write_usize(p.stride.0);
                h.write_usize(p.stride.1);
                h.write_usize(p.dilation.0);
                h.write_usize(p.dilation.1);
                h.write_u64(p.act as u64);
            }
            OpParams::Matmul(p) => {
                h.write_u64(p.trans_a as u64);
                h.write_u64(p.trans_b as u64);
                h.write_u64(p.act as u64);
            }
            OpParams::Pad(p) => {
                h.write_slice(&p.begin);
                h.write_slice(&p.end);
            }
            OpParams::Slice(p) => {
                h.write_slice(&p.begin);
                h.write_slice(&p.end);
            }
            OpParams::Activation(act) => h.write_u64(*act as u64),
            OpParams::MaxPool(p) | OpParams::AvgPool(p) => {
                h.write_usize(p.kernel.0);
                h.write_usize(p.kernel.1);
                h.write_usize(p.padding.0);
                h.write_usize(p.padding.1);
                h.write_usize(p.stride.0);
                h.write_usize(p.stride.1);
                h.write_usize(p.dilation.0);
                h.write_usize(p.dilation.1);
            }
            OpParams::Add | OpParams::Mul => {}
            OpParams::Transpose(p) => p.write_hash(&mut h),
            OpParams::Gather(p) => h.write_usize(p.axis),
            OpParams::Split(p) => {
                h.write_usize(p.axis);
                h.write_slice(&p.sizes);
            }
            OpParams::Concat(p) => h.write_usize(p.axis),
            OpParams::Extend(p) => {
                h.write_usize(p.axis);
                h.write_usize(p.num);
            }
            OpParams::Reshape(p) => h.write_slice(&p.target),
            OpParams::Softmax(p) => h.write_usize(p.axis),
        }
        h.finish()
    }

    pub(crate) fn is_clear(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
    }

    /// Infers the output shapes from input tensors. A `None` rejects the
    /// binding; inference is a pure function of input shapes and parameters.
    pub fn infer_shapes(&self, ins: &[&Tensor]) -> Option<Vec<Shape>> {
        match &self.params {
            OpParams::Conv(p) => conv::infer(p, ins).map(|s| vec![s]),
            OpParams::Matmul(p) => matmul::infer(p, ins).map(|s| vec![s]),
            OpParams::Pad(p) => layout::infer_pad(p, ins).map(|s| vec![s]),
            OpParams::Slice(p) => layout::infer_slice(p, ins).map(|s| vec![s]),
            OpParams::Activation(_) | OpParams::Softmax(_) => {
                (ins.len() == 1).then(|| vec![ins[0].dims.clone()])
            }
            OpParams::MaxPool(p) | OpParams::AvgPool(p) => conv::infer_pool(p, ins).map(|s| vec![s]),
            OpParams::Add | OpParams::Mul => eltwise::infer_binary(ins).map(|s| vec![s]),
            OpParams::Transpose(p) => p.infer(ins).map(|s| vec![s]),
            OpParams::Gather(p) => layout::infer_gather(p, ins).map(|s| vec![s]),
            OpParams::Split(p) => layout::infer_split(p, ins),
            OpParams::Concat(p) => layout::infer_concat(p, ins).map(|s| vec![s]),
            OpParams::Extend(p) => layout::infer_extend(p, ins).map(|s| vec![s]),
            OpParams::Reshape(p) => layout::infer_reshape(p, ins).map(|s| vec![s]),
        }
    }

    /// Reference value of output `out_slot` at `pos`. Input values are read
    /// through `fetch`, which may recurse into the producing subgraph.
    pub(crate) fn point(
        &self,
        ins: &[&Tensor],
        outs: &[&Tensor],
        out_slot: usize,
        pos: &[usize],
        fetch: Fetch<'_>,
    ) -> Option<i32> {
        match &self.params {
            OpParams::Conv(p) => conv::point(p, ins, pos, fetch),
            OpParams::Matmul(p) => matmul::point(p, ins, pos, fetch),
            OpParams::Pad(p) => layout::point_pad(p, ins, pos, fetch),
            OpParams::Slice(p) => layout::point_slice(p, pos, fetch),
            OpParams::Activation(act) => fetch(0, pos).map(|v| act.apply(v)),
            OpParams::MaxPool(p) => conv::point_pool(p, ins, pos, fetch, true),
            OpParams::AvgPool(p) => conv::point_pool(p, ins, pos, fetch, false),
            OpParams::Add => Some(fetch(0, pos)?.wrapping_add(fetch(1, pos)?)),
            OpParams::Mul => Some(fetch(0, pos)?.wrapping_mul(fetch(1, pos)?)),
            OpParams::Transpose(p) => p.point(ins, pos, fetch),
            OpParams::Gather(p) => layout::point_gather(p, ins, pos, fetch),
            OpParams::Split(p) => layout::point_split(p, ins, outs, out_slot, pos, fetch),
            OpParams::Concat(p) => layout::point_concat(p, ins, pos, fetch),
            OpParams::Extend(p) => layout::point_extend(p, ins, pos, fetch),
            OpParams::Reshape(_) => layout::point_reshape(ins, outs, pos, fetch),
            OpParams::Softmax(p) => eltwise::point_softmax(p, ins, pos, fetch),
        }
    }

    /// Eagerly computes dense buffers for every output, reading input data
    /// directly from the arena. Used when the whole op list is non-compute
    /// (all-transpose) and in the reciprocity search.
    pub(crate) fn compute_full(&self, tensors: &[Tensor]) -> bool {
        let ins: Vec<&Tensor> = self.inputs.iter().map(|&id| &tensors[id]).collect();
        let outs: Vec<&Tensor> = self.outputs.iter().map(|&id| &tensors[id]).collect();
        for (slot, out) in outs.iter().enumerate() {
            let size = out.size();
            let mut buf = Vec::with_capacity(size);
            let mut fetch = |k: usize, p: &[usize]| ins.get(k).and_then(|t| t.value_at(p));
            for offset in 0..size {
                let pos = out.pos_of(offset as u64);
                match self.point(&ins, &outs, slot, &pos, &mut fetch) {
                    Some(v) => buf.push(v),
                    None => return false,
                }
            }
            out.set_full(buf);
        }
        true
    }

    /// Propagates per-dim splitting points from inputs to outputs; returns
    /// one sorted point set per output dimension, per output.
    pub(crate) fn infer_splitting(&self, ins: &[&Tensor], out_dims: &[Shape]) -> Vec<Vec<Vec<usize>>> {
        match &self.params {
            OpParams::Conv(p) => vec![conv::splitting(p, ins, &out_dims[0])],
            OpParams::Matmul(p) => vec![matmul::splitting(p, ins, &out_dims[0])],
            OpParams::Pad(p) => vec![layout::splitting_pad(p, ins, &out_dims[0])],
            OpParams::Slice(p) => vec![layout::splitting_slice(p, ins, &out_dims[0])],
            OpParams::Activation(_) | OpParams::Softmax(_) => {
                vec![ins[0].splitting_points.clone()]
            }
            OpParams::MaxPool(p) | OpParams::AvgPool(p) => {
                vec![conv::splitting_pool(p, ins, &out_dims[0])]
            }
            OpParams::Add | OpParams::Mul => vec![eltwise::splitting_union(ins, &out_dims[0])],
            OpParams::Transpose(p) => vec![p.splitting(ins, &out_dims[0])],
            // Gather routes through data-dependent indices; no useful points.
            OpParams::Gather(_) => vec![vec![Vec::new(); out_dims[0].len()]],
            OpParams::Split(p) => layout::splitting_split(p, ins, out_dims),
            OpParams::Concat(p) => vec![layout::splitting_concat(p, ins, &out_dims[0])],
            OpParams::Extend(p) => vec![layout::splitting_extend(p, ins, &out_dims[0])],
            OpParams::Reshape(_) => vec![layout::splitting_reshape(ins, &out_dims[0])],
        }
    }
}

/// Sorts and deduplicates a point set, keeping interior indices only.
pub(crate) fn normalize_points(mut points: Vec<usize>, dim: usize) -> Vec<usize> {
    points.retain(|&p| p >= 1 && p < dim);
    points.sort_unstable();
    points.dedup();
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, TensorRole};

    fn tensor(dims: Vec<usize>) -> Tensor {
        Tensor::new(dims, DType::Int32, TensorRole::Input, 1)
    }

    #[test]
    fn op_hash_depends_on_parameters() {
        let a = Operator::matmul(false, false);
        let b = Operator::matmul(true, false);
        assert_ne!(a.op_hash(), b.op_hash());
        assert_eq!(a.op_hash(), a.clone().op_hash());
    }

    #[test]
    fn clone_is_unconnected() {
        let mut op = Operator::concat(1);
        op.inputs = vec![0, 1];
        op.outputs = vec![2];
        let mut copy = op.clone();
        copy.clear();
        assert!(copy.is_clear());
        assert_eq!(copy.op_hash(), op.op_hash());
    }

    #[test]
    fn activation_and_softmax_preserve_shape() {
        let t = tensor(vec![2, 3, 4]);
        let op = Operator::unbound(OpParams::Activation(ActKind::Relu));
        assert_eq!(op.infer_shapes(&[&t]), Some(vec![vec![2, 3, 4]]));
        let sm = Operator::unbound(OpParams::Softmax(SoftmaxParams::new(2)));
        assert_eq!(sm.infer_shapes(&[&t]), Some(vec![vec![2, 3, 4]]));
    }
}
