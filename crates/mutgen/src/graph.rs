//! Subgraph: a tensor arena plus an ordered operator list.
//!
//! Tensors are owned by the graph and referenced by index; operator edges are
//! index pairs, so there is no pointer-linked ownership to manage. The search
//! frame reuses one `SubGraph` as its tensor pool and re-links it with
//! [`SubGraph::reset_ops`] at every node.

use thiserror::Error;

use crate::hashing::{combine_unordered, Fnv};
use crate::ops::{OpKind, Operator, Padding};
use crate::tensor::{
    input_tensor_hash, output_tensor_hash, DType, Shape, Tensor, TensorId, TensorRole,
};

/// Rejection reasons when (re)linking an operator list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("tensor {0} has more than one producer")]
    DuplicateProducer(TensorId),
    #[error("operator references tensor {0} outside the live pool")]
    DanglingTensor(TensorId),
    #[error("operator list contains a cycle")]
    Cyclic,
    #[error("shape inference failed for {0} operator")]
    ShapeMismatch(OpKind),
}

/// A connected, acyclic set of operators over tensors with distinguished
/// inputs and outputs.
#[derive(Debug, Clone, Default)]
pub struct SubGraph {
    tensors: Vec<Tensor>,
    ops: Vec<Operator>,
    producer: Vec<Option<usize>>,
    consumer_count: Vec<usize>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    topo: Vec<usize>,
    hash: u64,
    num_valid: usize,
}

impl SubGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- construction ----------------------------------------------------

    /// Adds an input-role tensor and returns its id.
    pub fn tensor(&mut self, dims: impl Into<Shape>) -> TensorId {
        self.tensor_with_role(dims, TensorRole::Input)
    }

    pub fn tensor_with_role(&mut self, dims: impl Into<Shape>, role: TensorRole) -> TensorId {
        let dims = dims.into();
        let id = self.tensors.len();
        let hash = input_tensor_hash(&dims, DType::Int32, role, id);
        self.tensors.push(Tensor::new(dims, DType::Int32, role, hash));
        id
    }

    /// Binds an operator to existing tensors, allocating its outputs.
    pub fn add_op(
        &mut self,
        mut op: Operator,
        inputs: Vec<TensorId>,
    ) -> Result<Vec<TensorId>, GraphError> {
        for &id in &inputs {
            if id >= self.tensors.len() {
                return Err(GraphError::DanglingTensor(id));
            }
        }
        let ins: Vec<&Tensor> = inputs.iter().map(|&id| &self.tensors[id]).collect();
        let shapes = op
            .infer_shapes(&ins)
            .ok_or_else(|| GraphError::ShapeMismatch(op.kind()))?;
        let input_hashes: Vec<u64> = ins.iter().map(|t| t.hash).collect();
        let op_hash = op.op_hash();

        let mut outputs = Vec::with_capacity(shapes.len());
        for (slot, dims) in shapes.into_iter().enumerate() {
            let hash = output_tensor_hash(op_hash, &input_hashes, slot);
            let id = self.tensors.len();
            self.tensors
                .push(Tensor::new(dims, DType::Int32, TensorRole::Intermediate, hash));
            outputs.push(id);
        }
        op.inputs = inputs;
        op.outputs = outputs.clone();
        self.ops.push(op);
        Ok(outputs)
    }

    /// Marks an unproduced operand as a weight. Builder convenience used for
    /// convolution and matmul right-hand sides.
    fn mark_weight(&mut self, id: TensorId) {
        let t = &mut self.tensors[id];
        if t.role == TensorRole::Input {
            t.role = TensorRole::Weight;
            t.hash = input_tensor_hash(&t.dims, t.dtype, t.role, id);
        }
    }

    pub fn conv(
        &mut self,
        input: TensorId,
        weight: TensorId,
        padding: Padding,
        stride: (usize, usize),
        dilation: (usize, usize),
    ) -> Result<TensorId, GraphError> {
        self.mark_weight(weight);
        let outs = self.add_op(Operator::conv(padding, stride, dilation), vec![input, weight])?;
        Ok(outs[0])
    }

    pub fn matmul(
        &mut self,
        lhs: TensorId,
        rhs: TensorId,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<TensorId, GraphError> {
        self.mark_weight(rhs);
        let outs = self.add_op(Operator::matmul(trans_a, trans_b), vec![lhs, rhs])?;
        Ok(outs[0])
    }

    pub fn transpose(&mut self, input: TensorId, perm: Vec<isize>) -> Result<TensorId, GraphError> {
        let outs = self.add_op(Operator::transpose(perm), vec![input])?;
        Ok(outs[0])
    }

    /// A same-shape reshape; the identity operator of the op set.
    pub fn identity(&mut self, input: TensorId) -> Result<TensorId, GraphError> {
        let dims = self.tensors[input].dims.clone();
        let outs = self.add_op(Operator::reshape(dims), vec![input])?;
        Ok(outs[0])
    }

    /// Recomputes connectivity, io sets, topological order and the hash for
    /// the operators added so far.
    pub fn finalize(&mut self) -> Result<(), GraphError> {
        self.num_valid = self.tensors.len();
        self.rebuild()
    }

    // ---- search-frame linking --------------------------------------------

    /// Replaces the operator list and relinks against the first `num_valid`
    /// pool tensors. Fails on duplicate producers, dangling references or
    /// cycles, leaving the graph unusable until the next reset.
    pub fn reset_ops(&mut self, ops: &[Operator], num_valid: usize) -> Result<(), GraphError> {
        self.ops = ops.to_vec();
        self.num_valid = num_valid.min(self.tensors.len());
        self.rebuild()
    }

    fn rebuild(&mut self) -> Result<(), GraphError> {
        let n = self.tensors.len();
        self.producer = vec![None; n];
        self.consumer_count = vec![0; n];

        for (idx, op) in self.ops.iter().enumerate() {
            if op.inputs.is_empty() {
                return Err(GraphError::Cyclic);
            }
            for &id in op.inputs.iter().chain(op.outputs.iter()) {
                if id >= self.num_valid {
                    return Err(GraphError::DanglingTensor(id));
                }
            }
            for &id in &op.outputs {
                if self.producer[id].replace(idx).is_some() {
                    return Err(GraphError::DuplicateProducer(id));
                }
            }
            for &id in &op.inputs {
                self.consumer_count[id] += 1;
            }
        }

        self.topo = self.topological_order()?;

        self.inputs = (0..self.num_valid)
            .filter(|&id| self.producer[id].is_none() && !self.tensors[id].is_clear())
            .collect();
        self.outputs = (0..self.num_valid)
            .filter(|&id| self.producer[id].is_some() && self.consumer_count[id] == 0)
            .collect();

        self.hash = self.compute_hash();
        Ok(())
    }

    fn topological_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut order = Vec::with_capacity(self.ops.len());
        let mut placed = vec![false; self.ops.len()];
        loop {
            let mut progressed = false;
            for idx in 0..self.ops.len() {
                if placed[idx] {
                    continue;
                }
                let ready = self.ops[idx].inputs.iter().all(|&id| {
                    self.producer[id].map(|p| placed[p]).unwrap_or(true)
                });
                if ready {
                    placed[idx] = true;
                    order.push(idx);
                    progressed = true;
                }
            }
            if order.len() == self.ops.len() {
                return Ok(order);
            }
            if !progressed {
                return Err(GraphError::Cyclic);
            }
        }
    }

    fn compute_hash(&self) -> u64 {
        let mut acc = self.ops.len() as u64;
        for op in &self.ops {
            let mut h = Fnv::new();
            h.write_u64(op.op_hash());
            h.write_usize(op.inputs.len());
            for &id in &op.inputs {
                h.write_u64(self.tensors[id].hash);
            }
            h.write_usize(op.outputs.len());
            for &id in &op.outputs {
                h.write_u64(self.tensors[id].hash);
            }
            acc = combine_unordered(acc, h.finish());
        }
        acc
    }

    // ---- accessors -------------------------------------------------------

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub(crate) fn tensors_mut(&mut self) -> &mut Vec<Tensor> {
        &mut self.tensors
    }

    pub fn tensor_ref(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    pub(crate) fn ops_mut(&mut self) -> &mut [Operator] {
        &mut self.ops
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Outputs that participate in matching (everything but `NotCounted`).
    pub fn counted_outputs(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.outputs
            .iter()
            .copied()
            .filter(|&id| self.tensors[id].role != TensorRole::NotCounted)
    }

    pub fn topo_order(&self) -> &[usize] {
        &self.topo
    }

    pub fn graph_hash(&self) -> u64 {
        self.hash
    }

    pub(crate) fn producer_of(&self, id: TensorId) -> Option<&Operator> {
        self.producer.get(id).copied().flatten().map(|idx| &self.ops[idx])
    }

    // ---- reference computation -------------------------------------------

    /// Value of tensor `id` at `pos`, back-computing through producers on
    /// demand and memoizing every point it touches.
    pub fn value_at(&self, id: TensorId, pos: &[usize]) -> Option<i32> {
        let tensor = &self.tensors[id];
        if let Some(v) = tensor.value_at(pos) {
            return Some(v);
        }
        tensor.offset_of(pos)?;
        let op_idx = self.producer[id]?;
        let op = &self.ops[op_idx];
        let slot = op.outputs.iter().position(|&o| o == id)?;
        let ins: Vec<&Tensor> = op.inputs.iter().map(|&i| &self.tensors[i]).collect();
        let outs: Vec<&Tensor> = op.outputs.iter().map(|&o| &self.tensors[o]).collect();
        let inputs = op.inputs.clone();
        let mut fetch = |k: usize, p: &[usize]| self.value_at(*inputs.get(k)?, p);
        let value = op.point(&ins, &outs, slot, pos, &mut fetch)?;
        tensor.store(pos, value);
        Some(value)
    }

    /// Scalar of output `output_idx` at `position`.
    pub fn compute(&self, position: &[usize], output_idx: usize) -> Option<i32> {
        let id = *self.outputs.get(output_idx)?;
        self.value_at(id, position)
    }

    /// Back-computes output `output_idx` at every position.
    pub fn compute_output_full(&self, output_idx: usize) -> bool {
        let Some(&id) = self.outputs.get(output_idx) else {
            return false;
        };
        let size = self.tensors[id].size();
        for offset in 0..size {
            let pos = self.tensors[id].pos_of(offset as u64);
            if self.value_at(id, &pos).is_none() {
                return false;
            }
        }
        true
    }

    /// Applies an operator's splitting-point inference to its outputs.
    pub(crate) fn apply_splitting(&mut self, op_idx: usize) {
        let op = self.ops[op_idx].clone();
        let ins: Vec<&Tensor> = op.inputs.iter().map(|&i| &self.tensors[i]).collect();
        let out_dims: Vec<Shape> = op.outputs.iter().map(|&o| self.tensors[o].dims.clone()).collect();
        let inferred = op.infer_splitting(&ins, &out_dims);
        for (&id, points) in op.outputs.iter().zip(inferred.into_iter()) {
            self.tensors[id].splitting_points = points;
        }
    }

    /// Infers splitting points for every operator in topological order.
    pub fn infer_all_splitting_points(&mut self) {
        for i in 0..self.topo.len() {
            let op_idx = self.topo[i];
            self.apply_splitting(op_idx);
        }
    }

    // ---- cloning ----------------------------------------------------------

    /// Deep-copies an operator list into a fresh, self-contained subgraph.
    /// Tensor metadata is preserved; reference data is dropped.
    pub(crate) fn from_ops(&self, ops: &[Operator]) -> SubGraph {
        let mut used: Vec<TensorId> = Vec::new();
        for op in ops {
            for &id in op.inputs.iter().chain(op.outputs.iter()) {
                if !used.contains(&id) {
                    used.push(id);
                }
            }
        }
        used.sort_unstable();

        let remap = |id: TensorId| used.binary_search(&id).expect("referenced tensor");
        let mut graph = SubGraph::new();
        for &id in &used {
            let tensor = self.tensors[id].clone();
            tensor.clear_data();
            graph.tensors.push(tensor);
        }
        for op in ops {
            let mut copy = op.clone();
            copy.inputs = op.inputs.iter().map(|&i| remap(i)).collect();
            copy.outputs = op.outputs.iter().map(|&o| remap(o)).collect();
            graph.ops.push(copy);
        }
        graph.num_valid = graph.tensors.len();
        graph
            .rebuild()
            .expect("a searched operator list always forms a DAG");
        graph
    }

    // ---- pool management --------------------------------------------------

    /// Grows the arena with cleared slots up to `size`.
    pub(crate) fn reserve_pool(&mut self, size: usize) {
        while self.tensors.len() < size {
            self.tensors.push(Tensor::empty());
        }
    }

    pub(crate) fn pool_len(&self) -> usize {
        self.tensors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn conv_graph() -> (SubGraph, TensorId, TensorId, TensorId) {
        let mut g = SubGraph::new();
        let i = g.tensor(vec![1, 2, 4, 4]);
        let w = g.tensor(vec![4, 2, 3, 3]);
        let o = g.conv(i, w, Padding::Fixed(1, 1), (1, 1), (1, 1)).unwrap();
        g.finalize().unwrap();
        (g, i, w, o)
    }

    #[test]
    fn io_sets_are_derived() {
        let (g, i, w, o) = conv_graph();
        assert_eq!(g.inputs(), &[i, w]);
        assert_eq!(g.outputs(), &[o]);
        assert_eq!(g.tensor_ref(w).role, TensorRole::Weight);
        assert_eq!(g.tensor_ref(o).dims, vec![1, 4, 4, 4]);
    }

    #[test]
    fn compute_backtracks_through_producers() {
        let (g, i, w, _) = conv_graph();
        let mut rng = StdRng::seed_from_u64(3);
        g.tensor_ref(i).fill_random(&mut rng);
        g.tensor_ref(w).fill_random(&mut rng);
        let v = g.compute(&[0, 1, 2, 2], 0);
        assert!(v.is_some());
        // Memoized: the same point computes to the same value.
        assert_eq!(g.compute(&[0, 1, 2, 2], 0), v);
    }

    #[test]
    fn compute_without_input_data_fails() {
        let (g, _, _, _) = conv_graph();
        assert_eq!(g.compute(&[0, 0, 0, 0], 0), None);
    }

    #[test]
    fn hash_ignores_operator_order() {
        let mut g = SubGraph::new();
        let a = g.tensor(vec![1, 2, 4, 4]);
        let b = g.tensor(vec![1, 2, 4, 4]);
        let t1 = g.transpose(a, vec![0, 1, 3, 2]).unwrap();
        let t2 = g.transpose(b, vec![0, 1, 3, 2]).unwrap();
        g.finalize().unwrap();
        let h_forward = g.graph_hash();

        let mut ops = g.ops().to_vec();
        ops.swap(0, 1);
        let mut g2 = g.clone();
        g2.reset_ops(&ops, g.pool_len()).unwrap();
        assert_eq!(g2.graph_hash(), h_forward);
        let _ = (t1, t2);
    }

    #[test]
    fn duplicate_producer_is_rejected() {
        let (g, _, _, o) = conv_graph();
        let mut ops = g.ops().to_vec();
        let mut dup = ops[0].clone();
        dup.outputs = vec![o];
        ops.push(dup);
        let mut g2 = g.clone();
        assert_eq!(
            g2.reset_ops(&ops, g.pool_len()),
            Err(GraphError::DuplicateProducer(o))
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = SubGraph::new();
        let a = g.tensor(vec![2, 2]);
        let b = g.tensor(vec![2, 2]);
        g.finalize().unwrap();
        // a -> add(a, x) where x is the add's own output.
        let mut op1 = Operator::unbound(crate::ops::OpParams::Add);
        op1.inputs = vec![a, b];
        op1.outputs = vec![a];
        assert!(matches!(
            g.reset_ops(&[op1], 2),
            Err(GraphError::DuplicateProducer(_)) | Err(GraphError::Cyclic)
        ));
    }

    #[test]
    fn from_ops_is_self_contained() {
        let (g, _, _, _) = conv_graph();
        let clone = g.from_ops(g.ops());
        assert_eq!(clone.ops().len(), 1);
        assert_eq!(clone.inputs().len(), 2);
        assert_eq!(clone.outputs().len(), 1);
        assert_eq!(clone.graph_hash(), g.graph_hash());
    }
}
