//! The mutation generator: per-kind run paths and the depth-bounded DFS over
//! operator additions.
//!
//! One generator owns a tensor-pool subgraph that is re-linked at every
//! search node, the current operator list, the sampling positions of the
//! input subgraph and the mutation cache. The search frame is strictly
//! push/pop: whatever a node allocates it releases before returning.

use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashSet;
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cache::MutationCache;
use crate::candidates;
use crate::classify::{classify, SgKind};
use crate::config::Options;
use crate::graph::SubGraph;
use crate::ops::{Arity, OpKind, OpParams, Operator, TransKind, TransposePos};
use crate::reciprocity::Reciprocity;
use crate::tensor::{output_tensor_hash, Shape, Tensor, TensorId, TensorRole};
use crate::verify;

/// Depth used when the caller passes no usable depth.
pub const DEFAULT_MAX_DEPTH: usize = 3;
/// Acceptance threshold of the approximate-equivalence regime.
pub const DEFAULT_THRESHOLD: f32 = 0.7;
/// Threshold forced when non-equivalent rewrites are disabled.
pub const STRICT_THRESHOLD: f32 = 0.99;

/// Expansion never binds tensors past this pool index.
const MAX_TENSOR_INDEX: usize = 10;

/// Subgraph mutation generator.
pub struct Generator {
    pub(crate) options: Options,
    pub(crate) equal_threshold: f32,
    pub(crate) max_depth: usize,
    pub(crate) prune_reciprocity: bool,
    pub(crate) searching: SubGraph,
    pub(crate) oplist: Vec<Operator>,
    pub(crate) num_valid: usize,
    pub(crate) num_reserve_ops: usize,
    pub(crate) group_size: usize,
    pub(crate) candidates: Vec<Operator>,
    pub(crate) reciprocity: Option<Reciprocity>,
    pub(crate) computing_pos: Vec<Vec<(Vec<usize>, i32)>>,
    pub(crate) cache: MutationCache,
    pub(crate) rng: StdRng,
}

impl Generator {
    pub fn new(options: Options) -> Self {
        Self::with_mode(options, true)
    }

    /// `prune_reciprocity = false` puts the generator in reciprocity-finder
    /// mode: no transpose-chain pruning, and unary candidates are fully
    /// computed so all-transpose op lists can be verified densely.
    pub(crate) fn with_mode(options: Options, prune_reciprocity: bool) -> Self {
        debug!(
            "generator eq/non-eq opt status: {}/{}",
            options.enable_equivalent, options.enable_nonequivalent
        );
        let equal_threshold = if options.enable_nonequivalent {
            DEFAULT_THRESHOLD
        } else {
            STRICT_THRESHOLD
        };
        let mut searching = SubGraph::new();
        searching.reserve_pool(10);
        Self {
            options,
            equal_threshold,
            max_depth: DEFAULT_MAX_DEPTH,
            prune_reciprocity,
            searching,
            oplist: Vec::new(),
            num_valid: 0,
            num_reserve_ops: 0,
            group_size: 0,
            candidates: Vec::new(),
            reciprocity: None,
            computing_pos: Vec::new(),
            cache: MutationCache::new(),
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Live tensors in the search pool; equals the input count of the last
    /// searched subgraph once a run has finished.
    pub fn live_tensors(&self) -> usize {
        self.num_valid
    }

    /// Operators still on the search frame; zero once a run has finished.
    pub fn pending_ops(&self) -> usize {
        self.oplist.len()
    }

    /// Enumerates verified rewrites of `in_graph`.
    ///
    /// `max_depth = 0` yields nothing. An empty `candidate_ops` list selects
    /// the per-kind library (and its recommended depth); explicit candidates
    /// run a plain search at `max_depth`. `threshold` is the acceptance
    /// ratio of the verifier, tightened to 0.99 when non-equivalent rewrites
    /// are disabled.
    pub fn run(
        &mut self,
        in_graph: &mut SubGraph,
        max_depth: usize,
        candidate_ops: Vec<Operator>,
        threshold: f32,
    ) -> Vec<SubGraph> {
        let mut out = Vec::new();
        if !self.options.enable_equivalent && !self.options.enable_nonequivalent {
            return out;
        }
        if max_depth == 0 || in_graph.finalize().is_err() {
            return out;
        }

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.rng = StdRng::seed_from_u64(seed);
        self.group_size = 0;

        let kind = classify(in_graph);
        let auto = self.prune_reciprocity && candidate_ops.is_empty();
        let mut candidate_ops = candidate_ops;
        if auto {
            if matches!(kind, SgKind::Empty | SgKind::Others) {
                return out;
            }
            if kind == SgKind::NormalConv {
                if let Some(cached) = self.cached_result(in_graph) {
                    return cached;
                }
            }
            let set = candidates::for_kind(kind, in_graph, &self.options);
            candidate_ops = set.ops;
            self.max_depth = set.max_depth;
            self.group_size = set.group_size;
            if let Some(depth) = self.options.max_depth_override {
                self.max_depth = depth;
            }
        } else {
            self.max_depth = max_depth;
        }
        self.equal_threshold = if self.options.enable_nonequivalent {
            threshold
        } else {
            STRICT_THRESHOLD
        };
        self.candidates = candidate_ops;

        if self.prune_reciprocity {
            self.reciprocity = Some(Reciprocity::detect(&self.candidates, &self.options));
        }

        // Fresh reference data for the inputs, then the sampled positions.
        for &tid in in_graph.inputs() {
            in_graph.tensor_ref(tid).fill_random(&mut self.rng);
        }
        self.computing_pos.clear();
        for i in 0..in_graph.outputs().len() {
            let dims = in_graph.tensor_ref(in_graph.outputs()[i]).dims.clone();
            let mut samples: Vec<(Vec<usize>, i32)> = verify::sample_positions(&mut self.rng, &dims)
                .into_iter()
                .map(|pos| (pos, 0))
                .collect();
            for sample in samples.iter_mut() {
                match in_graph.compute(&sample.0, i) {
                    Some(v) => sample.1 = v,
                    None => return out,
                }
            }
            self.computing_pos.push(samples);
        }

        // Seed the pool with the input tensors.
        let num_inputs = in_graph.inputs().len();
        for t in self.searching.tensors_mut() {
            t.clear();
        }
        self.searching.reserve_pool(num_inputs + 2 * self.max_depth);
        for (slot, &tid) in in_graph.inputs().iter().enumerate() {
            let src = in_graph.tensor_ref(tid).clone();
            let dst = self.searching.tensor_mut(slot);
            dst.clone_meta_from(&src);
            dst.init_splitting_points();
            dst.share_data_from(&src);
        }
        self.num_valid = num_inputs;
        self.num_reserve_ops = 0;

        if self.options.box_verification {
            for i in 0..in_graph.outputs().len() {
                if !in_graph.compute_output_full(i) {
                    return out;
                }
            }
            for i in 0..in_graph.inputs().len() {
                let tid = in_graph.inputs()[i];
                in_graph.tensor_mut(tid).init_splitting_points();
            }
            in_graph.infer_all_splitting_points();
        }

        let mut visited: HashSet<u64> = HashSet::new();
        match kind {
            SgKind::Conv1x1 => {
                self.run_preprocessed(Self::preprocess_conv1x1, in_graph, &mut out, &mut visited);
                self.normal_conv_paths(in_graph, &mut out, &mut visited);
            }
            SgKind::NormalConv => {
                self.normal_conv_paths(in_graph, &mut out, &mut visited);
            }
            SgKind::TransKernelConv => {
                self.run_preprocessed(Self::preprocess_trans_kernel, in_graph, &mut out, &mut visited);
                self.add_to_cache(in_graph, &out);
            }
            SgKind::GroupConv => {
                self.run_preprocessed(Self::preprocess_group_conv_gcd, in_graph, &mut out, &mut visited);
                self.run_preprocessed(Self::preprocess_group_conv_max, in_graph, &mut out, &mut visited);
            }
            SgKind::TransposeGroupConv => {
                self.run_preprocessed(Self::preprocess_transpose_group_rs, in_graph, &mut out, &mut visited);
                self.run_preprocessed(Self::preprocess_transpose_group_sr, in_graph, &mut out, &mut visited);
                // The ungrouped rebuild is only reachable from a clean frame.
                self.reset_frame(num_inputs);
                self.dfs(0, in_graph, &mut out, &mut visited);
            }
            SgKind::NormalOddConv => {
                self.run_preprocessed(Self::preprocess_pad_slice, in_graph, &mut out, &mut visited);
            }
            SgKind::BatchMatmul => {
                self.run_preprocessed(Self::preprocess_batch_matmul, in_graph, &mut out, &mut visited);
            }
            _ => {
                self.reset_frame(num_inputs);
                self.dfs(0, in_graph, &mut out, &mut visited);
            }
        }

        self.reset_frame(num_inputs);
        self.group_size = 0;
        debug!("run produced {} mutant(s)", out.len());
        out
    }

    fn cached_result(&mut self, in_graph: &SubGraph) -> Option<Vec<SubGraph>> {
        if in_graph.ops().len() != 1 {
            return None;
        }
        let op = in_graph.ops()[0].clone();
        let key = self.cache.key_for(&op, in_graph)?;
        let hits = self.cache.get(key)?.to_vec();
        debug!("mutation cache hit ({} graphs)", hits.len());
        let mut result = Vec::new();
        for cached in hits {
            let mut graph = cached.clone();
            self.mark_trans_type(in_graph, &mut graph);
            let _ = graph.finalize();
            if self.valid_depth(&graph) {
                result.push(graph);
            }
        }
        Some(result)
    }

    fn add_to_cache(&mut self, in_graph: &SubGraph, out: &[SubGraph]) {
        if in_graph.ops().len() != 1 {
            return;
        }
        let op = in_graph.ops()[0].clone();
        if let Some(key) = self.cache.key_for(&op, in_graph) {
            self.cache.insert(key, out);
        }
    }

    fn normal_conv_paths(
        &mut self,
        in_graph: &SubGraph,
        out: &mut Vec<SubGraph>,
        visited: &mut HashSet<u64>,
    ) {
        let num_inputs = in_graph.inputs().len();
        self.split_group_conv(in_graph, out);
        self.reset_frame(num_inputs);
        self.dfs(0, in_graph, out, visited);
        self.add_to_cache(in_graph, out);
    }

    /// Runs a preprocess builder, keeping its scaffold as reserve ops on
    /// success and rolling the frame back entirely on failure, then searches.
    fn run_preprocessed(
        &mut self,
        preprocess: fn(&mut Self, &SubGraph) -> bool,
        in_graph: &SubGraph,
        out: &mut Vec<SubGraph>,
        visited: &mut HashSet<u64>,
    ) {
        let num_inputs = in_graph.inputs().len();
        self.reset_frame(num_inputs);
        if preprocess(self, in_graph) {
            self.num_reserve_ops = self.oplist.len();
        } else {
            self.reset_frame(num_inputs);
        }
        self.dfs(self.oplist.len(), in_graph, out, visited);
        self.reset_frame(num_inputs);
    }

    // ---- DFS -------------------------------------------------------------

    fn dfs(
        &mut self,
        depth: usize,
        in_graph: &SubGraph,
        out: &mut Vec<SubGraph>,
        visited: &mut HashSet<u64>,
    ) {
        if self
            .searching
            .reset_ops(&self.oplist, self.num_valid)
            .is_err()
        {
            return;
        }
        if !visited.insert(self.searching.graph_hash()) {
            return;
        }
        if self.prune_reciprocity {
            if let Some(reciprocity) = &self.reciprocity {
                if reciprocity.is_tail_reciprocity(&self.oplist, &self.searching) {
                    return;
                }
            }
        }

        // With no conv/matmul on the list every tensor was fully computed;
        // such lists are only mutants in reciprocity-finder mode.
        let full_computing = self.oplist.iter().all(|op| op.is_transpose_op());
        if self.oplist.len() >= self.num_reserve_ops.max(1)
            && (!full_computing || !self.prune_reciprocity)
            && self.is_a_mutant(in_graph, full_computing)
        {
            self.emit(in_graph, out);
            return;
        }

        if depth >= self.max_depth || self.oplist.len() >= self.max_depth {
            return;
        }

        let templates = self.candidates.clone();
        for template in &templates {
            match template.arity() {
                Arity::Split => {
                    for i in 0..self.num_valid {
                        if i > MAX_TENSOR_INDEX {
                            continue;
                        }
                        self.expand(template, &[i], full_computing, depth, in_graph, out, visited);
                    }
                }
                Arity::Concat => {
                    self.expand_concat(template, full_computing, depth, in_graph, out, visited);
                }
                Arity::Binary => {
                    let start = self.group_size * 3;
                    let local_full = full_computing && !template.is_compute_op();
                    for i in start..self.num_valid {
                        if i > MAX_TENSOR_INDEX {
                            break;
                        }
                        if template.is_compute_op() && self.has_compute_ancestor(i) {
                            continue;
                        }
                        for j in start..self.num_valid {
                            if j > MAX_TENSOR_INDEX {
                                break;
                            }
                            if template.is_compute_op() && self.has_compute_ancestor(j) {
                                continue;
                            }
                            self.expand(template, &[i, j], local_full, depth, in_graph, out, visited);
                        }
                    }
                }
                Arity::Unary => {
                    let start = self.group_size * 3;
                    // Reciprocity-finder mode computes; the mutation search
                    // only needs shapes here.
                    let full = !self.prune_reciprocity;
                    for i in start..self.num_valid {
                        if i > MAX_TENSOR_INDEX {
                            break;
                        }
                        self.expand(template, &[i], full, depth, in_graph, out, visited);
                    }
                }
            }
        }
    }

    /// Concat collects group-sized operand lists instead of enumerating
    /// tensor pairs: payload tensors past the input window form one group,
    /// weights another; a single member is replicated group-size times.
    fn expand_concat(
        &mut self,
        template: &Operator,
        full: bool,
        depth: usize,
        in_graph: &SubGraph,
        out: &mut Vec<SubGraph>,
        visited: &mut HashSet<u64>,
    ) {
        if self.group_size <= 1 {
            return;
        }
        let mut payload = Vec::new();
        for i in (self.group_size * 2)..self.num_valid {
            if i > MAX_TENSOR_INDEX {
                break;
            }
            let role = self.searching.tensor_ref(i).role;
            if role == TensorRole::Input || role == TensorRole::Intermediate {
                payload.push(i);
            }
        }
        let mut weights = Vec::new();
        for i in 0..self.num_valid {
            if i > MAX_TENSOR_INDEX {
                break;
            }
            if self.searching.tensor_ref(i).role == TensorRole::Weight {
                weights.push(i);
            }
        }

        for group in [payload, weights] {
            if group.len() == self.group_size {
                self.expand(template, &group, full, depth, in_graph, out, visited);
            } else if group.len() == 1 {
                let replicated = vec![group[0]; self.group_size];
                self.expand(template, &replicated, full, depth, in_graph, out, visited);
            }
        }
    }

    /// Binds a template to concrete inputs, recurses, then restores the frame.
    #[allow(clippy::too_many_arguments)]
    fn expand(
        &mut self,
        template: &Operator,
        inputs: &[TensorId],
        full: bool,
        depth: usize,
        in_graph: &SubGraph,
        out: &mut Vec<SubGraph>,
        visited: &mut HashSet<u64>,
    ) {
        let Some(op) = self.bind(template, inputs, full) else {
            return;
        };
        let num_outputs = op.outputs.len();
        if self.have_same_op(&op) {
            for _ in 0..num_outputs {
                self.pop_tensor();
            }
            return;
        }
        self.push_op(op);
        self.dfs(depth + 1, in_graph, out, visited);
        self.pop_op();
        for _ in 0..num_outputs {
            self.pop_tensor();
        }
    }

    /// Allocates outputs from the pool and runs shape inference (plus a full
    /// computation when requested and the input data is available). Rolls the
    /// allocations back and returns `None` on any rejection.
    pub(crate) fn bind(
        &mut self,
        template: &Operator,
        inputs: &[TensorId],
        full: bool,
    ) -> Option<Operator> {
        let num_outputs = template.num_outputs();
        let mut outputs = Vec::with_capacity(num_outputs);
        for _ in 0..num_outputs {
            outputs.push(self.new_tensor());
        }

        let shapes = {
            let ins: Vec<&Tensor> = inputs
                .iter()
                .map(|&id| self.searching.tensor_ref(id))
                .collect();
            template.infer_shapes(&ins)
        };
        let Some(shapes) = shapes else {
            self.rollback_tensors(num_outputs);
            return None;
        };

        let input_hashes: Vec<u64> = inputs
            .iter()
            .map(|&id| self.searching.tensor_ref(id).hash)
            .collect();
        let op_hash = template.op_hash();
        for (slot, dims) in shapes.into_iter().enumerate() {
            let hash = output_tensor_hash(op_hash, &input_hashes, slot);
            self.searching
                .tensor_mut(outputs[slot])
                .bind(dims, TensorRole::Intermediate, hash);
        }

        let mut op = template.clone();
        op.clear();
        op.inputs = inputs.to_vec();
        op.outputs = outputs;

        if full {
            let data_ready = op
                .inputs
                .iter()
                .all(|&id| self.searching.tensor_ref(id).has_full_data());
            if data_ready && !op.compute_full(self.searching.tensors()) {
                self.rollback_tensors(num_outputs);
                return None;
            }
            // Without dense input data the binding stays shape-only; values
            // are still reachable lazily through the graph.
        }
        Some(op)
    }

    pub(crate) fn push_op(&mut self, op: Operator) {
        self.oplist.push(op);
        if self.options.box_verification {
            self.apply_splitting_to_last();
        }
    }

    fn pop_op(&mut self) {
        assert!(!self.oplist.is_empty(), "operator stack underflow");
        self.oplist.pop();
    }

    /// Preprocess-style push: bind against the pool and append, returning the
    /// output ids, or roll back and report failure.
    pub(crate) fn try_push(
        &mut self,
        template: Operator,
        inputs: Vec<TensorId>,
    ) -> Option<Vec<TensorId>> {
        let op = self.bind(&template, &inputs, false)?;
        let outs = op.outputs.clone();
        self.push_op(op);
        Some(outs)
    }

    fn apply_splitting_to_last(&mut self) {
        let Some(op) = self.oplist.last().cloned() else {
            return;
        };
        let inferred = {
            let ins: Vec<&Tensor> = op
                .inputs
                .iter()
                .map(|&id| self.searching.tensor_ref(id))
                .collect();
            let out_dims: Vec<Shape> = op
                .outputs
                .iter()
                .map(|&id| self.searching.tensor_ref(id).dims.clone())
                .collect();
            op.infer_splitting(&ins, &out_dims)
        };
        for (&oid, points) in op.outputs.iter().zip(inferred.into_iter()) {
            self.searching.tensor_mut(oid).splitting_points = points;
        }
    }

    pub(crate) fn new_tensor(&mut self) -> TensorId {
        if self.num_valid >= self.searching.pool_len() {
            self.searching.reserve_pool(self.num_valid + 4);
        }
        let id = self.num_valid;
        debug_assert!(
            self.searching.tensor_ref(id).is_clear(),
            "allocating a non-clear pool slot"
        );
        self.num_valid += 1;
        id
    }

    pub(crate) fn pop_tensor(&mut self) {
        assert!(self.num_valid > 0, "tensor pool underflow");
        self.num_valid -= 1;
        self.searching.tensor_mut(self.num_valid).clear();
    }

    fn rollback_tensors(&mut self, count: usize) {
        for _ in 0..count {
            self.pop_tensor();
        }
    }

    pub(crate) fn reset_frame(&mut self, num_inputs: usize) {
        self.oplist.clear();
        while self.num_valid > num_inputs {
            self.pop_tensor();
        }
        self.num_reserve_ops = 0;
    }

    /// An identical operator over identically hashed inputs is already on
    /// the frame.
    fn have_same_op(&self, op: &Operator) -> bool {
        let hash = op.op_hash();
        for existing in &self.oplist {
            if existing.op_hash() != hash {
                continue;
            }
            let same_first = self.searching.tensor_ref(op.inputs[0]).hash
                == self.searching.tensor_ref(existing.inputs[0]).hash;
            if !same_first {
                continue;
            }
            if op.inputs.len() > 1
                && existing.inputs.len() > 1
                && self.searching.tensor_ref(op.inputs[1]).hash
                    != self.searching.tensor_ref(existing.inputs[1]).hash
            {
                continue;
            }
            return true;
        }
        false
    }

    /// A conv/matmul must not consume anything downstream of another
    /// conv/matmul on the frame.
    fn has_compute_ancestor(&self, id: TensorId) -> bool {
        let Some(op) = self.oplist.iter().find(|op| op.outputs.contains(&id)) else {
            return false;
        };
        if op.is_compute_op() {
            return true;
        }
        op.inputs.iter().any(|&input| self.has_compute_ancestor(input))
    }

    // ---- verification and emission ---------------------------------------

    fn is_a_mutant(&self, in_graph: &SubGraph, full_computing: bool) -> bool {
        let counted = self.searching.counted_outputs().count();
        if counted != in_graph.outputs().len() {
            return false;
        }
        let mut iidx = 0usize;
        for &oid in self.searching.outputs() {
            if self.searching.tensor_ref(oid).role == TensorRole::NotCounted {
                continue;
            }
            let in_oid = in_graph.outputs()[iidx];
            let ok = if full_computing {
                verify::full_equal(&self.searching, oid, in_graph, in_oid, self.equal_threshold)
            } else if self.options.box_verification {
                verify::box_accuracy(&self.searching, oid, in_graph, in_oid)
                    .map(|accuracy| accuracy > self.equal_threshold)
                    .unwrap_or(false)
            } else {
                verify::sampled_equal(
                    &self.searching,
                    oid,
                    &in_graph.tensor_ref(in_oid).dims,
                    &self.computing_pos[iidx],
                    self.equal_threshold,
                )
            };
            if !ok {
                return false;
            }
            iidx += 1;
        }
        true
    }

    fn emit(&mut self, in_graph: &SubGraph, out: &mut Vec<SubGraph>) {
        let mut mutant = self.searching.from_ops(&self.oplist);
        let out_ids: Vec<TensorId> = mutant.outputs().to_vec();
        let mut iidx = 0usize;
        for oid in out_ids {
            if mutant.tensor_ref(oid).role == TensorRole::NotCounted {
                continue;
            }
            let src = in_graph.tensor_ref(in_graph.outputs()[iidx]).clone();
            mutant.tensor_mut(oid).clone_meta_from(&src);
            iidx += 1;
        }
        if self.prune_reciprocity {
            self.mark_trans_type(in_graph, &mut mutant);
        }
        let _ = mutant.finalize();
        if self.valid_depth(&mutant) {
            debug!("emitting mutant with {} operator(s)", mutant.ops().len());
            out.push(mutant);
        }
    }

    /// Bounded searches reject graphs whose searched (non-reserve) operator
    /// count exceeds the depth.
    fn valid_depth(&self, graph: &SubGraph) -> bool {
        !(graph.ops().len().saturating_sub(self.num_reserve_ops) > self.max_depth
            && self.max_depth < 5)
    }

    // ---- direct rewrites --------------------------------------------------

    /// Rewrites a conv whose input channels are a multiple of its weight
    /// channels into explicit per-group split/conv/concat subgraphs, one per
    /// power-of-two group count. Equal by construction, so no verification.
    fn split_group_conv(&mut self, in_graph: &SubGraph, out: &mut Vec<SubGraph>) {
        if in_graph.ops().len() != 1 || in_graph.ops()[0].kind() != OpKind::Conv {
            return;
        }
        let num_inputs = in_graph.inputs().len();
        let op = in_graph.ops()[0].clone();
        let params = match &op.params {
            OpParams::Conv(p) => p.clone(),
            _ => return,
        };
        let Some(input_slot) = self.pool_slot_for(in_graph, op.inputs[0]) else {
            return;
        };
        let Some(weight_slot) = self.pool_slot_for(in_graph, op.inputs[1]) else {
            return;
        };
        let input_dims = self.searching.tensor_ref(input_slot).dims.clone();
        let weight_dims = self.searching.tensor_ref(weight_slot).dims.clone();
        if input_dims.len() != 4 || weight_dims.len() != 4 || weight_dims[1] == 0 {
            return;
        }

        let mut group = input_dims[1] / weight_dims[1] * 2;
        while group % 4 == 0 {
            self.reset_frame(num_inputs);
            group /= 2;
            self.searching.reserve_pool(self.num_valid + 5 * group + 2);

            let Some(input_parts) = self.try_push(Operator::split(1, vec![1; group]), vec![input_slot])
            else {
                return;
            };
            let Some(weight_parts) =
                self.try_push(Operator::split(0, vec![1; group]), vec![weight_slot])
            else {
                return;
            };
            let mut conv_outs = Vec::with_capacity(group);
            for k in 0..group {
                let Some(outs) = self.try_push(
                    Operator::conv_with(params.clone()),
                    vec![input_parts[k], weight_parts[k]],
                ) else {
                    return;
                };
                conv_outs.push(outs[0]);
            }
            if self.try_push(Operator::concat(1), conv_outs).is_none() {
                return;
            }
            if self
                .searching
                .reset_ops(&self.oplist, self.num_valid)
                .is_err()
            {
                return;
            }

            self.num_reserve_ops = self.oplist.len();
            let mut mutant = self.searching.from_ops(&self.oplist);
            let out_ids: Vec<TensorId> = mutant.outputs().to_vec();
            for (k, oid) in out_ids.into_iter().enumerate() {
                let src = in_graph.tensor_ref(in_graph.outputs()[k]).clone();
                mutant.tensor_mut(oid).clone_meta_from(&src);
            }
            let _ = mutant.finalize();
            if self.valid_depth(&mutant) {
                out.push(mutant);
            }
            self.num_reserve_ops = 0;
        }
    }

    /// Pool slot holding the clone of an input-graph tensor.
    pub(crate) fn pool_slot_for(&self, in_graph: &SubGraph, target: TensorId) -> Option<TensorId> {
        let hash = in_graph.tensor_ref(target).hash;
        (0..in_graph.inputs().len().min(self.num_valid))
            .find(|&slot| self.searching.tensor_ref(slot).hash == hash)
    }

    // ---- transpose position marking ---------------------------------------

    /// Tags pre/post transposes of transpose-conv-transpose mutants and folds
    /// the conv padding into the penalty vectors, per transpose kind.
    pub(crate) fn mark_trans_type(&self, in_graph: &SubGraph, mutant: &mut SubGraph) {
        if mutant.ops().len() != 3 {
            return;
        }
        let kinds: Vec<OpKind> = mutant.ops().iter().map(|op| op.kind()).collect();

        if kinds[1] == OpKind::Conv {
            if kinds[0] != OpKind::Transpose || kinds[2] != OpKind::Transpose {
                return;
            }
            let conv_op = mutant.ops()[1].clone();
            let (pad, stride) = match &conv_op.params {
                OpParams::Conv(p) => {
                    let w = &mutant.tensor_ref(conv_op.inputs[1]).dims;
                    if w.len() != 4 {
                        return;
                    }
                    (p.padding.resolve((w[2], w[3]), p.dilation), p.stride)
                }
                _ => return,
            };
            let pre = mutant.ops()[0].clone();
            let post = mutant.ops()[2].clone();
            let pre_kind = match &pre.params {
                OpParams::Transpose(t) => t.kind,
                _ => return,
            };
            if let OpParams::Transpose(t) = &mut mutant.ops_mut()[0].params {
                t.pos = TransposePos::Pre;
            }
            if let OpParams::Transpose(t) = &mut mutant.ops_mut()[2].params {
                t.pos = TransposePos::Post;
            }

            let mut penalty = mutant.tensor_ref(pre.inputs[0]).penalty.clone();
            if penalty.len() == 4 {
                match pre_kind {
                    // Zero padding rows do not need copying back.
                    TransKind::H2N => penalty[2] += pad.0 as i64,
                    TransKind::N2H | TransKind::D2H => penalty[2] = penalty[2] * 2 + pad.0 as i64,
                    TransKind::W2N => penalty[3] += pad.1 as i64,
                    TransKind::N2W | TransKind::D2W => penalty[3] = penalty[3] * 2 + pad.1 as i64,
                    _ => {}
                }
            }
            let graph_input = in_graph.tensor_ref(in_graph.inputs()[0]).clone();
            mutant.tensor_mut(pre.inputs[0]).clone_meta_from(&graph_input);
            mutant.tensor_mut(pre.outputs[0]).penalty = penalty.clone();
            let post_penalty = conv_output_penalty(&penalty, stride);
            mutant.tensor_mut(post.inputs[0]).penalty = post_penalty;
            let graph_output = in_graph.tensor_ref(in_graph.outputs()[0]).clone();
            mutant.tensor_mut(post.outputs[0]).clone_meta_from(&graph_output);
            return;
        }

        if kinds[2] == OpKind::Conv {
            if kinds[0] != OpKind::Transpose {
                return;
            }
            let conv_op = mutant.ops()[2].clone();
            let Some(producer) = mutant.producer_of(conv_op.inputs[0]).cloned() else {
                return;
            };
            let penalty = mutant.tensor_ref(producer.inputs[0]).penalty.clone();
            mutant.tensor_mut(conv_op.inputs[0]).penalty = penalty.clone();
            mutant.tensor_mut(conv_op.outputs[0]).penalty = penalty;
        }
    }
}

/// Penalty image of a convolution: spatial penalties shrink with the stride,
/// batch and channel penalties pass through.
fn conv_output_penalty(penalty: &[i64], stride: (usize, usize)) -> Vec<i64> {
    let mut out = penalty.to_vec();
    if out.len() == 4 {
        out[2] /= stride.0 as i64;
        out[3] /= stride.1 as i64;
    }
    out
}
