//! Preprocess builders: per-kind operator scaffolds injected into the search
//! frame before the DFS.
//!
//! Each builder returns `false` when a step does not bind; the caller then
//! rolls the whole frame back and searches from the clean state. On success
//! the pushed operators become the frame's reserve ops.

use crate::candidates::{gcd_all, swap_rs};
use crate::graph::SubGraph;
use crate::ops::{OpParams, Operator, Padding};
use crate::search::Generator;
use crate::tensor::{TensorId, TensorRole};

impl Generator {
    fn conv_params_of(graph: &SubGraph, op_idx: usize) -> Option<crate::ops::ConvParams> {
        match &graph.ops().get(op_idx)?.params {
            OpParams::Conv(p) => Some(p.clone()),
            _ => None,
        }
    }

    fn matmul_params_of(graph: &SubGraph, op_idx: usize) -> Option<crate::ops::MatmulParams> {
        match &graph.ops().get(op_idx)?.params {
            OpParams::Matmul(p) => Some(p.clone()),
            _ => None,
        }
    }

    /// pad -> conv -> slice for odd-spatial convolutions.
    pub(crate) fn preprocess_pad_slice(&mut self, in_graph: &SubGraph) -> bool {
        if !self.options.enable_nonequivalent {
            return false;
        }
        let Some(params) = Self::conv_params_of(in_graph, 0) else {
            return false;
        };
        let op = &in_graph.ops()[0];
        let (Some(input), Some(weight)) = (
            self.pool_slot_for(in_graph, op.inputs[0]),
            self.pool_slot_for(in_graph, op.inputs[1]),
        ) else {
            return false;
        };

        let Some(padded) = self.try_push(
            Operator::pad(vec![0, 0, 0, 0], vec![0, 0, 1, 1]),
            vec![input],
        ) else {
            return false;
        };
        let Some(conv_out) = self.try_push(Operator::conv_with(params), vec![padded[0], weight])
        else {
            return false;
        };
        self.try_push(
            Operator::slice(vec![0, 0, 0, 0], vec![0, 0, 1, 1]),
            vec![conv_out[0]],
        )
        .is_some()
    }

    /// Transpose both operands to the canonical kernel orientation, convolve,
    /// transpose the result back.
    pub(crate) fn preprocess_trans_kernel(&mut self, in_graph: &SubGraph) -> bool {
        let Some(params) = Self::conv_params_of(in_graph, 0) else {
            return false;
        };
        let op = &in_graph.ops()[0];
        let (Some(input), Some(weight)) = (
            self.pool_slot_for(in_graph, op.inputs[0]),
            self.pool_slot_for(in_graph, op.inputs[1]),
        ) else {
            return false;
        };

        let Some(t_in) = self.try_push(swap_rs(), vec![input]) else {
            return false;
        };
        let Some(t_wei) = self.try_push(swap_rs(), vec![weight]) else {
            return false;
        };
        let Some(conv_out) = self.try_push(Operator::conv_with(params), vec![t_in[0], t_wei[0]])
        else {
            return false;
        };
        self.try_push(swap_rs(), vec![conv_out[0]]).is_some()
    }

    /// reshape(weight) [+ batch-replicating concat] / reshape(input) ->
    /// matmul -> reshape for 1x1 convolutions.
    pub(crate) fn preprocess_conv1x1(&mut self, in_graph: &SubGraph) -> bool {
        let op = in_graph.ops()[0].clone();
        if Self::conv_params_of(in_graph, 0).is_none() {
            return false;
        }
        let (Some(input), Some(weight)) = (
            self.pool_slot_for(in_graph, op.inputs[0]),
            self.pool_slot_for(in_graph, op.inputs[1]),
        ) else {
            return false;
        };
        let in_dims = self.searching.tensor_ref(input).dims.clone();
        let f = self.searching.tensor_ref(weight).dims[0];
        let (n, c) = (in_dims[0], in_dims[1]);
        let out_dims = in_graph.tensor_ref(op.outputs[0]).dims.clone();

        let gemm_weight = if n == 1 {
            let Some(reshaped) = self.try_push(Operator::reshape(vec![1, f, c]), vec![weight])
            else {
                return false;
            };
            self.searching.tensor_mut(reshaped[0]).role = TensorRole::Weight;
            reshaped[0]
        } else {
            let Some(reshaped) = self.try_push(Operator::reshape(vec![1, f, c]), vec![weight])
            else {
                return false;
            };
            self.searching.tensor_mut(reshaped[0]).role = TensorRole::Weight;
            let Some(batched) = self.try_push(Operator::concat(0), vec![reshaped[0]; n]) else {
                return false;
            };
            self.searching.tensor_mut(batched[0]).role = TensorRole::Weight;
            batched[0]
        };

        let Some(gemm_input) = self.try_push(
            Operator::reshape(vec![n, c, in_dims[2] * in_dims[3]]),
            vec![input],
        ) else {
            return false;
        };
        let Some(gemm_out) = self.try_push(
            Operator::matmul(false, false),
            vec![gemm_weight, gemm_input[0]],
        ) else {
            return false;
        };
        self.try_push(Operator::reshape(out_dims), vec![gemm_out[0]])
            .is_some()
    }

    /// Concat both operand lists on the batch axis, one fused matmul, split
    /// the result back per operator.
    pub(crate) fn preprocess_batch_matmul(&mut self, in_graph: &SubGraph) -> bool {
        if !self.options.enable_equivalent {
            return false;
        }
        let Some(first) = Self::matmul_params_of(in_graph, 0) else {
            return false;
        };
        let mut lhs = Vec::new();
        let mut rhs = Vec::new();
        let mut sizes = Vec::new();
        for op in in_graph.ops() {
            let (Some(left), Some(right)) = (
                self.pool_slot_for(in_graph, op.inputs[0]),
                self.pool_slot_for(in_graph, op.inputs[1]),
            ) else {
                return false;
            };
            sizes.push(self.searching.tensor_ref(left).dims[0]);
            lhs.push(left);
            rhs.push(right);
        }

        let Some(cat_lhs) = self.try_push(Operator::concat(0), lhs) else {
            return false;
        };
        let Some(cat_rhs) = self.try_push(Operator::concat(0), rhs) else {
            return false;
        };
        let Some(fused) = self.try_push(
            Operator::matmul(first.trans_a, first.trans_b),
            vec![cat_lhs[0], cat_rhs[0]],
        ) else {
            return false;
        };
        self.try_push(Operator::split(0, sizes), vec![fused[0]])
            .is_some()
    }

    /// Extend every input to a common channel multiple (gcd mode), concat
    /// inputs and weights, one fused conv, split back by the gcd ratios.
    pub(crate) fn preprocess_group_conv_gcd(&mut self, in_graph: &SubGraph) -> bool {
        if !self.options.enable_nonequivalent {
            return false;
        }
        let fvec: Vec<usize> = in_graph
            .ops()
            .iter()
            .map(|op| in_graph.tensor_ref(op.inputs[1]).dims[0])
            .collect();
        let fgcd = gcd_all(&fvec);
        self.searching
            .reserve_pool(self.group_size * 4 + self.max_depth * 2);

        let mut ins: Vec<TensorId> = Vec::new();
        let mut weis: Vec<TensorId> = Vec::new();
        for (i, op) in in_graph.ops().iter().enumerate() {
            let Some(input) = self.pool_slot_for(in_graph, op.inputs[0]) else {
                continue;
            };
            if self.searching.tensor_ref(input).role == TensorRole::Input {
                if fvec[i] / fgcd > 1 {
                    match self.try_push(Operator::extend(1, fvec[i] / fgcd - 1), vec![input]) {
                        Some(extended) => ins.push(extended[0]),
                        None => continue,
                    }
                } else {
                    ins.push(input);
                }
            }
            if let Some(weight) = self.pool_slot_for(in_graph, op.inputs[1]) {
                weis.push(weight);
            }
        }

        let Some(conv_in) = self.try_push(Operator::concat(1), ins) else {
            return false;
        };
        let Some(conv_wei) = self.try_push(Operator::concat(0), weis) else {
            return false;
        };
        let Some(conv_out) = self.try_push(
            Operator::conv(Padding::Same, (1, 1), (1, 1)),
            vec![conv_in[0], conv_wei[0]],
        ) else {
            return false;
        };
        let ratios: Vec<usize> = fvec.iter().map(|f| f / fgcd).collect();
        self.try_push(Operator::split(1, ratios), vec![conv_out[0]])
            .is_some()
    }

    /// Zero-pad every weight to the maximum output-channel count (max mode);
    /// the split marks the padding lanes as not counted.
    pub(crate) fn preprocess_group_conv_max(&mut self, in_graph: &SubGraph) -> bool {
        if !self.options.enable_nonequivalent {
            return false;
        }
        let fvec: Vec<usize> = in_graph
            .ops()
            .iter()
            .map(|op| in_graph.tensor_ref(op.inputs[1]).dims[0])
            .collect();
        let fmax = fvec.iter().copied().max().unwrap_or(0);
        if fmax == 0 {
            return false;
        }
        self.searching
            .reserve_pool(self.group_size * 4 + self.max_depth * 2);

        let mut ins: Vec<TensorId> = Vec::new();
        let mut weis: Vec<TensorId> = Vec::new();
        for (i, op) in in_graph.ops().iter().enumerate() {
            if let Some(weight) = self.pool_slot_for(in_graph, op.inputs[1]) {
                let rank = self.searching.tensor_ref(weight).dims.len();
                if fvec[i] < fmax {
                    let mut end = vec![0; rank];
                    end[0] = fmax - fvec[i];
                    match self.try_push(Operator::pad(vec![0; rank], end), vec![weight]) {
                        Some(padded) => {
                            self.searching.tensor_mut(padded[0]).role = TensorRole::Weight;
                            weis.push(padded[0]);
                        }
                        None => continue,
                    }
                } else {
                    weis.push(weight);
                }
            }
            if let Some(input) = self.pool_slot_for(in_graph, op.inputs[0]) {
                ins.push(input);
            }
        }

        let Some(conv_in) = self.try_push(Operator::concat(1), ins) else {
            return false;
        };
        let Some(conv_wei) = self.try_push(Operator::concat(0), weis) else {
            return false;
        };
        let Some(conv_out) = self.try_push(
            Operator::conv(Padding::Same, (1, 1), (1, 1)),
            vec![conv_in[0], conv_wei[0]],
        ) else {
            return false;
        };

        let mut sizes = Vec::new();
        let mut padding_lane = Vec::new();
        for &f in &fvec {
            if f < fmax {
                sizes.push(f);
                sizes.push(fmax - f);
                padding_lane.push(false);
                padding_lane.push(true);
            } else {
                sizes.push(f);
                padding_lane.push(false);
            }
        }
        let Some(outs) = self.try_push(Operator::split(1, sizes), vec![conv_out[0]]) else {
            return false;
        };
        for (&oid, &is_padding) in outs.iter().zip(padding_lane.iter()) {
            if is_padding {
                self.searching.tensor_mut(oid).role = TensorRole::NotCounted;
            }
        }
        true
    }

    pub(crate) fn preprocess_transpose_group_rs(&mut self, in_graph: &SubGraph) -> bool {
        self.preprocess_transpose_group(in_graph, false)
    }

    pub(crate) fn preprocess_transpose_group_sr(&mut self, in_graph: &SubGraph) -> bool {
        self.preprocess_transpose_group(in_graph, true)
    }

    /// Group convolutions whose kernels agree up to a last-two-dims swap:
    /// transpose the outliers to a canonical orientation, fuse, split, and
    /// un-transpose the affected outputs. `swap_canonical` flips which
    /// orientation counts as canonical.
    fn preprocess_transpose_group(&mut self, in_graph: &SubGraph, swap_canonical: bool) -> bool {
        let Some(params) = Self::conv_params_of(in_graph, 0) else {
            return false;
        };
        let r = in_graph.tensor_ref(in_graph.ops()[0].inputs[1]).dims[2];

        let mut inputs = Vec::new();
        let mut weights = Vec::new();
        let mut transposed = Vec::new();
        for op in in_graph.ops() {
            let (Some(input), Some(weight)) = (
                self.pool_slot_for(in_graph, op.inputs[0]),
                self.pool_slot_for(in_graph, op.inputs[1]),
            ) else {
                return false;
            };
            let matches_canon = (self.searching.tensor_ref(weight).dims[2] == r) ^ swap_canonical;
            if matches_canon {
                inputs.push(input);
                weights.push(weight);
                transposed.push(false);
            } else {
                let Some(t_in) = self.try_push(swap_rs(), vec![input]) else {
                    return false;
                };
                let Some(t_wei) = self.try_push(swap_rs(), vec![weight]) else {
                    return false;
                };
                self.searching.tensor_mut(t_wei[0]).role = TensorRole::Weight;
                inputs.push(t_in[0]);
                weights.push(t_wei[0]);
                transposed.push(true);
            }
        }

        let Some(conv_in) = self.try_push(Operator::concat(1), inputs) else {
            return false;
        };
        let Some(conv_wei) = self.try_push(Operator::concat(0), weights) else {
            return false;
        };
        let Some(conv_out) = self.try_push(
            Operator::conv_with(params),
            vec![conv_in[0], conv_wei[0]],
        ) else {
            return false;
        };
        let Some(outs) = self.try_push(
            Operator::split(1, vec![1; in_graph.ops().len()]),
            vec![conv_out[0]],
        ) else {
            return false;
        };
        // Every lane gets its own tail op, so the scaffold's outputs keep the
        // per-operator order of the input subgraph regardless of which lanes
        // needed the un-transpose.
        for (&oid, &was_transposed) in outs.iter().zip(transposed.iter()) {
            let tail = if was_transposed {
                swap_rs()
            } else {
                let dims = self.searching.tensor_ref(oid).dims.clone();
                Operator::reshape(dims)
            };
            if self.try_push(tail, vec![oid]).is_none() {
                return false;
            }
        }
        true
    }
}
