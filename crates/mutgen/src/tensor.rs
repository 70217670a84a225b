//! Tensor model.
//!
//! Tensors live in an arena owned by a [`SubGraph`](crate::SubGraph) and are
//! referred to by stable integer ids. The search frame reuses pool slots:
//! a slot is written when an operator binds it as an output and cleared when
//! the operator is popped. Verification runs on `i32` data regardless of the
//! declared dtype.

use std::cell::RefCell;

use hashbrown::HashMap;
use rand::Rng;
use strum_macros::Display;

use crate::hashing::Fnv;

/// Tensor shape, outermost dimension first.
pub type Shape = Vec<usize>;

/// Index of a tensor in its owning arena.
pub type TensorId = usize;

/// Element type tag. The search itself always simulates on `i32` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DType {
    Float32,
    Int32,
}

/// Role of a tensor inside a subgraph.
///
/// `NotCounted` marks outputs that exist only for structural reasons (for
/// example the zero-padding lanes of a max-size group convolution) and are
/// skipped by output matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TensorRole {
    Input,
    Weight,
    Intermediate,
    NotCounted,
}

/// Lazily produced integer contents.
#[derive(Debug, Clone, Default)]
pub enum TensorData {
    /// No values computed yet.
    #[default]
    Empty,
    /// Dense row-major buffer covering the whole tensor.
    Full(Vec<i32>),
    /// Sparse memo of back-computed points, keyed by row-major offset.
    Memo(HashMap<u64, i32>),
}

/// A tensor: shape metadata plus lazily computed reference values.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub dims: Shape,
    pub dtype: DType,
    pub role: TensorRole,
    /// Structural hash; derived from shape, dtype, role and producer identity.
    pub hash: u64,
    /// Per-dim virtual padding, propagated for downstream code generation.
    pub penalty: Vec<i64>,
    /// Per-dim strictly increasing interior indices where values may jump.
    pub splitting_points: Vec<Vec<usize>>,
    data: RefCell<TensorData>,
}

impl Tensor {
    pub(crate) fn new(dims: Shape, dtype: DType, role: TensorRole, hash: u64) -> Self {
        let rank = dims.len();
        Self {
            dims,
            dtype,
            role,
            hash,
            penalty: vec![0; rank],
            splitting_points: vec![Vec::new(); rank],
            data: RefCell::new(TensorData::Empty),
        }
    }

    /// An unbound pool slot.
    pub(crate) fn empty() -> Self {
        Self::new(Vec::new(), DType::Int32, TensorRole::Intermediate, 0)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Row-major offset of `pos`, or `None` when out of bounds.
    pub fn offset_of(&self, pos: &[usize]) -> Option<u64> {
        if pos.len() != self.dims.len() {
            return None;
        }
        let mut offset = 0u64;
        for (p, d) in pos.iter().zip(self.dims.iter()) {
            if p >= d {
                return None;
            }
            offset = offset * (*d as u64) + *p as u64;
        }
        Some(offset)
    }

    /// Multi-index of a row-major offset.
    pub fn pos_of(&self, mut offset: u64) -> Shape {
        let mut pos = vec![0usize; self.dims.len()];
        for d in (0..self.dims.len()).rev() {
            pos[d] = (offset % self.dims[d] as u64) as usize;
            offset /= self.dims[d] as u64;
        }
        pos
    }

    /// Value at `pos` if it has been computed or filled.
    pub fn value_at(&self, pos: &[usize]) -> Option<i32> {
        let offset = self.offset_of(pos)?;
        match &*self.data.borrow() {
            TensorData::Empty => None,
            TensorData::Full(buf) => buf.get(offset as usize).copied(),
            TensorData::Memo(map) => map.get(&offset).copied(),
        }
    }

    /// Memoizes a back-computed value.
    pub(crate) fn store(&self, pos: &[usize], value: i32) {
        let Some(offset) = self.offset_of(pos) else {
            return;
        };
        let mut data = self.data.borrow_mut();
        match &mut *data {
            TensorData::Empty => {
                let mut map = HashMap::new();
                map.insert(offset, value);
                *data = TensorData::Memo(map);
            }
            TensorData::Memo(map) => {
                map.insert(offset, value);
            }
            // A dense buffer is authoritative; nothing to record.
            TensorData::Full(_) => {}
        }
    }

    pub(crate) fn set_full(&self, buf: Vec<i32>) {
        debug_assert_eq!(buf.len(), self.size());
        *self.data.borrow_mut() = TensorData::Full(buf);
    }

    pub(crate) fn full_data(&self) -> Option<Vec<i32>> {
        match &*self.data.borrow() {
            TensorData::Full(buf) => Some(buf.clone()),
            _ => None,
        }
    }

    pub fn has_full_data(&self) -> bool {
        matches!(&*self.data.borrow(), TensorData::Full(_))
    }

    /// Fills the tensor with fresh random reference values.
    pub fn fill_random<R: Rng>(&self, rng: &mut R) {
        let buf = (0..self.size()).map(|_| rng.gen_range(0..256)).collect();
        self.set_full(buf);
    }

    pub(crate) fn clear_data(&self) {
        *self.data.borrow_mut() = TensorData::Empty;
    }

    /// Resets every dimension to an empty splitting-point set.
    pub fn init_splitting_points(&mut self) {
        self.splitting_points = vec![Vec::new(); self.dims.len()];
    }

    /// Copies shape metadata (not contents) from another tensor, preserving
    /// its structural identity. Used both to seed the search pool from the
    /// input subgraph and to stamp input-graph metadata onto mutant outputs.
    pub(crate) fn clone_meta_from(&mut self, other: &Tensor) {
        self.dims = other.dims.clone();
        self.dtype = other.dtype;
        self.role = other.role;
        self.hash = other.hash;
        self.penalty = other.penalty.clone();
        self.splitting_points = other.splitting_points.clone();
    }

    /// Copies the dense contents of another tensor into this slot.
    pub(crate) fn share_data_from(&self, other: &Tensor) {
        if let Some(buf) = other.full_data() {
            self.set_full(buf);
        } else {
            self.clear_data();
        }
    }

    /// Binds a pool slot to a freshly inferred output.
    pub(crate) fn bind(&mut self, dims: Shape, role: TensorRole, hash: u64) {
        debug_assert!(self.is_clear(), "binding a non-clear pool tensor");
        let rank = dims.len();
        self.dims = dims;
        self.dtype = DType::Int32;
        self.role = role;
        self.hash = hash;
        self.penalty = vec![0; rank];
        self.splitting_points = vec![Vec::new(); rank];
        self.clear_data();
    }

    /// Returns the slot to the unbound state.
    pub(crate) fn clear(&mut self) {
        self.dims.clear();
        self.role = TensorRole::Intermediate;
        self.hash = 0;
        self.penalty.clear();
        self.splitting_points.clear();
        self.clear_data();
    }

    pub(crate) fn is_clear(&self) -> bool {
        self.dims.is_empty()
    }
}

/// Structural hash for a graph input tensor: shape, dtype, role and the
/// arena slot it was created in.
pub(crate) fn input_tensor_hash(dims: &[usize], dtype: DType, role: TensorRole, slot: usize) -> u64 {
    let mut h = Fnv::new();
    h.write_slice(dims);
    h.write_u64(dtype as u64);
    h.write_u64(role as u64);
    h.write_usize(slot);
    h.finish()
}

/// Structural hash for an operator output: producer hash, the producer's
/// input identities and the output slot.
pub(crate) fn output_tensor_hash(op_hash: u64, input_hashes: &[u64], slot: usize) -> u64 {
    let mut h = Fnv::new();
    h.write_u64(op_hash);
    h.write_usize(input_hashes.len());
    for &ih in input_hashes {
        h.write_u64(ih);
    }
    h.write_usize(slot);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn offsets_round_trip() {
        let t = Tensor::new(vec![2, 2, 4, 4], DType::Int32, TensorRole::Input, 1);
        assert_eq!(t.offset_of(&[1, 0, 0, 1]), Some(33));
        assert_eq!(t.offset_of(&[1, 0, 3, 3]), Some(47));
        assert_eq!(t.pos_of(47), vec![1, 0, 3, 3]);
        assert_eq!(t.offset_of(&[0, 0, 0, 4]), None);
    }

    #[test]
    fn memoized_points_are_returned() {
        let t = Tensor::new(vec![2, 3], DType::Int32, TensorRole::Intermediate, 1);
        assert_eq!(t.value_at(&[1, 2]), None);
        t.store(&[1, 2], 42);
        assert_eq!(t.value_at(&[1, 2]), Some(42));
        assert_eq!(t.value_at(&[0, 0]), None);
    }

    #[test]
    fn random_fill_covers_the_tensor() {
        let t = Tensor::new(vec![2, 2], DType::Int32, TensorRole::Input, 1);
        let mut rng = StdRng::seed_from_u64(7);
        t.fill_random(&mut rng);
        for i in 0..2 {
            for j in 0..2 {
                assert!(t.value_at(&[i, j]).is_some());
            }
        }
    }

    #[test]
    fn clear_resets_the_slot() {
        let mut t = Tensor::new(vec![2, 2], DType::Int32, TensorRole::Weight, 9);
        t.store(&[0, 0], 1);
        t.clear();
        assert!(t.is_clear());
        assert_eq!(t.value_at(&[0, 0]), None);
    }
}
