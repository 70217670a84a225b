//! Mutation generator for deep-neural-network computation subgraphs.
//!
//! Given a small dataflow graph of tensor operators, the generator
//! enumerates semantically equivalent or near-equivalent rewrites by a
//! depth-bounded search over operator additions, verifies every candidate
//! against the original by integer point sampling (or, optionally, by
//! splitting-point box verification), and returns the accepted rewrites.
//!
//! ```
//! use mutgen::{Generator, Operator, Options, Padding, SubGraph};
//!
//! let mut graph = SubGraph::new();
//! let input = graph.tensor(vec![1, 2, 4, 4]);
//! let weight = graph.tensor(vec![4, 2, 3, 3]);
//! graph
//!     .conv(input, weight, Padding::Fixed(1, 1), (1, 1), (1, 1))
//!     .unwrap();
//! graph.finalize().unwrap();
//!
//! let candidates = vec![
//!     Operator::extend(1, 1),
//!     Operator::conv(Padding::Fixed(1, 1), (1, 1), (1, 1)),
//! ];
//! let mutants = Generator::new(Options::default()).run(&mut graph, 2, candidates, 0.7);
//! assert!(!mutants.is_empty());
//! ```
//!
//! The crate is strictly single-threaded: one generator owns its search
//! frame and mutation cache, and callers that want parallel searches create
//! one generator per thread.

mod cache;
mod candidates;
mod classify;
mod config;
mod graph;
mod hashing;
mod ops;
mod preprocess;
mod reciprocity;
mod search;
mod tensor;
mod verify;

pub use cache::MutationCache;
pub use candidates::{for_kind as candidate_ops_for, CandidateSet};
pub use classify::{classify, SgKind};
pub use config::{Options, ENV_DISABLE_EQUIVALENT, ENV_DISABLE_NONEQUIVALENT, ENV_MUTATION_DEPTH};
pub use graph::{GraphError, SubGraph};
pub use ops::{
    ActKind, ConvParams, MatmulParams, OpKind, OpParams, Operator, Padding, PoolParams,
    TransKind, TransposeParams, TransposePos,
};
pub use reciprocity::{Reciprocity, MAX_RECIPROCITY_DETECT_DEPTH};
pub use search::{Generator, DEFAULT_MAX_DEPTH, DEFAULT_THRESHOLD, STRICT_THRESHOLD};
pub use tensor::{DType, Shape, Tensor, TensorData, TensorId, TensorRole};
pub use verify::SAMPLES_PER_OUTPUT;
