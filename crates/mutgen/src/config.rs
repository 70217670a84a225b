//! Search configuration.
//!
//! Options are threaded explicitly as a record instead of process-wide
//! toggles; [`Options::from_env`] is kept for callers that drive the process
//! through the environment variable convention.

use derive_new::new;

/// Environment variable disabling the equivalent-rewrite class.
pub const ENV_DISABLE_EQUIVALENT: &str = "DISABLE_EQUIVALENT_OPT";
/// Environment variable disabling the non-equivalent-rewrite class.
pub const ENV_DISABLE_NONEQUIVALENT: &str = "DISABLE_NONEQUIVALENT_OPT";
/// Environment variable overriding the search depth of auto-candidate runs.
pub const ENV_MUTATION_DEPTH: &str = "MUTATION_DEPTH";

/// Options controlling a [`Generator`](crate::Generator).
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Allow rewrites that are exactly equivalent to the input subgraph.
    pub enable_equivalent: bool,
    /// Allow rewrites that are only approximately equivalent. When disabled,
    /// the acceptance threshold is forced to 0.99.
    pub enable_nonequivalent: bool,
    /// Overrides the depth argument of auto-candidate runs when set.
    pub max_depth_override: Option<usize>,
    /// Use the splitting-point box verifier instead of point sampling.
    pub box_verification: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_equivalent: true,
            enable_nonequivalent: true,
            max_depth_override: None,
            box_verification: false,
        }
    }
}

impl Options {
    /// Builds options from the recognized environment variables.
    pub fn from_env() -> Self {
        let depth = std::env::var(ENV_MUTATION_DEPTH)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&d| d > 0);

        Self {
            enable_equivalent: std::env::var_os(ENV_DISABLE_EQUIVALENT).is_none(),
            enable_nonequivalent: std::env::var_os(ENV_DISABLE_NONEQUIVALENT).is_none(),
            max_depth_override: depth,
            box_verification: false,
        }
    }
}
