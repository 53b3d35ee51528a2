//! Adapter weight resolution for weightpatch
//!
//! Resolves the value of each model parameter from a base store plus a session
//! of low-rank adapters, either merged densely into the base weight or kept as
//! concatenated low-rank factors for fused execution.

mod dense;
mod engine;
mod factor;
pub mod names;
pub mod rank;
pub mod reconcile;
pub mod resolution;
pub mod session;

pub use engine::{IndexMapping, MergeEngine, identity_mapping};
pub use names::{FactorKey, FactorSide};
pub use rank::{RankOptions, RankReport, compute_rank, compute_rank_for_paths, module_keys};
pub use reconcile::{add_scaled, contract_mid, reconcile_to_shape};
pub use resolution::{ParameterTarget, Resolution};
pub use session::{AdapterDescriptor, AdapterSession, AdapterStage, Decomposition, SessionAdapter};
