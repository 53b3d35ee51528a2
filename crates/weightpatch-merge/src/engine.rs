//! Merge engine entry points.
//!
//! [`MergeEngine`] carries the explicit merge settings (key prefix, codecs,
//! working precision); the dense path lives in `dense.rs` and the fused
//! low-rank path in `factor.rs`.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{DType, Tensor};
use tracing::{debug, warn};
use weightpatch_common::{Codec, MergeConfig, Result};
use weightpatch_store::WeightStore;

use crate::names::is_fused_factor_name;
use crate::rank::RankReport;
use crate::resolution::{ParameterTarget, Resolution};
use crate::session::AdapterSession;

/// Maps a fused layer index to the index of the module it was trained on.
pub type IndexMapping = BTreeMap<usize, usize>;

/// `i -> i` for `0..len`.
pub fn identity_mapping(len: usize) -> IndexMapping {
    (0..len).map(|i| (i, i)).collect()
}

/// Resolves parameter values from a base store and an adapter session.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    pub(crate) prefix: String,
    pub(crate) codecs: Vec<Codec>,
    pub(crate) working: DType,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(&MergeConfig::default())
    }
}

impl MergeEngine {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            prefix: config.key_prefix.clone(),
            codecs: config.acceptable_codecs.clone(),
            working: config.working_precision.dtype(),
        }
    }

    /// Precision merge arithmetic runs in.
    pub fn working_dtype(&self) -> DType {
        self.working
    }

    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    /// Read an adapter tensor in working precision. Unreadable payloads are
    /// treated as absent.
    pub(crate) fn read_adapter(&self, file: &str, store: &dyn WeightStore, key: &str) -> Option<Tensor> {
        match store.read(key, Some(self.working), &self.codecs) {
            Ok(tensor) => tensor,
            Err(e) => {
                warn!(file, key = %key, error = %e, "unreadable adapter tensor, skipping");
                None
            }
        }
    }

    pub(crate) fn finish(&self, tensor: Tensor, target: &ParameterTarget) -> Result<Resolution> {
        let tensor = if tensor.dtype() == target.dtype { tensor } else { tensor.to_dtype(target.dtype)? };
        Ok(Resolution::Value(tensor))
    }

    /// Resolve `name` the way a fused low-rank architecture loads it.
    ///
    /// Fused factor names go through [`resolve_factor`](Self::resolve_factor);
    /// anything else is merged densely, but only from files `report` flags as
    /// carrying a full delta for that name.
    pub fn resolve_parameter(
        &self,
        name: &str,
        target: &ParameterTarget,
        base: &dyn WeightStore,
        session: &AdapterSession,
        mapping: &IndexMapping,
        report: &RankReport,
    ) -> Result<Resolution> {
        let required: BTreeSet<String> = report.files_requiring_merge_for(name);
        if is_fused_factor_name(name) {
            debug!(key = %name, "resolving fused factor");
            self.resolve_factor(name, target, mapping, session, Some(&required))
        } else {
            self.resolve(name, target, base, session, Some(&required))
        }
    }
}
