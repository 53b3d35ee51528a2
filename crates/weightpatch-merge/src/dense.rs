//! Dense merge: fold adapter deltas into the base weight.

use std::collections::BTreeSet;

use candle_core::Tensor;
use tracing::{debug, warn};
use weightpatch_common::Result;
use weightpatch_store::WeightStore;

use crate::engine::MergeEngine;
use crate::names::{
    DOWN_SUFFIX, MID_SUFFIX, UP_SUFFIX, W1_A_SUFFIX, W1_B_SUFFIX, W2_A_SUFFIX, W2_B_SUFFIX,
};
use crate::reconcile::{add_scaled, as_matrix, contract_mid, reconcile_to_shape};
use crate::resolution::{ParameterTarget, Resolution};
use crate::session::{AdapterSession, Decomposition, SessionAdapter};

impl MergeEngine {
    /// Resolve `name` by merging every applicable adapter delta into the base.
    ///
    /// `required` restricts which adapter files are merged: `None` merges all
    /// of them, an empty set merges none.
    pub fn resolve(
        &self,
        name: &str,
        target: &ParameterTarget,
        base: &dyn WeightStore,
        session: &AdapterSession,
        required: Option<&BTreeSet<String>>,
    ) -> Result<Resolution> {
        if required.is_some_and(|files| files.is_empty()) || !self.has_relevant_keys(name, session) {
            return self.reconcile_base(name, target, base);
        }

        let mut merged: Option<Tensor> = None;
        for adapter in session.adapters() {
            if required.is_some_and(|files| !files.contains(&adapter.path)) {
                continue;
            }
            let delta = match self.adapter_delta(name, adapter) {
                Ok(Some(delta)) => delta,
                Ok(None) => continue,
                Err(e) => {
                    warn!(file = %adapter.path, key = %name, error = %e, "could not form adapter delta");
                    continue;
                }
            };
            let current = match merged.take() {
                Some(t) => t,
                None => match self.load_base(name, target, base)? {
                    Some(t) => t,
                    None => {
                        debug!(key = %name, "base weight unavailable");
                        return Ok(Resolution::Fallthrough);
                    }
                },
            };
            match add_scaled(&current, &delta, f64::from(adapter.blend_weight))? {
                Some(t) => merged = Some(t),
                None => {
                    warn!(
                        file = %adapter.path,
                        key = %name,
                        base = ?current.dims(),
                        delta = ?delta.dims(),
                        "delta does not line up with base, skipping"
                    );
                    merged = Some(current);
                }
            }
        }

        match merged {
            Some(t) => self.finish(t, target),
            None => self.reconcile_base(name, target, base),
        }
    }

    /// Resolve and read through redirects, yielding the final tensor.
    pub fn resolve_tensor(
        &self,
        name: &str,
        target: &ParameterTarget,
        base: &dyn WeightStore,
        session: &AdapterSession,
        required: Option<&BTreeSet<String>>,
    ) -> Result<Option<Tensor>> {
        self.resolve(name, target, base, session, required)?.materialize(base, target.dtype, &self.codecs)
    }

    fn key(&self, name: &str, suffix: &str) -> String {
        format!("{}{name}{suffix}", self.prefix)
    }

    /// Whether any adapter carries a key for `name`: factor pairs, Hadamard
    /// factors and direct deltas all start with the prefixed name.
    fn has_relevant_keys(&self, name: &str, session: &AdapterSession) -> bool {
        let stem = self.key(name, "");
        session.adapters().iter().any(|a| a.has_key_with_prefix(&stem))
    }

    /// Base weight for `name` in working precision, reconciled to `target`.
    fn load_base(&self, name: &str, target: &ParameterTarget, base: &dyn WeightStore) -> Result<Option<Tensor>> {
        let Some(tensor) = base.read(name, Some(self.working), &self.codecs)? else {
            return Ok(None);
        };
        Ok(Some(reconcile_to_shape(&tensor, &target.shape)?))
    }

    /// No adapter applies: pass the base through, reconciling its shape if the
    /// stored one differs from `target`.
    fn reconcile_base(&self, name: &str, target: &ParameterTarget, base: &dyn WeightStore) -> Result<Resolution> {
        let Some(info) = base.read_like(name) else {
            return Ok(Resolution::Redirect(name.to_string()));
        };
        if info.shape == target.shape {
            return Ok(Resolution::Redirect(name.to_string()));
        }
        debug!(key = %name, stored = ?info.shape, target = ?target.shape, "reconciling base shape");
        match self.load_base(name, target, base)? {
            Some(t) => self.finish(t, target),
            None => Ok(Resolution::Fallthrough),
        }
    }

    /// The delta one adapter contributes to `name`, if it has one.
    fn adapter_delta(&self, name: &str, adapter: &SessionAdapter) -> Result<Option<Tensor>> {
        let file = adapter.path.as_str();
        let store = adapter.store.as_ref();
        let read = |suffix: &str| self.read_adapter(file, store, &self.key(name, suffix));

        match adapter.decomposition {
            Decomposition::Hadamard => {
                let (Some(w1a), Some(w1b), Some(w2a), Some(w2b)) =
                    (read(W1_A_SUFFIX), read(W1_B_SUFFIX), read(W2_A_SUFFIX), read(W2_B_SUFFIX))
                else {
                    return Ok(None);
                };
                let w1 = as_matrix(&w1a)?.matmul(&as_matrix(&w1b)?)?;
                let w2 = as_matrix(&w2a)?.matmul(&as_matrix(&w2b)?)?;
                Ok(Some(w1.mul(&w2)?))
            }
            Decomposition::Standard => {
                let (Some(up), Some(down)) = (read(UP_SUFFIX), read(DOWN_SUFFIX)) else {
                    return Ok(read(""));
                };
                let down = match read(MID_SUFFIX) {
                    Some(mid) => contract_mid(&down, &mid)?,
                    None => as_matrix(&down)?,
                };
                Ok(Some(as_matrix(&up)?.matmul(&down)?))
            }
        }
    }
}
