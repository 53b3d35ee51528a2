//! Rank resolution over adapter stores.
//!
//! The combined rank of a set of adapter files is the sum of each file's
//! largest low-rank dimension. Files that carry full weight deltas instead of
//! low-rank factors are reported per key so the caller can merge them densely.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info};
use weightpatch_common::{MergeConfig, Result};
use weightpatch_store::{StoreOpener, WeightStore};

use crate::names::{DOWN_SUFFIX, UP_SUFFIX, is_model_weight_key, is_rank_key, module_id};
use crate::session::AdapterSession;

/// Knobs for [`compute_rank`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankOptions {
    /// Keys not starting with this prefix are ignored.
    pub prefix: String,
    /// Base model file; never reported as requiring a full merge.
    pub model_file: Option<String>,
    pub inspect_full_merge: bool,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self { prefix: String::new(), model_file: None, inspect_full_merge: true }
    }
}

impl RankOptions {
    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            prefix: config.key_prefix.clone(),
            model_file: config.model_file.clone(),
            inspect_full_merge: config.inspect_full_merge,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_model_file(mut self, model_file: impl Into<String>) -> Self {
        self.model_file = Some(model_file.into());
        self
    }
}

/// Result of scanning a set of adapter files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RankReport {
    pub total_rank: usize,
    /// Largest rank found in each file, in scan order.
    pub file_ranks: Vec<(String, usize)>,
    /// Files holding full deltas, with the keys that gave them away.
    pub files_requiring_full_merge: BTreeMap<String, BTreeSet<String>>,
}

impl RankReport {
    /// Files whose full-delta keys include `name`.
    pub fn files_requiring_merge_for(&self, name: &str) -> BTreeSet<String> {
        self.files_requiring_full_merge
            .iter()
            .filter(|(_, keys)| keys.contains(name))
            .map(|(file, _)| file.clone())
            .collect()
    }
}

fn file_rank(
    file: &str,
    store: &dyn WeightStore,
    options: &RankOptions,
    full_merge: &mut BTreeMap<String, BTreeSet<String>>,
) -> usize {
    let is_model_file = options.model_file.as_deref() == Some(file);
    let mut rank = 0;
    for key in store.keys() {
        if !key.starts_with(&options.prefix) {
            continue;
        }
        if is_model_weight_key(&key) {
            if options.inspect_full_merge && !is_model_file {
                full_merge.entry(file.to_string()).or_default().insert(key);
            }
            continue;
        }
        if !is_rank_key(&key) {
            continue;
        }
        let Some(info) = store.read_like(&key) else {
            continue;
        };
        // grouped (mixture-of-experts) factors keep the rank on axis 1
        let contribution = match info.shape.as_slice() {
            [_, r, _] => *r,
            [r, ..] => *r,
            [] => continue,
        };
        rank = rank.max(contribution);
    }
    rank
}

/// Scan `files` in order and report their combined rank.
pub fn compute_rank<'a>(
    files: impl IntoIterator<Item = (&'a str, &'a dyn WeightStore)>,
    options: &RankOptions,
) -> RankReport {
    let mut report = RankReport::default();
    for (file, store) in files {
        let rank = file_rank(file, store, options, &mut report.files_requiring_full_merge);
        debug!(file, rank, "scanned adapter file");
        report.total_rank += rank;
        report.file_ranks.push((file.to_string(), rank));
    }
    info!(
        total_rank = report.total_rank,
        full_merge_files = report.files_requiring_full_merge.len(),
        "computed adapter rank"
    );
    report
}

/// [`compute_rank`] over paths resolved through `opener`.
pub fn compute_rank_for_paths(
    paths: &[String],
    opener: &dyn StoreOpener,
    options: &RankOptions,
) -> Result<RankReport> {
    let stores = paths
        .iter()
        .map(|p| opener.open(p).map(|s| (p.as_str(), s)))
        .collect::<Result<Vec<_>>>()?;
    Ok(compute_rank(stores.iter().map(|(p, s)| (*p, s.as_ref() as &dyn WeightStore)), options))
}

impl AdapterSession {
    /// Rank report over this session's adapters.
    pub fn rank(&self, options: &RankOptions) -> RankReport {
        compute_rank(self.files(), options)
    }
}

/// Module identifiers touched by `files`.
///
/// In `model_file` only `__up__`/`__down__` keys are counted, since its other
/// keys are base weights rather than adapter modules.
pub fn module_keys<'a>(
    files: impl IntoIterator<Item = (&'a str, &'a dyn WeightStore)>,
    model_file: Option<&str>,
    prefix: &str,
) -> BTreeSet<String> {
    let mut modules = BTreeSet::new();
    for (file, store) in files {
        let is_model_file = model_file == Some(file);
        for key in store.keys() {
            if !key.starts_with(prefix) {
                continue;
            }
            if is_model_file && !(key.ends_with(UP_SUFFIX) || key.ends_with(DOWN_SUFFIX)) {
                continue;
            }
            if let Some(id) = module_id(&key) {
                modules.insert(id.to_string());
            }
        }
    }
    modules
}
