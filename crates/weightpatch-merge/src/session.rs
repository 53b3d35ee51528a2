//! Adapter descriptors and the per-load session that owns their stores.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use weightpatch_common::Result;
use weightpatch_store::{StoreOpener, WeightStore};

/// How an adapter's delta is factored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decomposition {
    /// `up @ down`, optionally through a `mid` bottleneck.
    #[default]
    Standard,
    /// `(w1a @ w1b) * (w2a @ w2b)` elementwise.
    Hadamard,
}

/// Which model stage an adapter applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStage {
    #[default]
    All,
    Base,
    Refiner,
}

impl AdapterStage {
    /// Whether an adapter tagged `self` is loaded for `stage`.
    pub fn applies_to(self, stage: AdapterStage) -> bool {
        self == AdapterStage::All || stage == AdapterStage::All || self == stage
    }
}

impl fmt::Display for AdapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Base => write!(f, "base"),
            Self::Refiner => write!(f, "refiner"),
        }
    }
}

impl std::str::FromStr for AdapterStage {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "base" => Ok(Self::Base),
            "refiner" => Ok(Self::Refiner),
            other => Err(format!("unknown adapter stage: {other}")),
        }
    }
}

fn default_blend_weight() -> f32 {
    1.0
}

fn default_modifier() -> String {
    "none".to_string()
}

/// One adapter file and how to blend it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub store_path: String,
    /// May be negative or exceed 1.
    #[serde(default = "default_blend_weight")]
    pub blend_weight: f32,
    #[serde(default)]
    pub decomposition: Decomposition,
    /// Model architecture the adapter was trained against.
    pub architecture_tag: String,
    /// Conditioning variant (inpainting, depth, ...); opaque to merging.
    #[serde(default = "default_modifier")]
    pub modifier: String,
    #[serde(default)]
    pub stage: AdapterStage,
}

impl AdapterDescriptor {
    pub fn new(store_path: impl Into<String>, blend_weight: f32, architecture_tag: impl Into<String>) -> Self {
        Self {
            store_path: store_path.into(),
            blend_weight,
            decomposition: Decomposition::Standard,
            architecture_tag: architecture_tag.into(),
            modifier: default_modifier(),
            stage: AdapterStage::All,
        }
    }

    pub fn with_decomposition(mut self, decomposition: Decomposition) -> Self {
        self.decomposition = decomposition;
        self
    }

    pub fn with_stage(mut self, stage: AdapterStage) -> Self {
        self.stage = stage;
        self
    }

    /// Whether this adapter belongs in a session for `architecture` / `stage`.
    pub fn matches(&self, architecture: &str, stage: AdapterStage) -> bool {
        self.architecture_tag == architecture && self.stage.applies_to(stage)
    }
}

/// An opened adapter store with its blend parameters.
pub struct SessionAdapter {
    pub path: String,
    pub store: Arc<dyn WeightStore>,
    pub blend_weight: f32,
    pub decomposition: Decomposition,
    keys: BTreeSet<String>,
}

impl fmt::Debug for SessionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAdapter")
            .field("path", &self.path)
            .field("blend_weight", &self.blend_weight)
            .field("decomposition", &self.decomposition)
            .field("key_count", &self.keys.len())
            .finish()
    }
}

impl SessionAdapter {
    /// Exact key membership, answered from the key set captured at open.
    pub fn has_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Whether any key starts with `prefix`. Keys are ordered, so only the
    /// first key at or after `prefix` needs checking.
    pub fn has_key_with_prefix(&self, prefix: &str) -> bool {
        self.keys
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .next()
            .is_some_and(|k| k.starts_with(prefix))
    }
}

/// The adapters opened for one model load, in descriptor order.
///
/// Stores are only read. A session can be moved to another thread, and
/// separate sessions need no coordination.
#[derive(Debug, Default)]
pub struct AdapterSession {
    adapters: Vec<SessionAdapter>,
}

impl AdapterSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every descriptor that matches `architecture` and `stage`.
    pub fn open(
        descriptors: &[AdapterDescriptor],
        architecture: &str,
        stage: AdapterStage,
        opener: &dyn StoreOpener,
    ) -> Result<Self> {
        let mut session = Self::new();
        for descriptor in descriptors {
            if !descriptor.matches(architecture, stage) {
                debug!(
                    file = %descriptor.store_path,
                    tag = %descriptor.architecture_tag,
                    adapter_stage = %descriptor.stage,
                    "adapter does not apply to this load"
                );
                continue;
            }
            let store = opener.open(&descriptor.store_path)?;
            session.push(
                descriptor.store_path.clone(),
                store,
                descriptor.blend_weight,
                descriptor.decomposition,
            );
        }
        info!(architecture, %stage, adapters = session.len(), "opened adapter session");
        Ok(session)
    }

    /// Append an already-opened store.
    pub fn push(
        &mut self,
        path: impl Into<String>,
        store: Arc<dyn WeightStore>,
        blend_weight: f32,
        decomposition: Decomposition,
    ) {
        let keys = store.keys().into_iter().collect();
        self.adapters.push(SessionAdapter {
            path: path.into(),
            store,
            blend_weight,
            decomposition,
            keys,
        });
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(
        mut self,
        path: impl Into<String>,
        store: impl WeightStore + 'static,
        blend_weight: f32,
        decomposition: Decomposition,
    ) -> Self {
        self.push(path, Arc::new(store), blend_weight, decomposition);
        self
    }

    pub fn adapters(&self) -> &[SessionAdapter] {
        &self.adapters
    }

    /// Adapter paths with their stores, in session order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &dyn WeightStore)> {
        self.adapters.iter().map(|a| (a.path.as_str(), a.store.as_ref() as &dyn WeightStore))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
