//! Shared predicates for adapter key naming conventions.
//!
//! Keys are bracket-namespaced, e.g. `__unet__[t-12-0]` for a model weight,
//! `__unet__[t-12-0]__up__` for a standard low-rank factor, or
//! `__dit__[t-lora_down-3-0]` for a fused low-rank factor. Everything here is
//! pure string inspection; unrecognized keys are left alone by callers.

use std::fmt;

/// Marker inside fused low-rank down-factor keys.
pub const LORA_DOWN_MARKER: &str = "-lora_down-";
/// Marker inside fused low-rank up-factor keys.
pub const LORA_UP_MARKER: &str = "-lora_up-";

pub const UP_SUFFIX: &str = "__up__";
pub const DOWN_SUFFIX: &str = "__down__";
pub const MID_SUFFIX: &str = "__mid__";
pub const W1_A_SUFFIX: &str = "__w1_a__";
pub const W1_B_SUFFIX: &str = "__w1_b__";
pub const W2_A_SUFFIX: &str = "__w2_a__";
pub const W2_B_SUFFIX: &str = "__w2_b__";

/// Whether `key` names a low-rank network tensor in either naming style.
///
/// ```
/// use weightpatch_merge::names::is_low_rank_key;
///
/// assert!(is_low_rank_key("__dit__[t-lora_down-0-0]"));
/// assert!(is_low_rank_key("__unet__[t-4-0]__up__"));
/// assert!(!is_low_rank_key("__dit__[t-x-0]"));
/// ```
pub fn is_low_rank_key(key: &str) -> bool {
    key.contains(LORA_DOWN_MARKER)
        || key.contains(LORA_UP_MARKER)
        || (key.starts_with("__") && key.ends_with("__"))
}

/// Whether `key` carries a rank dimension the rank resolver reads.
///
/// Only down factors are measured; up factors repeat the same rank.
pub fn is_rank_key(key: &str) -> bool {
    key.contains(LORA_DOWN_MARKER)
        || (key.starts_with("__") && key.ends_with(DOWN_SUFFIX))
}

/// Whether `key` looks like a bare model weight (`__ns__[...]` without a
/// trailing factor suffix). Such a key in an adapter file is a full delta.
///
/// ```
/// use weightpatch_merge::names::is_model_weight_key;
///
/// assert!(is_model_weight_key("__dit__[t-x-0]"));
/// assert!(!is_model_weight_key("__dit__[t-x-0]__down__"));
/// assert!(!is_model_weight_key("__dit__[t-lora_up-0-0]"));
/// assert!(!is_model_weight_key("model.bias"));
/// ```
pub fn is_model_weight_key(key: &str) -> bool {
    key.starts_with("__") && !is_low_rank_key(key)
}

/// Whether a parameter name addresses a fused low-rank factor.
pub fn is_fused_factor_name(name: &str) -> bool {
    name.contains("lora_up") || name.contains("lora_down")
}

/// Module identifier of a key: the first bracket component with its `t-`
/// marker removed. `__unet__[t-12-0]__up__` yields `12-0`.
pub fn module_id(key: &str) -> Option<&str> {
    let mut components = key.split(['[', ']']);
    components.next()?;
    components.next()?.strip_prefix("t-")
}

/// Which half of a low-rank pair a fused factor name addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactorSide {
    Up,
    Down,
}

impl FactorSide {
    /// Suffix of the standard-style key holding this side.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Up => UP_SUFFIX,
            Self::Down => DOWN_SUFFIX,
        }
    }
}

impl fmt::Display for FactorSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A parsed fused low-rank factor name such as `__dit__[t-attn_lora_up-7-0]`.
///
/// Components are split on `-`: the namespace (`__dit__[t`), the infix with
/// its `lora_up`/`lora_down` marker, and the layer index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorKey {
    pub namespace: String,
    pub infix: String,
    pub side: FactorSide,
    pub index: usize,
}

impl FactorKey {
    /// Parse `name`, returning `None` when it is not a fused factor name or
    /// its layer index is not numeric.
    ///
    /// ```
    /// use weightpatch_merge::names::{FactorKey, FactorSide};
    ///
    /// let key = FactorKey::parse("__dit__[t-lora_up-7-0]").unwrap();
    /// assert_eq!(key.side, FactorSide::Up);
    /// assert_eq!(key.index, 7);
    /// assert_eq!(key.original_key(2), "__dit__[t-2-0]");
    /// ```
    pub fn parse(name: &str) -> Option<Self> {
        let side = if name.contains("lora_up") {
            FactorSide::Up
        } else if name.contains("lora_down") {
            FactorSide::Down
        } else {
            return None;
        };
        let components: Vec<&str> = name.split('-').collect();
        if components.len() < 3 {
            return None;
        }
        let index = components[2].parse::<usize>().ok()?;
        let infix = components[1].replace("lora_up", "").replace("lora_down", "");
        let infix = infix.strip_suffix('_').unwrap_or(&infix).to_string();
        Some(Self { namespace: components[0].to_string(), infix, side, index })
    }

    /// Key prefix of the unfused module this factor came from, at `index`.
    pub fn original_key(&self, index: usize) -> String {
        if self.infix.is_empty() {
            format!("{}-{index}-0]", self.namespace)
        } else {
            format!("{}-{}-{index}-0]", self.namespace, self.infix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_key_predicates() {
        assert!(is_rank_key("__dit__[t-lora_down-0-0]"));
        assert!(is_rank_key("__unet__[t-3-0]__down__"));
        assert!(!is_rank_key("__unet__[t-3-0]__up__"));
        assert!(!is_rank_key("__dit__[t-lora_up-0-0]"));
        // legacy suffix requires the namespace prefix too
        assert!(!is_rank_key("x__down__"));
    }

    #[test]
    fn test_model_weight_predicates() {
        assert!(is_model_weight_key("__dit__[t-x-0]"));
        assert!(is_model_weight_key("__te2__[t-token_embedding-0-0]"));
        assert!(!is_model_weight_key("__unet__[t-3-0]__mid__"));
        assert!(!is_model_weight_key("__dit__[t-lora_down-0-0]"));
        assert!(!is_model_weight_key("plain_key"));
    }

    #[test]
    fn test_module_id() {
        assert_eq!(module_id("__unet__[t-12-0]__up__"), Some("12-0"));
        assert_eq!(module_id("__dit__[t-lora_down-3-0]"), Some("lora_down-3-0"));
        assert_eq!(module_id("__unet__[x-12-0]"), None);
        assert_eq!(module_id("no_brackets"), None);
    }

    #[test]
    fn test_factor_key_with_infix() {
        let key = FactorKey::parse("__dit__[t-attn_lora_down-4-0]").unwrap();
        assert_eq!(key.namespace, "__dit__[t");
        assert_eq!(key.infix, "attn");
        assert_eq!(key.side, FactorSide::Down);
        assert_eq!(key.index, 4);
        assert_eq!(key.original_key(9), "__dit__[t-attn-9-0]");
        assert_eq!(format!("{}{}", key.original_key(9), key.side.suffix()), "__dit__[t-attn-9-0]__down__");
    }

    #[test]
    fn test_factor_key_rejects_malformed() {
        assert!(FactorKey::parse("__dit__[t-x-0]").is_none());
        assert!(FactorKey::parse("__dit__[t-lora_up]").is_none());
        assert!(FactorKey::parse("__dit__[t-lora_up-x-0]").is_none());
    }

    #[test]
    fn test_fused_factor_names() {
        assert!(is_fused_factor_name("__dit__[t-lora_up-0-0]"));
        assert!(is_fused_factor_name("__dit__[t-lora_down-0-0]"));
        assert!(!is_fused_factor_name("__dit__[t-x-0]"));
    }
}
