//! Fused low-rank path: concatenate every adapter's factors along the rank
//! axis instead of merging them into the base weight.
//!
//! For a weight `w`, down factors are scaled by `sqrt(|w|)` and up factors by
//! `sign(w) * sqrt(|w|)`, so `up @ down` over the concatenation equals the
//! weighted sum of the individual products.

use std::collections::BTreeSet;
use std::ops::Range;

use candle_core::Tensor;
use tracing::{debug, warn};
use weightpatch_common::Result;

use crate::engine::{IndexMapping, MergeEngine};
use crate::names::{FactorKey, FactorSide, MID_SUFFIX};
use crate::reconcile::contract_mid;
use crate::resolution::{ParameterTarget, Resolution};
use crate::session::{AdapterSession, SessionAdapter};

/// Layout of the fused output and where its rank axis sits.
#[derive(Debug, Clone, Copy)]
struct Layout {
    grouped: bool,
    side: FactorSide,
}

impl Layout {
    fn rank_axis(self) -> usize {
        match (self.grouped, self.side) {
            (false, FactorSide::Up) => 1,
            (false, FactorSide::Down) => 0,
            (true, FactorSide::Up) => 2,
            (true, FactorSide::Down) => 1,
        }
    }

    /// Collapse trailing axes: `[d0, rest]`, or `[d0, d1, rest]` when grouped.
    fn collapse(self, dims: &[usize]) -> Option<Vec<usize>> {
        if self.grouped {
            match dims {
                [d0, d1, rest @ ..] => Some(vec![*d0, *d1, rest.iter().product()]),
                _ => None,
            }
        } else {
            match dims {
                [d0, rest @ ..] => Some(vec![*d0, rest.iter().product()]),
                [] => None,
            }
        }
    }
}

/// `sqrt(|w|)` for down, with the sign of `w` carried by up.
fn factor_scale(weight: f32, side: FactorSide) -> f64 {
    if weight == 1.0 {
        return 1.0;
    }
    let magnitude = f64::from(weight.abs()).sqrt();
    match side {
        FactorSide::Up if weight < 0.0 => -magnitude,
        _ => magnitude,
    }
}

impl MergeEngine {
    /// Build the fused factor named `name` from every adapter in `session`.
    ///
    /// The target's rank axis is expected to hold the summed rank of the
    /// contributing adapters. Files in `required` are merged densely
    /// elsewhere and skipped here. An unparsable name or an index missing
    /// from `mapping` yields an all-zero factor.
    pub fn resolve_factor(
        &self,
        name: &str,
        target: &ParameterTarget,
        mapping: &IndexMapping,
        session: &AdapterSession,
        required: Option<&BTreeSet<String>>,
    ) -> Result<Resolution> {
        let grouped = target.shape.len() == 3;
        let side = FactorKey::parse(name).map_or(FactorSide::Down, |k| k.side);
        let layout = Layout { grouped, side };
        let Some(out_dims) = layout.collapse(&target.shape) else {
            return Ok(Resolution::Fallthrough);
        };
        let mut out = Tensor::zeros(out_dims.as_slice(), self.working, &candle_core::Device::Cpu)?;

        let Some((key, original)) =
            FactorKey::parse(name).and_then(|k| mapping.get(&k.index).map(|&orig| (k, orig)))
        else {
            debug!(key = %name, "no module mapping for factor, leaving it zero");
            return self.finish(out.reshape(target.shape.as_slice())?, target);
        };
        let module = key.original_key(original);

        let mut offset = 0;
        for adapter in session.adapters() {
            if required.is_some_and(|files| files.contains(&adapter.path)) {
                continue;
            }
            let factor_key = format!("{module}{}", key.side.suffix());
            let Some(loaded) = self.read_adapter(&adapter.path, adapter.store.as_ref(), &factor_key) else {
                continue;
            };
            let Some(dims) = layout.collapse(loaded.dims()) else {
                warn!(file = %adapter.path, key = %factor_key, dims = ?loaded.dims(), "factor has too few axes");
                continue;
            };
            let factor = match self.fold_mid(&loaded.reshape(dims)?, &module, adapter, layout) {
                Ok(factor) => factor,
                Err(e) => {
                    warn!(file = %adapter.path, key = %factor_key, error = %e, "could not fold mid factor");
                    continue;
                }
            };
            let start = offset;
            let rank = factor.dims()[layout.rank_axis()];
            offset += rank;

            match self.place_factor(&out, factor, adapter.blend_weight, layout, start) {
                Ok(Some(placed)) => out = placed,
                Ok(None) => {
                    warn!(file = %adapter.path, key = %factor_key, start, rank, "rank axis full, factor dropped");
                }
                Err(e) => {
                    warn!(file = %adapter.path, key = %factor_key, error = %e, "could not place factor");
                }
            }
        }
        debug!(key = %name, module = %module, rank = offset, "concatenated factors");
        self.finish(out.reshape(target.shape.as_slice())?, target)
    }

    /// Contract a `mid` bottleneck into a plain down factor, if the adapter
    /// has one for `module`.
    fn fold_mid(&self, factor: &Tensor, module: &str, adapter: &SessionAdapter, layout: Layout) -> Result<Tensor> {
        if layout.side != FactorSide::Down || layout.grouped {
            return Ok(factor.clone());
        }
        let mid_key = format!("{module}{MID_SUFFIX}");
        match self.read_adapter(&adapter.path, adapter.store.as_ref(), &mid_key) {
            Some(mid) => Ok(contract_mid(factor, &mid)?),
            None => Ok(factor.clone()),
        }
    }

    /// Copy one adapter's factor into `out` at rank offset `start`.
    ///
    /// Every axis is clamped to the smaller of the two extents, the rank
    /// axis to what is left after `start`.
    fn place_factor(
        &self,
        out: &Tensor,
        mut factor: Tensor,
        blend_weight: f32,
        layout: Layout,
        start: usize,
    ) -> Result<Option<Tensor>> {
        let axis = layout.rank_axis();
        let capacity = out.dims()[axis];
        if start >= capacity {
            return Ok(None);
        }

        let factor_dims = factor.dims().to_vec();
        let mut ranges: Vec<Range<usize>> = Vec::with_capacity(out.rank());
        for (i, (&want, have)) in out.dims().iter().zip(factor_dims).enumerate() {
            let (offset, keep) = if i == axis { (start, have.min(capacity - start)) } else { (0, want.min(have)) };
            factor = factor.narrow(i, 0, keep)?;
            ranges.push(offset..offset + keep);
        }

        let scale = factor_scale(blend_weight, layout.side);
        if scale != 1.0 {
            factor = factor.affine(scale, 0.0)?;
        }
        Ok(Some(out.slice_assign(&ranges, &factor.contiguous()?)?))
    }
}
