//! Shape reconciliation between stored tensors and the shapes a model expects.
//!
//! Checkpoints of the same architecture can differ in channel count (an
//! inpainting variant carries extra input channels, for instance). Values are
//! never stretched: the overlapping range is copied and the rest is zero.

use std::ops::Range;

use candle_core::{Result, Tensor};

/// `[d0, rest]` view dims of a shape. Scalars view as `[1, 1]`.
pub(crate) fn matrix_dims(dims: &[usize]) -> (usize, usize) {
    match dims.split_first() {
        Some((d0, rest)) => (*d0, rest.iter().product()),
        None => (1, 1),
    }
}

/// Reshape to the `[d0, rest]` matrix view.
pub fn as_matrix(tensor: &Tensor) -> Result<Tensor> {
    tensor.reshape(matrix_dims(tensor.dims()))
}

/// Copy the overlap of `src` into a zero tensor of `target` dims.
fn copy_overlap(src: &Tensor, target: &[usize]) -> Result<Tensor> {
    let mut overlap = src.clone();
    let mut ranges: Vec<Range<usize>> = Vec::with_capacity(target.len());
    for (axis, (&have, &want)) in src.dims().iter().zip(target).enumerate() {
        let keep = have.min(want);
        overlap = overlap.narrow(axis, 0, keep)?;
        ranges.push(0..keep);
    }
    let out = Tensor::zeros(target, src.dtype(), src.device())?;
    out.slice_assign(&ranges, &overlap.contiguous()?)
}

/// Bring `tensor` to `target` dims.
///
/// Same dims: unchanged. Same element count: reshaped. Otherwise the overlap
/// along every axis is copied into a zero tensor; tensors of different rank
/// are compared through their `[d0, rest]` views.
pub fn reconcile_to_shape(tensor: &Tensor, target: &[usize]) -> Result<Tensor> {
    if tensor.dims() == target {
        return Ok(tensor.clone());
    }
    if tensor.elem_count() == target.iter().product::<usize>() {
        return tensor.reshape(target);
    }
    if tensor.rank() == target.len() {
        return copy_overlap(tensor, target);
    }
    let (t0, trest) = matrix_dims(target);
    copy_overlap(&as_matrix(tensor)?, &[t0, trest])?.reshape(target)
}

/// `base + weight * delta`, adding into the overlapping channel range when
/// the element counts differ.
///
/// A mismatched delta is viewed as `[d0, c, rest]` with `d0` and `rest` taken
/// from `base`; only the first `min(c, base[1])` channels are added. Returns
/// `Ok(None)` when the delta cannot be laid out against `base` that way.
pub fn add_scaled(base: &Tensor, delta: &Tensor, weight: f64) -> Result<Option<Tensor>> {
    let delta = delta.to_dtype(base.dtype())?;
    if delta.elem_count() == base.elem_count() {
        let delta = delta.reshape(base.dims())?.affine(weight, 0.0)?;
        return base.add(&delta).map(Some);
    }
    let dims = base.dims();
    if dims.len() < 2 {
        return Ok(None);
    }
    let (d0, d1) = (dims[0], dims[1]);
    let rest: usize = dims[2..].iter().product();
    let per_channel = d0 * rest;
    if per_channel == 0 || delta.elem_count() % per_channel != 0 {
        return Ok(None);
    }
    let channels = delta.elem_count() / per_channel;
    let keep = channels.min(d1);

    let base3 = base.reshape((d0, d1, rest))?;
    let delta3 = delta.reshape((d0, channels, rest))?.narrow(1, 0, keep)?;
    let region = base3.narrow(1, 0, keep)?.add(&delta3.affine(weight, 0.0)?)?;
    let merged = base3.slice_assign(&[0..d0, 0..keep, 0..rest], &region.contiguous()?)?;
    merged.reshape(dims).map(Some)
}

/// Fold a `mid` bottleneck into a down factor.
///
/// `down` is `[r1, in]` and `mid` is `[r0, r1, s...]`; the result is
/// `[r0, in * prod(s)]` with `out[a, i, s] = sum_b mid[a, b, s] * down[b, i]`.
pub fn contract_mid(down: &Tensor, mid: &Tensor) -> Result<Tensor> {
    let down = as_matrix(down)?;
    let (r1, input) = down.dims2()?;
    let mid_dims = mid.dims();
    if mid_dims.len() < 2 || mid_dims[1] != r1 {
        candle_core::bail!("mid factor {mid_dims:?} does not match down factor [{r1}, {input}]");
    }
    let r0 = mid_dims[0];
    let spatial: usize = mid_dims[2..].iter().product();

    let mid_t = mid.transpose(0, 1)?.contiguous()?.reshape((r1, r0 * spatial))?;
    let product = down.t()?.contiguous()?.matmul(&mid_t)?;
    product
        .reshape((input, r0, spatial))?
        .transpose(0, 1)?
        .contiguous()?
        .reshape((r0, input * spatial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn arange(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::arange(0f32, n as f32, &Device::Cpu).unwrap().reshape(shape).unwrap()
    }

    // -- reconcile_to_shape --

    #[test]
    fn same_shape_is_unchanged() {
        let t = arange(&[2, 3]);
        let r = reconcile_to_shape(&t, &[2, 3]).unwrap();
        assert_eq!(r.to_vec2::<f32>().unwrap(), t.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn same_count_is_reshaped() {
        let r = reconcile_to_shape(&arange(&[2, 3]), &[3, 2]).unwrap();
        assert_eq!(r.dims(), &[3, 2]);
        assert_eq!(r.to_vec2::<f32>().unwrap(), vec![vec![0., 1.], vec![2., 3.], vec![4., 5.]]);
    }

    #[test]
    fn widening_zero_fills() {
        let r = reconcile_to_shape(&arange(&[2, 2]), &[2, 3]).unwrap();
        assert_eq!(r.to_vec2::<f32>().unwrap(), vec![vec![0., 1., 0.], vec![2., 3., 0.]]);
    }

    #[test]
    fn narrowing_truncates() {
        let r = reconcile_to_shape(&arange(&[2, 4]), &[2, 3]).unwrap();
        assert_eq!(r.to_vec2::<f32>().unwrap(), vec![vec![0., 1., 2.], vec![4., 5., 6.]]);
    }

    #[test]
    fn conv_input_channels_widen() {
        // 4 input channels to 9, 1x1 kernel
        let r = reconcile_to_shape(&arange(&[2, 4, 1, 1]), &[2, 9, 1, 1]).unwrap();
        let flat = r.flatten_from(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(flat[0], vec![0., 1., 2., 3., 0., 0., 0., 0., 0.]);
        assert_eq!(flat[1], vec![4., 5., 6., 7., 0., 0., 0., 0., 0.]);
    }

    #[test]
    fn different_rank_uses_matrix_view() {
        let r = reconcile_to_shape(&arange(&[2, 2, 2]), &[2, 6]).unwrap();
        assert_eq!(r.to_vec2::<f32>().unwrap(), vec![vec![0., 1., 2., 3., 0., 0.], vec![4., 5., 6., 7., 0., 0.]]);
    }

    // -- add_scaled --

    #[test]
    fn add_same_count_scales() {
        let base = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        let r = add_scaled(&base, &arange(&[4]), -0.5).unwrap().unwrap();
        assert_eq!(r.to_vec2::<f32>().unwrap(), vec![vec![1., 0.5], vec![0., -0.5]]);
    }

    #[test]
    fn add_narrow_delta_into_leading_channels() {
        let base = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let r = add_scaled(&base, &arange(&[2, 2]), 1.0).unwrap().unwrap();
        assert_eq!(r.to_vec2::<f32>().unwrap(), vec![vec![0., 1., 0.], vec![2., 3., 0.]]);
    }

    #[test]
    fn add_wide_delta_keeps_overlap() {
        let base = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let r = add_scaled(&base, &arange(&[2, 3]), 2.0).unwrap().unwrap();
        assert_eq!(r.to_vec2::<f32>().unwrap(), vec![vec![0., 2.], vec![6., 8.]]);
    }

    #[test]
    fn add_indivisible_delta_is_rejected() {
        let base = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(add_scaled(&base, &arange(&[5]), 1.0).unwrap().is_none());
    }

    // -- contract_mid --

    #[test]
    fn contract_mid_matches_einsum() {
        let down = arange(&[2, 3]); // r1 = 2, in = 3
        let mid = arange(&[2, 2, 2]); // r0 = 2, r1 = 2, s = 2
        let out = contract_mid(&down, &mid).unwrap();
        assert_eq!(out.dims(), &[2, 6]);

        let d = down.to_vec2::<f32>().unwrap();
        let m = mid.to_vec3::<f32>().unwrap();
        let got = out.reshape((2, 3, 2)).unwrap().to_vec3::<f32>().unwrap();
        for a in 0..2 {
            for i in 0..3 {
                for s in 0..2 {
                    let want: f32 = (0..2).map(|b| m[a][b][s] * d[b][i]).sum();
                    assert!((got[a][i][s] - want).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn contract_mid_rejects_mismatched_rank() {
        assert!(contract_mid(&arange(&[3, 4]), &arange(&[2, 2, 1, 1])).is_err());
    }
}
