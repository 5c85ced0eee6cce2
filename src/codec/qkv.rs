//! Combined-QKV packing.
//!
//! The combined layout interleaves head groups along the packed axis:
//! Q0,K0,V0,Q1,K1,V1,… rather than all-Q,all-K,all-V. For head group `g`
//! with `h = d_model / n_heads` columns per head, the packed columns are
//! `[3g·h, (3g+1)·h)` = Q group g, `[(3g+1)·h, (3g+2)·h)` = K group g,
//! `[(3g+2)·h, (3g+3)·h)` = V group g. This is a bit-exact contract: it is
//! what makes a head-group split of the combined tensor land the same Q/K/V
//! rows on a shard as a head split of the three separate tensors would.
//!
//! Weights pack along axis 1 (`(d_model, d_model)` each → `(d_model,
//! 3·d_model)`), biases along axis 0 (`(d_model,)` each → `(3·d_model,)`).

use candle_core::Tensor;

use crate::MeshCkptError;

fn head_extent(tensor: &Tensor, n_heads: usize, axis: usize) -> crate::Result<usize> {
    let dims = tensor.dims();
    let extent = *dims.get(axis).ok_or_else(|| {
        MeshCkptError::ConfigError(format!(
            "qkv pack axis {} out of range for shape {:?}",
            axis, dims
        ))
    })?;
    if n_heads == 0 || extent % n_heads != 0 {
        return Err(MeshCkptError::ConfigError(format!(
            "qkv extent {} not divisible into {} heads",
            extent, n_heads
        )));
    }
    Ok(extent / n_heads)
}

/// Pack separate Q/K/V parameters into the interleaved combined layout.
pub fn pack_qkv(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    n_heads: usize,
    axis: usize,
) -> crate::Result<Tensor> {
    if q.dims() != k.dims() || q.dims() != v.dims() {
        return Err(MeshCkptError::shape_mismatch(
            "attn.qkv_proj",
            q.dims(),
            if q.dims() != k.dims() { k.dims() } else { v.dims() },
        ));
    }
    let d_head = head_extent(q, n_heads, axis)?;

    let mut groups = Vec::with_capacity(n_heads * 3);
    for g in 0..n_heads {
        for part in [q, k, v] {
            groups.push(part.narrow(axis, g * d_head, d_head)?);
        }
    }
    Ok(Tensor::cat(&groups, axis)?)
}

/// Unpack the interleaved combined layout back into separate Q/K/V.
/// Exact inverse of [`pack_qkv`].
pub fn unpack_qkv(
    combined: &Tensor,
    n_heads: usize,
    axis: usize,
) -> crate::Result<(Tensor, Tensor, Tensor)> {
    let group = head_extent(combined, n_heads, axis)?;
    if group % 3 != 0 {
        return Err(MeshCkptError::ConfigError(format!(
            "combined qkv head group of {} columns is not 3-way divisible",
            group
        )));
    }
    let d_head = group / 3;

    let mut qs = Vec::with_capacity(n_heads);
    let mut ks = Vec::with_capacity(n_heads);
    let mut vs = Vec::with_capacity(n_heads);
    for g in 0..n_heads {
        let base = g * group;
        qs.push(combined.narrow(axis, base, d_head)?);
        ks.push(combined.narrow(axis, base + d_head, d_head)?);
        vs.push(combined.narrow(axis, base + 2 * d_head, d_head)?);
    }
    Ok((
        Tensor::cat(&qs, axis)?,
        Tensor::cat(&ks, axis)?,
        Tensor::cat(&vs, axis)?,
    ))
}
