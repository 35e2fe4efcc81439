//! Static argument checks run before anything is enqueued.

use std::collections::HashSet;
use std::slice;

use super::tensor::DenseTensor;
use crate::utils::error::{Result, XcclError};

pub fn check_tensors_in_custom_place(tensors: &[DenseTensor], device_type: &str) -> bool {
    tensors
        .iter()
        .all(|t| t.place().device_type() == device_type)
}

/// Tensors must be non-empty, on `device_type`, on distinct devices and no
/// more of them than there are devices.
pub fn check_tensors_in_different_devices(
    tensors: &[DenseTensor],
    num_devices: usize,
    device_type: &str,
) -> Result<()> {
    if tensors.is_empty() {
        return Err(XcclError::InvalidArgument(
            "Tensor list must be nonempty.".to_string(),
        ));
    }
    if tensors.len() > num_devices {
        return Err(XcclError::InvalidArgument(format!(
            "Tensor list mustn't be larger than the number of available devices ({}).",
            num_devices
        )));
    }
    let mut used = HashSet::with_capacity(tensors.len());
    for tensor in tensors {
        if tensor.place().device_type() != device_type {
            return Err(XcclError::PreconditionNotMet(format!(
                "Tensors must be {} tensors, got one on {}",
                device_type,
                tensor.place()
            )));
        }
        if !used.insert(tensor.place().clone()) {
            return Err(XcclError::InvalidArgument(
                "Tensors must be on distinct devices.".to_string(),
            ));
        }
    }
    Ok(())
}

fn check_rank(rank: usize, world_size: usize, what: &str) -> Result<()> {
    if rank >= world_size {
        return Err(XcclError::InvalidArgument(format!(
            "{} {} is outside of a group of {}",
            what, rank, world_size
        )));
    }
    Ok(())
}

fn check_place(tensor: &DenseTensor, device_type: &str) -> Result<()> {
    if !check_tensors_in_custom_place(slice::from_ref(tensor), device_type) {
        return Err(XcclError::PreconditionNotMet(format!(
            "Expected a {} tensor, got one on {}",
            device_type,
            tensor.place()
        )));
    }
    Ok(())
}

fn check_dtype(out: &DenseTensor, input: &DenseTensor) -> Result<()> {
    if out.dtype() != input.dtype() {
        return Err(XcclError::InvalidArgument(format!(
            "Input is {:?} but output is {:?}",
            input.dtype(),
            out.dtype()
        )));
    }
    Ok(())
}

/// Single-tensor operations (send, recv).
pub fn check_shape(
    tensor: &DenseTensor,
    rank: usize,
    world_size: usize,
    device_type: &str,
) -> Result<()> {
    check_rank(rank, world_size, "Rank")?;
    check_place(tensor, device_type)?;
    if tensor.numel() == 0 {
        return Err(XcclError::InvalidArgument(
            "Tensor must hold at least one element".to_string(),
        ));
    }
    Ok(())
}

/// Operations whose output mirrors the input (all-reduce, broadcast, reduce).
pub fn same_shape(
    out: &DenseTensor,
    input: &DenseTensor,
    dst_rank: usize,
    cur_rank: usize,
    world_size: usize,
    device_type: &str,
) -> Result<()> {
    check_rank(dst_rank, world_size, "Destination rank")?;
    check_rank(cur_rank, world_size, "Rank")?;
    check_place(out, device_type)?;
    check_place(input, device_type)?;
    check_dtype(out, input)?;
    if out.numel() != input.numel() {
        return Err(XcclError::InvalidArgument(format!(
            "Input has {} elements but output has {}",
            input.numel(),
            out.numel()
        )));
    }
    Ok(())
}

/// Gather-like operations: the output holds one input per participant.
pub fn gather_like_shape(
    out: &DenseTensor,
    input: &DenseTensor,
    participants: usize,
    cur_rank: usize,
    world_size: usize,
    device_type: &str,
) -> Result<()> {
    check_rank(cur_rank, world_size, "Rank")?;
    check_place(out, device_type)?;
    check_place(input, device_type)?;
    check_dtype(out, input)?;
    if out.numel() != input.numel() * participants {
        return Err(XcclError::InvalidArgument(format!(
            "Output of {} elements cannot hold {} x {} gathered elements",
            out.numel(),
            participants,
            input.numel()
        )));
    }
    Ok(())
}
