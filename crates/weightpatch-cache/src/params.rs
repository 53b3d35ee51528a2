//! Live parameter storage the cache detaches into and attaches from.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use weightpatch_common::Result;

/// Ordered `(key, tensor)` pairs making up one weight set.
pub type WeightSet = Vec<(String, Tensor)>;

/// A model's live parameters, as seen by the weight cache.
pub trait LiveParameters {
    /// Total byte size of every parameter currently held.
    fn byte_size(&self) -> u64;

    /// Move all tensors out, leaving the parameters empty.
    fn take_weights(&mut self) -> WeightSet;

    /// Deep copies of all tensors on `device`.
    fn copy_weights(&self, device: &Device) -> Result<WeightSet>;

    /// Install `weights` by move.
    fn attach_consuming(&mut self, weights: WeightSet);

    /// Install copies of `weights` on the parameters' own device.
    fn attach_from(&mut self, weights: &[(String, Tensor)]) -> Result<()>;
}

/// Name-keyed parameter storage on a single device.
#[derive(Debug, Clone)]
pub struct ParameterMap {
    device: Device,
    tensors: BTreeMap<String, Tensor>,
}

impl Default for ParameterMap {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

impl ParameterMap {
    pub fn new(device: Device) -> Self {
        Self { device, tensors: BTreeMap::new() }
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(key.into(), tensor);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }
}

impl FromIterator<(String, Tensor)> for ParameterMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self { device: Device::Cpu, tensors: iter.into_iter().collect() }
    }
}

impl LiveParameters for ParameterMap {
    fn byte_size(&self) -> u64 {
        self.tensors
            .values()
            .map(|t| (t.elem_count() * t.dtype().size_in_bytes()) as u64)
            .sum()
    }

    fn take_weights(&mut self) -> WeightSet {
        std::mem::take(&mut self.tensors).into_iter().collect()
    }

    fn copy_weights(&self, device: &Device) -> Result<WeightSet> {
        self.tensors
            .iter()
            .map(|(k, t)| -> Result<(String, Tensor)> { Ok((k.clone(), t.to_device(device)?.copy()?)) })
            .collect()
    }

    fn attach_consuming(&mut self, weights: WeightSet) {
        self.tensors.extend(weights);
    }

    fn attach_from(&mut self, weights: &[(String, Tensor)]) -> Result<()> {
        for (key, tensor) in weights {
            let copy = tensor.to_device(&self.device)?.copy()?;
            self.tensors.insert(key.clone(), copy);
        }
        Ok(())
    }
}
