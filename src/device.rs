//! Device selection, precision policy and the per-device lease

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use log::info;
use std::collections::HashMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex, MutexGuard};

static CUDA_DEVICES: Lazy<Mutex<HashMap<usize, Device>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// One handle per CUDA ordinal; candle hands out a fresh id for every
/// `Device::new_cuda`, which breaks tensor ops across separately created handles.
fn cached_cuda_device(ordinal: usize) -> Result<Device> {
    cached_device(&CUDA_DEVICES, ordinal, |n| {
        Device::new_cuda(n).with_context(|| format!("Failed to open cuda:{}", n))
    })
}

fn cached_device(
    cache: &Mutex<HashMap<usize, Device>>,
    ordinal: usize,
    open: impl FnOnce(usize) -> Result<Device>,
) -> Result<Device> {
    let mut devices = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(device) = devices.get(&ordinal) {
        return Ok(device.clone());
    }
    let device = open(ordinal)?;
    devices.insert(ordinal, device.clone());
    Ok(device)
}

/// Resolve `auto | cpu | cuda[:N] | metal`
pub fn select_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    let device = match spec.as_str() {
        "" | "auto" => {
            if candle_core::utils::cuda_is_available() {
                cached_cuda_device(0)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0).context("Failed to open metal device")?
            } else {
                Device::Cpu
            }
        }
        "cpu" => Device::Cpu,
        "cuda" | "gpu" => cached_cuda_device(0)?,
        "metal" | "mps" => Device::new_metal(0).context("Failed to open metal device")?,
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .with_context(|| format!("Invalid cuda ordinal in '{}'", other))?;
                cached_cuda_device(ordinal)?
            }
            None => bail!("Unknown device '{}', expected auto|cpu|cuda[:N]|metal", other),
        },
    };
    info!("Using device: {:?}", device);
    Ok(device)
}

/// Arithmetic precision for a device. The VAE ignores this and always runs in F32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    pub compute: DType,
    pub vae: DType,
}

impl Precision {
    pub fn for_device(device: &Device) -> Self {
        let compute = match device {
            Device::Cpu => DType::F32,
            Device::Cuda(_) | Device::Metal(_) => DType::F16,
        };
        Self {
            compute,
            vae: DType::F32,
        }
    }

    pub fn is_mixed(&self) -> bool {
        self.compute != DType::F32
    }
}

/// Serialises heavy model work on one device across inference and training
#[derive(Debug, Clone, Default)]
pub struct DeviceLease {
    inner: Arc<Mutex<()>>,
}

impl DeviceLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the device is free. A panicked holder does not poison the lease.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(&self) -> Option<MutexGuard<'_, ()>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_selection_and_precision() -> Result<()> {
        let device = select_device("cpu")?;
        assert!(matches!(device, Device::Cpu));
        let precision = Precision::for_device(&device);
        assert_eq!(precision.compute, DType::F32);
        assert_eq!(precision.vae, DType::F32);
        assert!(!precision.is_mixed());
        Ok(())
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        assert!(select_device("tpu").is_err());
        assert!(select_device("cuda:x").is_err());
    }

    #[test]
    fn test_device_cache_is_keyed_by_ordinal() -> Result<()> {
        let cache = Mutex::new(HashMap::new());
        let mut opened = Vec::new();
        for ordinal in [0, 1, 0, 1, 1] {
            cached_device(&cache, ordinal, |n| {
                opened.push(n);
                Ok(Device::Cpu)
            })?;
        }
        assert_eq!(opened, vec![0, 1]);
        assert!(cached_device(&cache, 2, |_| anyhow::bail!("no such device")).is_err());
        assert_eq!(cache.lock().unwrap().len(), 2);
        Ok(())
    }

    #[test]
    fn test_lease_is_exclusive() {
        let lease = DeviceLease::new();
        let other = lease.clone();
        let guard = lease.acquire();
        assert!(other.try_acquire().is_none());
        drop(guard);
        assert!(other.try_acquire().is_some());
    }
}
