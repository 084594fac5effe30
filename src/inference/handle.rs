use anyhow::{anyhow, Result};
use image::DynamicImage;
use log::info;
use once_cell::sync::OnceCell;
use std::sync::Mutex;
use std::time::Instant;

use super::{InferenceBackend, InferenceRequest};
use crate::device::DeviceLease;

type BackendFactory = Box<dyn Fn() -> Result<Box<dyn InferenceBackend>> + Send + Sync>;

/// Process-wide inference handle.
///
/// The backend is built on first use and then held for the life of the
/// handle. Calls are serialised through a mutex and the device lease, so at
/// most one render (or training run sharing the lease) touches the device.
pub struct SharedInference {
    backend: OnceCell<Mutex<Box<dyn InferenceBackend>>>,
    factory: BackendFactory,
    lease: DeviceLease,
}

impl SharedInference {
    pub fn new<F>(factory: F, lease: DeviceLease) -> Self
    where
        F: Fn() -> Result<Box<dyn InferenceBackend>> + Send + Sync + 'static,
    {
        Self {
            backend: OnceCell::new(),
            factory: Box::new(factory),
            lease,
        }
    }

    /// Wrap an already constructed backend
    pub fn with_backend(backend: Box<dyn InferenceBackend>, lease: DeviceLease) -> Self {
        Self {
            backend: OnceCell::with_value(Mutex::new(backend)),
            factory: Box::new(|| Err(anyhow!("inference backend was supplied preloaded"))),
            lease,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.get().is_some()
    }

    pub fn lease(&self) -> &DeviceLease {
        &self.lease
    }

    fn backend(&self) -> Result<&Mutex<Box<dyn InferenceBackend>>> {
        self.backend.get_or_try_init(|| {
            let start = Instant::now();
            let backend = (self.factory)()?;
            info!(
                "Loaded inference backend '{}' in {:.2}s",
                backend.name(),
                start.elapsed().as_secs_f64()
            );
            Ok(Mutex::new(backend))
        })
    }

    pub fn generate(&self, request: &InferenceRequest<'_>) -> Result<Vec<DynamicImage>> {
        // held across the first-use weight load as well
        let _device = self.lease.acquire();
        let backend = self.backend()?;
        let mut backend = backend
            .lock()
            .map_err(|_| anyhow!("inference backend panicked during a previous call"))?;
        backend.generate(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::styles::PromptPair;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Solid;

    impl InferenceBackend for Solid {
        fn name(&self) -> &str {
            "solid"
        }

        fn generate(&mut self, request: &InferenceRequest<'_>) -> Result<Vec<DynamicImage>> {
            Ok(vec![DynamicImage::new_rgb8(request.width, request.height)])
        }
    }

    #[test]
    fn test_backend_loads_once_on_first_use() -> Result<()> {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let shared = SharedInference::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Solid) as Box<dyn InferenceBackend>)
            },
            DeviceLease::new(),
        );
        assert!(!shared.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let prompts = PromptPair {
            positive: "p".into(),
            negative: String::new(),
        };
        let control = RgbImage::new(4, 4);
        let request = InferenceRequest {
            prompts: &prompts,
            control_signal: &control,
            identity_image: None,
            width: 4,
            height: 4,
            conditioning_scale: 0.5,
            steps: 1,
            seed: None,
        };
        shared.generate(&request)?;
        shared.generate(&request)?;
        assert!(shared.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_first_load_runs_under_the_lease() -> Result<()> {
        let lease = DeviceLease::new();
        let factory_lease = lease.clone();
        let held_during_load = Arc::new(AtomicUsize::new(0));
        let flag = held_during_load.clone();
        let shared = SharedInference::new(
            move || {
                if factory_lease.try_acquire().is_none() {
                    flag.store(1, Ordering::SeqCst);
                }
                Ok(Box::new(Solid) as Box<dyn InferenceBackend>)
            },
            lease,
        );

        let prompts = PromptPair {
            positive: String::new(),
            negative: String::new(),
        };
        let control = RgbImage::new(2, 2);
        let request = InferenceRequest {
            prompts: &prompts,
            control_signal: &control,
            identity_image: None,
            width: 2,
            height: 2,
            conditioning_scale: 0.5,
            steps: 1,
            seed: None,
        };
        shared.generate(&request)?;
        assert_eq!(held_during_load.load(Ordering::SeqCst), 1);
        assert!(shared.lease().try_acquire().is_some());
        Ok(())
    }

    #[test]
    fn test_failed_load_is_retried_next_call() {
        let shared = SharedInference::new(|| Err(anyhow!("weights missing")), DeviceLease::new());
        let prompts = PromptPair {
            positive: String::new(),
            negative: String::new(),
        };
        let control = RgbImage::new(1, 1);
        let request = InferenceRequest {
            prompts: &prompts,
            control_signal: &control,
            identity_image: None,
            width: 1,
            height: 1,
            conditioning_scale: 0.5,
            steps: 1,
            seed: None,
        };
        assert!(shared.generate(&request).is_err());
        assert!(!shared.is_loaded());
    }
}
