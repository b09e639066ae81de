use image::DynamicImage;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::engine::{EngineFactory, EngineOutput, RecognitionEngine};
use crate::error::{Result, ScribeError};

/// Fixed-size pool of long-lived engine instances.
///
/// Each checkout holds one permit, so at most `size` recognitions run at
/// once across every request. Instances are built lazily by the factory
/// and reused after each call.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Arc<dyn EngineFactory>,
    idle: Mutex<Vec<Box<dyn RecognitionEngine>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl PoolInner {
    fn put_back(&self, engine: Box<dyn RecognitionEngine>) {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(engine);
    }

    fn take_idle(&self) -> Option<Box<dyn RecognitionEngine>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
    }
}

impl EnginePool {
    pub fn new(factory: Arc<dyn EngineFactory>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                idle: Mutex::new(Vec::with_capacity(size)),
                permits: Arc::new(Semaphore::new(size)),
                size,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Slots not currently checked out.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Build one instance up front so a missing engine shows at startup.
    /// Blocking; call from a blocking context.
    pub fn warm_up(&self) -> Result<()> {
        let engine = self.inner.factory.create()?;
        self.inner.put_back(engine);
        Ok(())
    }

    /// Wait for a free slot. The engine itself is created on first use so
    /// that construction happens on the blocking thread.
    pub async fn checkout(&self) -> Result<PooledEngine> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| ScribeError::Internal("engine pool closed".to_string()))?;

        Ok(PooledEngine {
            engine: self.inner.take_idle(),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }
}

/// Exclusive use of one engine. Dropping it returns the engine to the
/// pool, unless the thread is unwinding from a panic inside the engine.
pub struct PooledEngine {
    engine: Option<Box<dyn RecognitionEngine>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledEngine {
    pub fn recognize(&mut self, image: &DynamicImage, languages: &[String]) -> Result<EngineOutput> {
        if self.engine.is_none() {
            debug!("Creating recognition engine instance");
            self.engine = Some(self.pool.factory.create()?);
        }
        match self.engine.as_mut() {
            Some(engine) => engine.recognize(image, languages),
            None => Err(ScribeError::Internal("engine slot empty".to_string())),
        }
    }
}

impl Drop for PooledEngine {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if std::thread::panicking() {
                warn!("Discarding engine instance after panic");
            } else {
                self.pool.put_back(engine);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        created: Arc<AtomicUsize>,
    }

    struct EchoEngine;

    impl RecognitionEngine for EchoEngine {
        fn recognize(&mut self, _image: &DynamicImage, languages: &[String]) -> Result<EngineOutput> {
            Ok(EngineOutput {
                text: languages.join("+"),
                tokens: vec![],
            })
        }
    }

    struct PanickingEngine;

    impl RecognitionEngine for PanickingEngine {
        fn recognize(&mut self, _image: &DynamicImage, _languages: &[String]) -> Result<EngineOutput> {
            panic!("engine crashed");
        }
    }

    impl EngineFactory for CountingFactory {
        fn create(&self) -> Result<Box<dyn RecognitionEngine>> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(Box::new(PanickingEngine))
            } else {
                Ok(Box::new(EchoEngine))
            }
        }
    }

    struct EchoFactory {
        created: Arc<AtomicUsize>,
    }

    impl EngineFactory for EchoFactory {
        fn create(&self) -> Result<Box<dyn RecognitionEngine>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EchoEngine))
        }
    }

    struct MissingFactory;

    impl EngineFactory for MissingFactory {
        fn create(&self) -> Result<Box<dyn RecognitionEngine>> {
            Err(ScribeError::EngineUnavailable("no language data".to_string()))
        }
    }

    fn image() -> DynamicImage {
        DynamicImage::new_luma8(4, 4)
    }

    #[tokio::test]
    async fn test_engines_are_reused() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = EnginePool::new(
            Arc::new(EchoFactory {
                created: created.clone(),
            }),
            2,
        );

        for _ in 0..5 {
            let mut engine = pool.checkout().await.unwrap();
            let out = engine.recognize(&image(), &["eng".to_string()]).unwrap();
            assert_eq!(out.text, "eng");
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_checkout_is_bounded() {
        let pool = EnginePool::new(
            Arc::new(EchoFactory {
                created: Arc::new(AtomicUsize::new(0)),
            }),
            1,
        );

        let held = pool.checkout().await.unwrap();
        assert_eq!(pool.available(), 0);
        let waiting =
            tokio::time::timeout(std::time::Duration::from_millis(50), pool.checkout()).await;
        assert!(waiting.is_err());

        drop(held);
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_engine_is_replaced() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = EnginePool::new(
            Arc::new(CountingFactory {
                created: created.clone(),
            }),
            1,
        );

        let mut engine = pool.checkout().await.unwrap();
        let crashed = tokio::task::spawn_blocking(move || engine.recognize(&image(), &[])).await;
        assert!(crashed.is_err());
        assert_eq!(pool.available(), 1);

        let mut engine = pool.checkout().await.unwrap();
        let out = tokio::task::spawn_blocking(move || engine.recognize(&image(), &["deu".to_string()]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.text, "deu");
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces_as_unavailable() {
        let pool = EnginePool::new(Arc::new(MissingFactory), 1);
        assert!(matches!(pool.warm_up(), Err(ScribeError::EngineUnavailable(_))));

        let mut engine = pool.checkout().await.unwrap();
        let err = engine.recognize(&image(), &[]).unwrap_err();
        assert!(matches!(err, ScribeError::EngineUnavailable(_)));
    }
}
