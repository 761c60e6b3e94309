use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent: Send + Sync {
    async fn on_init(&self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Clears a job's busy flag when the run ends, even by panic.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<dyn LifecycleComponent>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: Arc<dyn LifecycleComponent>) {
        self.components.push(component);
    }

    /// Run `task` every `interval`. A tick that fires while the previous run
    /// of the same job is still going is skipped.
    pub async fn every<F, Fut>(&self, name: &'static str, interval: Duration, task: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(task);
        let busy = Arc::new(AtomicBool::new(false));
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let task = task.clone();
            let busy = busy.clone();
            Box::pin(async move {
                if busy.swap(true, Ordering::AcqRel) {
                    debug!("[lifecycle] {} still running, skipping tick", name);
                    return;
                }
                let _busy = BusyGuard(busy);
                task().await;
            })
        })?;
        self.scheduler.add(job).await?;
        info!("[lifecycle] Scheduled {} every {:?}", name, interval);
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.on_init().await?;
        }

        for comp in &self.components {
            comp.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;

        Ok(())
    }

    /// Stop scheduling, then shut components down in reverse attach order.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        for comp in self.components.iter().rev() {
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            Ok(())
        }
        async fn on_start(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            Ok(())
        }
        async fn on_shutdown(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn components_start_in_order_and_stop_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        for name in ["store", "coordinator"] {
            lifecycle.attach(Arc::new(Recorder {
                name,
                log: log.clone(),
            }));
        }

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
        lifecycle.shutdown().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "init:store",
                "init:coordinator",
                "start:store",
                "start:coordinator",
                "stop:coordinator",
                "stop:store"
            ]
        );
    }

    #[tokio::test]
    async fn repeated_job_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        let counter = hits.clone();
        lifecycle
            .every("tick", Duration::from_secs(1), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        lifecycle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        lifecycle.shutdown().await.unwrap();
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn busy_flag_clears_when_a_run_panics() {
        let busy = Arc::new(AtomicBool::new(true));
        let flag = busy.clone();
        let run = std::panic::catch_unwind(move || {
            let _busy = BusyGuard(flag);
            panic!("job blew up");
        });
        assert!(run.is_err());
        assert!(!busy.load(Ordering::Acquire));
    }
}
