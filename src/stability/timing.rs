use std::future::Future;
use std::time::{Duration, Instant};
use tracing::info;

/// Measures a scoped activity and logs its duration exactly once: on `stop`,
/// or on drop when the scope is left early (error, panic, cancelled future).
pub struct Stopwatch {
    activity: String,
    started: Instant,
    stopped: bool,
}

impl Stopwatch {
    pub fn start(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            started: Instant::now(),
            stopped: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stop(mut self) -> Duration {
        self.finish()
    }

    fn finish(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.stopped {
            self.stopped = true;
            info!("{}. Duration (ms): {}", self.activity, elapsed.as_millis());
        }
        elapsed
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Await `fut` and log how long it took under `activity`.
pub async fn timed<F, T>(activity: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let stopwatch = Stopwatch::start(activity);
    let output = fut.await;
    stopwatch.stop();
    output
}
