//! One-shot timers used to rotate advertising slots

use std::time::Duration;

use tokio::task::JoinHandle;

/// Invoked when a started timer expires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

// ----------------------------------------------------------------------------
// Timer Traits
// ----------------------------------------------------------------------------

/// A timer that fires at most once per `start`.
///
/// Dropping a timer cancels it.
pub trait OneShotTimer: Send {
    /// Arm the timer, replacing any pending expiry
    fn start(&mut self, delay: Duration, on_fire: TimerCallback);

    /// Cancel a pending expiry
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Delay passed to the most recent `start`
    fn current_delay(&self) -> Option<Duration>;
}

pub trait TimerFactory: Send {
    fn create_one_shot_timer(&self) -> Box<dyn OneShotTimer>;
}

// ----------------------------------------------------------------------------
// Tokio Implementation
// ----------------------------------------------------------------------------

/// Creates [`TokioOneShotTimer`]s; must be used from inside a tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimerFactory;

impl TimerFactory for TokioTimerFactory {
    fn create_one_shot_timer(&self) -> Box<dyn OneShotTimer> {
        Box::new(TokioOneShotTimer::new())
    }
}

/// Sleeps on a spawned task and aborts it on cancellation
#[derive(Debug, Default)]
pub struct TokioOneShotTimer {
    task: Option<JoinHandle<()>>,
    delay: Option<Duration>,
}

impl TokioOneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OneShotTimer for TokioOneShotTimer {
    fn start(&mut self, delay: Duration, on_fire: TimerCallback) {
        self.stop();
        self.delay = Some(delay);
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn current_delay(&self) -> Option<Duration> {
        self.delay
    }
}

impl Drop for TokioOneShotTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = TokioTimerFactory.create_one_shot_timer();

        timer.start(Duration::from_secs(10), counting_callback(&fired));
        assert!(timer.is_running());
        assert_eq!(timer.current_delay(), Some(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = TokioTimerFactory.create_one_shot_timer();

        timer.start(Duration::from_secs(1), counting_callback(&fired));
        timer.stop();
        assert!(!timer.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let mut timer = TokioTimerFactory.create_one_shot_timer();
            timer.start(Duration::from_secs(1), counting_callback(&fired));
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_pending_expiry() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = TokioTimerFactory.create_one_shot_timer();

        timer.start(Duration::from_secs(1), counting_callback(&fired));
        timer.start(Duration::from_secs(3), counting_callback(&fired));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
