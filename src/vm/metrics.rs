use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Guest threads that reached `start`
    pub threads_started: AtomicU64,
    /// Guest threads that went through cleanup after running a task
    pub threads_finished: AtomicU64,
    /// Finished threads that stored a failure
    pub threads_failed: AtomicU64,
    /// Finished threads that unwound because of `kill`
    pub threads_killed: AtomicU64,
    /// Safepoint actions executed by their target threads
    pub safepoint_actions: AtomicU64,
    /// Blocking attempts cut short by an interrupt and retried
    pub blocking_interruptions: AtomicU64,
    /// Timed joins that gave up at their deadline
    pub join_timeouts: AtomicU64,
    /// Number of times a thread had to block waiting for a guest mutex
    pub lock_contention_count: AtomicU64,
    /// Total time spent waiting for guest mutexes (in microseconds)
    pub lock_contention_total_us: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_thread_started(&self) {
        self.threads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_thread_finished(&self) {
        self.threads_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_thread_failed(&self) {
        self.threads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_thread_killed(&self) {
        self.threads_killed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_safepoint_action(&self) {
        self.safepoint_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocking_interruption(&self) {
        self.blocking_interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join_timeout(&self) {
        self.join_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self, duration: Duration) {
        self.lock_contention_count.fetch_add(1, Ordering::Relaxed);
        self.lock_contention_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }
}

impl fmt::Display for RuntimeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        writeln!(f, "threads started:        {}", load(&self.threads_started))?;
        writeln!(f, "threads finished:       {}", load(&self.threads_finished))?;
        writeln!(f, "threads failed:         {}", load(&self.threads_failed))?;
        writeln!(f, "threads killed:         {}", load(&self.threads_killed))?;
        writeln!(f, "safepoint actions:      {}", load(&self.safepoint_actions))?;
        writeln!(f, "blocking interruptions: {}", load(&self.blocking_interruptions))?;
        writeln!(f, "join timeouts:          {}", load(&self.join_timeouts))?;
        write!(
            f,
            "lock contention:        {} waits, {} us",
            load(&self.lock_contention_count),
            load(&self.lock_contention_total_us)
        )
    }
}
