//! Periodic Task

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{select_backend, RtBackend, RtThread};
use crate::{LatencyStats, LatencySummary, RtConfig, SchedPolicy, SchedulerError};

/// Lifecycle of a [`PeriodicTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Configuring,
    Running,
    Stopping,
}

/// Runs a callback once per period on a dedicated real-time thread
///
/// Every cycle runs the callback, records how far past the current deadline
/// it finished, then sleeps until the next absolute deadline. The first
/// invocation runs as soon as the thread starts, a period ahead of its
/// deadline, so its deviation is negative. Stopping is cooperative: a
/// running invocation always completes.
pub struct PeriodicTask {
    config: RtConfig,
    backend: Arc<dyn RtBackend>,
    state: SchedulerState,
    running: Arc<AtomicBool>,
    stats: Arc<LatencyStats>,
    thread: Option<RtThread>,
    memory_locked: bool,
}

impl PeriodicTask {
    /// Create a task using the backend named in `config`
    pub fn new(config: RtConfig) -> Result<Self, SchedulerError> {
        let backend = select_backend(config.backend)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Create a task with an explicit backend
    pub fn with_backend(config: RtConfig, backend: Arc<dyn RtBackend>) -> Self {
        Self {
            config,
            backend,
            state: SchedulerState::Idle,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(LatencyStats::new()),
            thread: None,
            memory_locked: false,
        }
    }

    /// Start running `task` once per period
    ///
    /// On any failure the task is back in `Idle` and nothing keeps running.
    pub fn start<F>(&mut self, task: F) -> Result<(), SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.state = SchedulerState::Configuring;
        match self.launch(task) {
            Ok(()) => {
                self.state = SchedulerState::Running;
                info!(
                    "Periodic task running every {}µs on {} backend",
                    self.config.period_us,
                    self.backend.name()
                );
                Ok(())
            }
            Err(e) => {
                self.release_memory();
                self.state = SchedulerState::Idle;
                Err(e)
            }
        }
    }

    fn launch<F>(&mut self, task: F) -> Result<(), SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.config.validate()?;

        if self.config.lock_memory {
            self.backend.lock_memory()?;
            self.memory_locked = true;
        }

        self.running.store(true, Ordering::Release);
        let cycle = Cycle {
            backend: Arc::clone(&self.backend),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
            period_ns: self.config.period_ns(),
            max_deviation_ns: self.config.max_deviation_ns(),
        };

        match self.backend.spawn(&self.config, Box::new(move || cycle.run(task))) {
            Ok(thread) => {
                self.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Stop the loop, join the thread and release locked memory
    pub fn stop(&mut self) {
        if self.state != SchedulerState::Running {
            return;
        }

        self.state = SchedulerState::Stopping;
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                warn!("Periodic thread: {}", e);
            }
        }
        self.release_memory();
        self.state = SchedulerState::Idle;

        let summary = self.stats.summary();
        info!(
            "Periodic task stopped after {} cycles ({} deadline misses)",
            summary.count, summary.deadline_misses
        );
    }

    fn release_memory(&mut self) {
        if self.memory_locked {
            self.backend.unlock_memory();
            self.memory_locked = false;
        }
    }

    /// Whether the periodic loop is alive
    ///
    /// Turns false on its own if the callback panicked.
    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running && self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn latency_stats(&self) -> LatencySummary {
        self.stats.summary()
    }

    /// Shared handle to the live statistics
    pub fn stats_handle(&self) -> Arc<LatencyStats> {
        Arc::clone(&self.stats)
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn config(&self) -> &RtConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the periodic thread
struct Cycle {
    backend: Arc<dyn RtBackend>,
    running: Arc<AtomicBool>,
    stats: Arc<LatencyStats>,
    period_ns: u64,
    max_deviation_ns: u64,
}

/// Clears the running flag when the loop exits, including by unwinding
struct ClearOnExit<'a>(&'a AtomicBool);

impl Drop for ClearOnExit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Cycle {
    fn run<F: FnMut()>(self, mut task: F) {
        let _guard = ClearOnExit(&self.running);
        let mut next_wake = self.backend.now_ns().saturating_add(self.period_ns);

        while self.running.load(Ordering::Acquire) {
            task();

            let deviation = self.backend.now_ns() as i64 - next_wake as i64;
            self.stats.record(deviation);
            if deviation > self.max_deviation_ns as i64 {
                self.stats.record_miss();
            }

            next_wake = next_wake.saturating_add(self.period_ns);
            self.backend.sleep_until_ns(next_wake);
        }
    }
}

/// Whether the running kernel carries the PREEMPT_RT patch
pub fn has_rt_preempt() -> bool {
    std::fs::read_to_string("/sys/kernel/realtime")
        .map(|content| content.trim() == "1")
        .unwrap_or(false)
}

/// Highest priority the kernel accepts for `policy`, if known
pub fn max_rt_priority(policy: SchedPolicy) -> Option<i32> {
    #[cfg(target_os = "linux")]
    return crate::posix::max_priority(policy);

    #[cfg(not(target_os = "linux"))]
    match policy {
        SchedPolicy::Fifo | SchedPolicy::RoundRobin => Some(crate::config::RT_PRIORITY_RANGE.1),
        SchedPolicy::Deadline => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackendKind, ElevatedPriorityBackend, TaskBody};
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Poll `cond` until it holds or a second has passed
    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn elevated_config(period_us: u64) -> RtConfig {
        RtConfig {
            lock_memory: false,
            period_us,
            stack_size_kb: 512,
            backend: BackendKind::Elevated,
            ..Default::default()
        }
    }

    #[test]
    fn test_runs_and_records_every_cycle() {
        let mut task = PeriodicTask::new(elevated_config(1_000)).unwrap();
        assert_eq!(task.backend_name(), "elevated");

        let invocations = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&invocations);
        task.start(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert!(task.is_running());
        assert_eq!(task.state(), SchedulerState::Running);

        assert!(wait_for(|| invocations.load(Ordering::Relaxed) >= 5));
        task.stop();
        assert_eq!(task.state(), SchedulerState::Idle);
        assert!(!task.is_running());

        let count = invocations.load(Ordering::Relaxed);
        assert!(count >= 5, "only {count} cycles ran");
        let summary = task.latency_stats();
        assert_eq!(summary.count, count);
        assert!(summary.min_ns <= summary.avg_ns && summary.avg_ns <= summary.max_ns);
    }

    #[test]
    fn test_double_start_rejected() {
        let mut task = PeriodicTask::new(elevated_config(1_000)).unwrap();
        task.start(|| {}).unwrap();
        assert!(matches!(task.start(|| {}), Err(SchedulerError::AlreadyRunning)));
        assert_eq!(task.state(), SchedulerState::Running);

        task.stop();
        // Restart after stop
        task.start(|| {}).unwrap();
        task.stop();
    }

    #[test]
    fn test_invalid_config_leaves_idle() {
        let mut task = PeriodicTask::new(elevated_config(0)).unwrap();
        assert!(matches!(task.start(|| {}), Err(SchedulerError::InvalidConfig(_))));
        assert_eq!(task.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_slow_task_counts_deadline_misses() {
        let config = RtConfig {
            max_deviation_us: 100,
            ..elevated_config(1_000)
        };
        let mut task = PeriodicTask::new(config).unwrap();
        task.start(|| std::thread::sleep(Duration::from_millis(2))).unwrap();
        let stats = task.stats_handle();
        assert!(wait_for(|| stats.summary().count >= 3));
        task.stop();

        // Only the first cycle, which runs a period early, can make its deadline
        let summary = task.latency_stats();
        assert!(summary.deadline_misses >= summary.count - 1);
    }

    #[test]
    fn test_panicking_task_stops_loop() {
        let mut task = PeriodicTask::new(elevated_config(1_000)).unwrap();
        task.start(|| panic!("boom")).unwrap();
        assert!(wait_for(|| !task.is_running()));
        assert_eq!(task.state(), SchedulerState::Running);
        task.stop();
        assert_eq!(task.state(), SchedulerState::Idle);
    }

    /// Backend whose memory lock always fails
    struct NoLockBackend {
        inner: ElevatedPriorityBackend,
        spawned: AtomicBool,
    }

    impl RtBackend for NoLockBackend {
        fn name(&self) -> &'static str {
            "no-lock"
        }

        fn lock_memory(&self) -> Result<(), SchedulerError> {
            Err(SchedulerError::MemoryLock(std::io::Error::from_raw_os_error(
                libc::EPERM,
            )))
        }

        fn unlock_memory(&self) {}

        fn spawn(&self, config: &RtConfig, body: TaskBody) -> Result<RtThread, SchedulerError> {
            self.spawned.store(true, Ordering::Relaxed);
            self.inner.spawn(config, body)
        }

        fn now_ns(&self) -> u64 {
            self.inner.now_ns()
        }

        fn sleep_until_ns(&self, deadline_ns: u64) {
            self.inner.sleep_until_ns(deadline_ns)
        }
    }

    #[test]
    fn test_memory_lock_failure() {
        let backend = Arc::new(NoLockBackend {
            inner: ElevatedPriorityBackend::new(),
            spawned: AtomicBool::new(false),
        });
        let config = RtConfig {
            lock_memory: true,
            ..elevated_config(1_000)
        };
        let mut task = PeriodicTask::with_backend(config, backend.clone());

        assert!(matches!(task.start(|| {}), Err(SchedulerError::MemoryLock(_))));
        assert_eq!(task.state(), SchedulerState::Idle);
        assert!(!backend.spawned.load(Ordering::Relaxed));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_posix_start_is_ok_or_error() {
        let config = RtConfig {
            lock_memory: false,
            period_us: 1_000,
            stack_size_kb: 1024,
            backend: BackendKind::Posix,
            ..Default::default()
        };
        let mut task = PeriodicTask::new(config).unwrap();
        match task.start(|| {}) {
            Ok(()) => {
                std::thread::sleep(Duration::from_millis(10));
                task.stop();
            }
            Err(e) => {
                assert!(matches!(
                    e,
                    SchedulerError::Spawn(_) | SchedulerError::ThreadSetup(_)
                ));
                assert_eq!(task.state(), SchedulerState::Idle);
            }
        }
    }

    #[test]
    fn test_out_of_range_affinity_rejected_before_spawn() {
        let config = RtConfig {
            cpu_affinity: Some(1_000_000),
            ..elevated_config(1_000)
        };
        let mut task = PeriodicTask::new(config).unwrap();
        assert!(matches!(task.start(|| {}), Err(SchedulerError::InvalidConfig(_))));
        assert_eq!(task.state(), SchedulerState::Idle);
    }

    /// Clock that only moves when the loop sleeps
    struct VirtualClock {
        now: AtomicU64,
    }

    impl RtBackend for VirtualClock {
        fn name(&self) -> &'static str {
            "virtual"
        }

        fn lock_memory(&self) -> Result<(), SchedulerError> {
            Ok(())
        }

        fn unlock_memory(&self) {}

        fn spawn(&self, _config: &RtConfig, body: TaskBody) -> Result<RtThread, SchedulerError> {
            let handle = std::thread::spawn(body);
            Ok(RtThread::std(handle))
        }

        fn now_ns(&self) -> u64 {
            self.now.load(Ordering::Acquire)
        }

        fn sleep_until_ns(&self, deadline_ns: u64) {
            self.now.fetch_max(deadline_ns, Ordering::AcqRel);
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_first_invocation_runs_before_first_deadline() {
        let clock = Arc::new(VirtualClock {
            now: AtomicU64::new(0),
        });
        let mut task = PeriodicTask::with_backend(elevated_config(1), clock.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let clock_in_task = Arc::clone(&clock);
        task.start(move || {
            let mut seen = record.lock().unwrap();
            if seen.len() < 5 {
                seen.push(clock_in_task.now_ns());
            }
        })
        .unwrap();
        assert!(wait_for(|| seen.lock().unwrap().len() == 5));
        task.stop();

        assert_eq!(*seen.lock().unwrap(), [0, 2_000, 3_000, 4_000, 5_000]);
        let summary = task.latency_stats();
        assert_eq!(summary.min_ns, -1_000);
        assert_eq!(summary.max_ns, 0);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut task = PeriodicTask::new(elevated_config(1_000)).unwrap();
        task.stop();
        assert_eq!(task.state(), SchedulerState::Idle);
    }
}
