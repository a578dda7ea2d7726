//! POSIX Real-Time Backend (Linux)
//!
//! Fixed-priority classes and CPU affinity are set through pthread
//! attributes, so the thread never runs a single instruction at normal
//! priority or on the wrong CPU. The deadline class can only be entered by
//! the thread itself; it does so before any user code runs and reports the
//! outcome back to `spawn` through a rendezvous channel.
//!
//! Without glibc's `pthread_attr_setaffinity_np` affinity is also applied
//! from the thread prologue.

use std::ffi::c_void;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::mpsc;

use tracing::{debug, error, info};

use crate::backend::{RtBackend, RtThread, TaskBody};
use crate::config::MAX_CPUS;
use crate::{RtConfig, SchedPolicy, SchedulerError};

/// `SCHED_DEADLINE` from linux/sched.h
const SCHED_DEADLINE: u32 = 6;

/// Bytes of stack touched before the loop starts
const STACK_PREFAULT_BYTES: usize = 64 * 1024;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Kernel `struct sched_attr` (first version, 48 bytes)
#[repr(C)]
struct SchedAttr {
    size: u32,
    sched_policy: u32,
    sched_flags: u64,
    sched_nice: i32,
    sched_priority: u32,
    sched_runtime: u64,
    sched_deadline: u64,
    sched_period: u64,
}

/// Real-time threads via pthreads and `clock_nanosleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixRtBackend;

impl SchedPolicy {
    fn raw(&self) -> libc::c_int {
        match self {
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
            SchedPolicy::Deadline => SCHED_DEADLINE as libc::c_int,
        }
    }
}

/// Highest priority the kernel accepts for `policy`
pub(crate) fn max_priority(policy: SchedPolicy) -> Option<i32> {
    // SAFETY: pure query without side effects
    let max = unsafe { libc::sched_get_priority_max(policy.raw()) };
    (max >= 0).then_some(max)
}

/// Whether this process may request real-time scheduling classes
pub(crate) fn can_use_rt_scheduling() -> bool {
    // SAFETY: geteuid cannot fail
    if unsafe { libc::geteuid() } == 0 {
        return true;
    }

    // SAFETY: rlimit is plain data filled by getrlimit on success
    let mut limit: libc::rlimit = unsafe { mem::zeroed() };
    // SAFETY: limit points to writable memory of the right type
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut limit) };
    rc == 0 && limit.rlim_cur > 0
}

/// Owned pthread attribute object
struct ThreadAttr(libc::pthread_attr_t);

impl ThreadAttr {
    fn new() -> Result<Self, SchedulerError> {
        // SAFETY: pthread_attr_init fully initialises the zeroed storage
        let mut attr: libc::pthread_attr_t = unsafe { mem::zeroed() };
        check(unsafe { libc::pthread_attr_init(&mut attr) }, "pthread_attr_init")?;
        Ok(Self(attr))
    }

    fn configure(&mut self, config: &RtConfig) -> Result<(), SchedulerError> {
        let attr = &mut self.0;
        // SAFETY: attr was initialised by pthread_attr_init
        unsafe {
            check(
                libc::pthread_attr_setstacksize(attr, config.stack_size_bytes()),
                "pthread_attr_setstacksize",
            )?;

            if let SchedPolicy::Fifo | SchedPolicy::RoundRobin = config.policy {
                check(
                    libc::pthread_attr_setinheritsched(attr, libc::PTHREAD_EXPLICIT_SCHED),
                    "pthread_attr_setinheritsched",
                )?;
                check(
                    libc::pthread_attr_setschedpolicy(attr, config.policy.raw()),
                    "pthread_attr_setschedpolicy",
                )?;
                let mut param: libc::sched_param = mem::zeroed();
                param.sched_priority = config.priority;
                check(
                    libc::pthread_attr_setschedparam(attr, &param),
                    "pthread_attr_setschedparam",
                )?;
            }

            #[cfg(target_env = "gnu")]
            if let Some(cpu) = config.cpu_affinity {
                let set = cpu_set_for(cpu).map_err(SchedulerError::ThreadSetup)?;
                check(
                    libc::pthread_attr_setaffinity_np(attr, mem::size_of::<libc::cpu_set_t>(), &set),
                    "pthread_attr_setaffinity_np",
                )?;
            }
        }
        Ok(())
    }
}

impl Drop for ThreadAttr {
    fn drop(&mut self) {
        // SAFETY: initialised in `new`, destroyed once
        unsafe { libc::pthread_attr_destroy(&mut self.0) };
    }
}

fn check(rc: libc::c_int, what: &str) -> Result<(), SchedulerError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(SchedulerError::ThreadSetup(format!(
            "{what}: {}",
            io::Error::from_raw_os_error(rc)
        )))
    }
}

/// Setup the new thread performs on itself
struct Prologue {
    /// Only set where the attribute object cannot carry affinity
    cpu_affinity: Option<usize>,
    /// Deadline class period in nanoseconds
    deadline_period_ns: Option<u64>,
    prefault_stack: bool,
}

impl Prologue {
    fn from_config(config: &RtConfig) -> Self {
        Self {
            cpu_affinity: if cfg!(target_env = "gnu") {
                None
            } else {
                config.cpu_affinity
            },
            deadline_period_ns: (config.policy == SchedPolicy::Deadline)
                .then(|| config.period_ns()),
            prefault_stack: config.stack_size_bytes() >= 4 * STACK_PREFAULT_BYTES,
        }
    }

    fn apply(&self) -> Result<(), String> {
        if let Some(cpu) = self.cpu_affinity {
            set_current_thread_affinity(cpu)?;
        }

        if let Some(period) = self.deadline_period_ns {
            let attr = SchedAttr {
                size: mem::size_of::<SchedAttr>() as u32,
                sched_policy: SCHED_DEADLINE,
                sched_flags: 0,
                sched_nice: 0,
                sched_priority: 0,
                sched_runtime: period / 2,
                sched_deadline: period,
                sched_period: period,
            };
            // SAFETY: attr is a valid sched_attr of the size it declares;
            // pid 0 targets the calling thread
            let rc = unsafe { libc::syscall(libc::SYS_sched_setattr, 0, &attr as *const SchedAttr, 0) };
            if rc != 0 {
                return Err(format!("sched_setattr: {}", io::Error::last_os_error()));
            }
        }

        if self.prefault_stack {
            let mut page = [0u8; STACK_PREFAULT_BYTES];
            std::hint::black_box(&mut page);
        }

        Ok(())
    }
}

/// CPU set naming only `cpu`
///
/// `CPU_SET` indexes a fixed array, so the range is checked first.
fn cpu_set_for(cpu: usize) -> Result<libc::cpu_set_t, String> {
    if cpu >= MAX_CPUS {
        return Err(format!("CPU {cpu} outside 0..{MAX_CPUS}"));
    }
    // SAFETY: cpu_set_t is plain data and cpu is within its bounds
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        Ok(set)
    }
}

/// Pin the calling thread to one CPU
pub(crate) fn set_current_thread_affinity(cpu: usize) -> Result<(), String> {
    let set = cpu_set_for(cpu)?;
    // SAFETY: set is a fully initialised cpu_set_t of the size passed
    let rc = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(format!(
            "sched_setaffinity to CPU {cpu}: {}",
            io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Everything the trampoline receives, boxed and passed as the thread argument
struct ThreadStart {
    prologue: Prologue,
    ready: mpsc::SyncSender<Result<(), String>>,
    body: TaskBody,
}

extern "C" fn trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: arg is the Box leaked by `spawn`, handed to exactly one thread
    let start = unsafe { Box::from_raw(arg as *mut ThreadStart) };
    let ThreadStart {
        prologue,
        ready,
        body,
    } = *start;

    let setup = prologue.apply();
    let proceed = setup.is_ok();
    let _ = ready.send(setup);
    if !proceed {
        return ptr::null_mut();
    }

    // Unwinding across the extern "C" boundary would abort the process
    if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
        error!("Real-time task panicked");
    }
    ptr::null_mut()
}

impl RtBackend for PosixRtBackend {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn lock_memory(&self) -> Result<(), SchedulerError> {
        // SAFETY: mlockall has no memory-safety preconditions
        if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
            return Err(SchedulerError::MemoryLock(io::Error::last_os_error()));
        }
        debug!("Locked process memory");
        Ok(())
    }

    fn unlock_memory(&self) {
        // SAFETY: as above
        unsafe { libc::munlockall() };
    }

    fn spawn(&self, config: &RtConfig, body: TaskBody) -> Result<RtThread, SchedulerError> {
        let mut attr = ThreadAttr::new()?;
        attr.configure(config)?;

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let start = Box::into_raw(Box::new(ThreadStart {
            prologue: Prologue::from_config(config),
            ready: ready_tx,
            body,
        }));

        // SAFETY: pthread_t is plain data filled by pthread_create
        let mut thread: libc::pthread_t = unsafe { mem::zeroed() };
        // SAFETY: attr is initialised; on success ownership of `start`
        // passes to the new thread
        let rc = unsafe {
            libc::pthread_create(&mut thread, &attr.0, trampoline, start as *mut c_void)
        };
        if rc != 0 {
            // SAFETY: the thread was not created, so `start` is still ours
            drop(unsafe { Box::from_raw(start) });
            return Err(SchedulerError::Spawn(io::Error::from_raw_os_error(rc)));
        }

        let handle = RtThread::posix(thread);
        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "Started {:?} thread at priority {} (affinity {:?})",
                    config.policy, config.priority, config.cpu_affinity
                );
                Ok(handle)
            }
            Ok(Err(reason)) => {
                let _ = handle.join();
                Err(SchedulerError::ThreadSetup(reason))
            }
            Err(_) => {
                let _ = handle.join();
                Err(SchedulerError::ThreadSetup(
                    "thread exited before reporting setup".to_string(),
                ))
            }
        }
    }

    fn now_ns(&self) -> u64 {
        // SAFETY: timespec is plain data filled by clock_gettime
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        // SAFETY: CLOCK_MONOTONIC is always available on Linux
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        // SAFETY: timespec is plain data
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        ts.tv_sec = (deadline_ns / NANOS_PER_SEC) as libc::time_t;
        ts.tv_nsec = (deadline_ns % NANOS_PER_SEC) as libc::c_long;
        loop {
            // SAFETY: ts is a valid absolute monotonic time
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &ts,
                    ptr::null_mut(),
                )
            };
            if rc != libc::EINTR {
                break;
            }
        }
    }
}
