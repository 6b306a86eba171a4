//! The thread monitor.
//!
//! Discovers existing, spawned, and terminated threads in the process and
//! reports them through a callback, either via one synchronous scan
//! (`ThreadDiscovery::None`, driven entirely by `rescan()`) or via a
//! background poller (`ThreadDiscovery::PeriodicPoll`), both driven by the
//! same generation-counter scan.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sysfail_shared::errors::{SysfailError, SysfailResult};

const TASKS_DIR: &str = "/proc/self/task";

/// How new and departed threads are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadDiscovery {
    /// No background polling; callers drive discovery with `rescan()`.
    None,
    /// A background thread polls `/proc/self/task` at the given interval.
    PeriodicPoll { interval: Duration },
}

/// The classification a discovered tid is reported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveredThreadState {
    /// The monitor's own thread, reported once at startup.
    SelfThread,
    /// Present during the very first scan.
    Existing,
    /// Appeared in a later scan.
    Spawned,
    /// Present in a previous scan, absent in this one.
    Terminated,
}

pub type ThreadEventHandler = Arc<dyn Fn(libc::pid_t, DiscoveredThreadState) + Send + Sync>;

type Generation = u32;

struct ScanState {
    generation: Generation,
    known: HashMap<libc::pid_t, Generation>,
}

struct StopControl {
    mtx: Mutex<bool>,
    cv: Condvar,
}

struct ReadySignal {
    mtx: Mutex<bool>,
    cv: Condvar,
}

impl ReadySignal {
    fn new() -> Self {
        Self {
            mtx: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut ready = self.mtx.lock().unwrap();
        *ready = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut ready = self.mtx.lock().unwrap();
        while !*ready {
            ready = self.cv.wait(ready).unwrap();
        }
    }
}

/// Drives thread discovery per the configured strategy.
pub struct ThreadMonitor {
    handler: ThreadEventHandler,
    scan_state: Arc<Mutex<ScanState>>,
    stop: Arc<StopControl>,
    poller: Option<JoinHandle<()>>,
}

impl ThreadMonitor {
    pub fn new(strategy: ThreadDiscovery, handler: ThreadEventHandler) -> SysfailResult<Self> {
        if !Path::new(TASKS_DIR).exists() {
            return Err(SysfailError::MonitorStartFailed(format!(
                "task directory {TASKS_DIR} does not exist"
            )));
        }

        let scan_state = Arc::new(Mutex::new(ScanState {
            generation: 0,
            known: HashMap::new(),
        }));
        let stop = Arc::new(StopControl {
            mtx: Mutex::new(false),
            cv: Condvar::new(),
        });

        match strategy {
            ThreadDiscovery::None => {
                let mut state = scan_state.lock().unwrap();
                scan_tasks(&mut state, &handler)?;
                drop(state);
                Ok(Self {
                    handler,
                    scan_state,
                    stop,
                    poller: None,
                })
            }
            ThreadDiscovery::PeriodicPoll { interval } => {
                let ready = Arc::new(ReadySignal::new());
                let poller_state = scan_state.clone();
                let poller_handler = handler.clone();
                let poller_stop = stop.clone();
                let poller_ready = ready.clone();
                let handle = thread::Builder::new()
                    .name("sysfail-thdmon".into())
                    .spawn(move || {
                        poll_loop(poller_state, poller_handler, poller_stop, interval, poller_ready)
                    })
                    .map_err(|e| {
                        SysfailError::MonitorStartFailed(format!(
                            "failed to spawn poller thread: {e}"
                        ))
                    })?;
                ready.wait();
                Ok(Self {
                    handler,
                    scan_state,
                    stop,
                    poller: Some(handle),
                })
            }
        }
    }

    /// Trigger one synchronous discovery pass. Under `PeriodicPoll`,
    /// serialises with the background poller via the same mutex; rescans
    /// and periodic scans never run concurrently.
    pub fn rescan(&self) -> SysfailResult<()> {
        let mut state = self.scan_state.lock().unwrap();
        if self.poller.is_some() {
            state.generation += 1;
        }
        scan_tasks(&mut state, &self.handler)
    }
}

impl Drop for ThreadMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.take() {
            {
                let mut stop = self.stop.mtx.lock().unwrap();
                *stop = true;
                self.stop.cv.notify_one();
            }
            let _ = handle.join();
        }
    }
}

fn poll_loop(
    scan_state: Arc<Mutex<ScanState>>,
    handler: ThreadEventHandler,
    stop: Arc<StopControl>,
    interval: Duration,
    ready: Arc<ReadySignal>,
) {
    let self_tid = unsafe { libc::gettid() };
    {
        let mut state = scan_state.lock().unwrap();
        state.known.insert(self_tid, state.generation);
    }
    handler(self_tid, DiscoveredThreadState::SelfThread);

    let mut stop_guard = stop.mtx.lock().unwrap();
    loop {
        {
            let mut state = scan_state.lock().unwrap();
            if let Err(err) = scan_tasks(&mut state, &handler) {
                tracing::warn!(%err, "thread-discovery scan failed");
            }
            state.generation += 1;
        }
        ready.signal();

        let (guard, _timeout) = stop
            .cv
            .wait_timeout_while(stop_guard, interval, |stop| !*stop)
            .unwrap();
        stop_guard = guard;
        if *stop_guard {
            break;
        }
    }
}

fn scan_tasks(state: &mut ScanState, handler: &ThreadEventHandler) -> SysfailResult<()> {
    let generation = state.generation;
    let entries = fs::read_dir(TASKS_DIR)?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(tid) = name.to_str().and_then(|s| s.parse::<libc::pid_t>().ok()) else {
            continue;
        };
        match state.known.get_mut(&tid) {
            Some(last_seen) => *last_seen = generation,
            None => {
                let event = if generation == 0 {
                    DiscoveredThreadState::Existing
                } else {
                    DiscoveredThreadState::Spawned
                };
                handler(tid, event);
                state.known.insert(tid, generation);
            }
        }
    }

    let departed: Vec<libc::pid_t> = state
        .known
        .iter()
        .filter(|(_, &g)| g < generation)
        .map(|(&tid, _)| tid)
        .collect();
    for tid in departed {
        handler(tid, DiscoveredThreadState::Terminated);
        state.known.remove(&tid);
    }

    Ok(())
}
