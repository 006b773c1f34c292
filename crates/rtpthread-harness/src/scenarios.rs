//! Behavioral scenarios.
//!
//! Each scenario builds a fresh [`Runtime`] and checks one observable law of
//! the threading layer end to end.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rtpthread_core::pthread::signal::SIGUSR1;
use rtpthread_core::sched::current_task;
use rtpthread_core::{
    CANCELED, Error, MutexKind, Registry, Runtime, RuntimeConfig, SignalAction, ThreadAttr,
    ThreadId,
};

use crate::report::{ScenarioReport, SuiteReport};

/// Why a scenario failed.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("layer error: {0}")]
    Layer(#[from] Error),
    #[error("check failed: {0}")]
    Check(String),
}

type Outcome = Result<(), ScenarioError>;

/// A named scenario.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub about: &'static str,
    run: fn(&Runtime) -> Outcome,
}

/// Every scenario, in run order.
pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "recursive-depth",
        about: "N locks need N unlocks before another thread can acquire",
        run: recursive_depth,
    },
    Scenario {
        name: "normal-trylock-busy",
        about: "try_lock on a held normal mutex is Busy; lock waits for unlock",
        run: normal_trylock_busy,
    },
    Scenario {
        name: "handle-reuse",
        about: "a recycled slot never resolves a stale handle",
        run: handle_reuse,
    },
    Scenario {
        name: "cleanup-order",
        about: "early exit runs cleanup handlers last-in first-out",
        run: cleanup_order,
    },
    Scenario {
        name: "cleanup-selectivity",
        about: "pop(false) discards, pop(true) runs",
        run: cleanup_selectivity,
    },
    Scenario {
        name: "cleanup-asymmetry",
        about: "normal return runs no cleanup handlers",
        run: cleanup_asymmetry,
    },
    Scenario {
        name: "condvar-wakeup",
        about: "a waiter wakes after signal and holds the mutex on return",
        run: condvar_wakeup,
    },
    Scenario {
        name: "tls-destructor",
        about: "a TLS destructor runs once with the last value",
        run: tls_destructor,
    },
    Scenario {
        name: "signal-checkpoint",
        about: "a raised signal runs only at the target's checkpoint",
        run: signal_checkpoint,
    },
    Scenario {
        name: "cancel",
        about: "cancellation runs cleanup handlers and reports CANCELED",
        run: cancel,
    },
    Scenario {
        name: "end-to-end",
        about: "a recursive mutex stays held at depth 1 across an early exit",
        run: end_to_end,
    },
];

/// Run every scenario under `config`.
#[must_use]
pub fn run_all(config: &RuntimeConfig) -> SuiteReport {
    let reports = SCENARIOS.iter().map(|s| run_one(s, config)).collect();
    SuiteReport::new(lock_timeout_ms(config), reports)
}

/// The configured diagnostic lock timeout in milliseconds.
#[must_use]
pub fn lock_timeout_ms(config: &RuntimeConfig) -> Option<u64> {
    config
        .lock_timeout
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Run the scenario called `name`, if there is one.
#[must_use]
pub fn run_named(name: &str, config: &RuntimeConfig) -> Option<ScenarioReport> {
    SCENARIOS
        .iter()
        .find(|s| s.name == name)
        .map(|s| run_one(s, config))
}

fn run_one(scenario: &Scenario, config: &RuntimeConfig) -> ScenarioReport {
    let rt = Runtime::with_config(config.clone());
    let start = Instant::now();
    let outcome = (scenario.run)(&rt);
    let elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
    match &outcome {
        Ok(()) => log::info!(target: "rtpthread::harness", "{} passed", scenario.name),
        Err(err) => log::error!(target: "rtpthread::harness", "{} failed: {err}", scenario.name),
    }
    ScenarioReport {
        name: scenario.name.to_string(),
        passed: outcome.is_ok(),
        elapsed_us,
        detail: outcome.err().map(|e| e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Ordered record of which cleanup handlers ran.
#[derive(Debug, Clone, Default)]
struct Tape(Arc<Mutex<String>>);

impl Tape {
    fn recorder(&self, tag: char) -> impl FnOnce() + Send + 'static {
        let tape = self.clone();
        move || {
            if let Ok(mut s) = tape.0.lock() {
                s.push(tag);
            }
        }
    }

    fn contents(&self) -> String {
        self.0.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn ensure(cond: bool, what: impl Into<String>) -> Outcome {
    if cond {
        Ok(())
    } else {
        Err(ScenarioError::Check(what.into()))
    }
}

fn expect_eq<T: PartialEq + std::fmt::Debug>(actual: T, expected: T, what: &str) -> Outcome {
    ensure(
        actual == expected,
        format!("{what}: expected {expected:?}, got {actual:?}"),
    )
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) -> Outcome {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > Duration::from_secs(5) {
            return Err(ScenarioError::Check(format!("timed out waiting for {what}")));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Join `thread` and turn a layer error or panic into a scenario failure.
fn join(rt: &Runtime, thread: ThreadId) -> Result<usize, ScenarioError> {
    Ok(rt.threads().join(thread)?)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

fn recursive_depth(rt: &Runtime) -> Outcome {
    const DEPTH: usize = 4;
    let m = rt.mutexes().init(MutexKind::Recursive)?;
    for _ in 0..DEPTH {
        rt.mutexes().lock(m)?;
    }
    for _ in 0..DEPTH - 1 {
        rt.mutexes().unlock(m)?;
    }
    let probe = rt.clone();
    let t = rt
        .threads()
        .create(ThreadAttr::new(), move || usize::from(probe.mutexes().try_lock(m).is_ok()))?;
    expect_eq(join(rt, t)?, 0, "acquired one level short")?;

    rt.mutexes().unlock(m)?;
    let probe = rt.clone();
    let t = rt.threads().create(ThreadAttr::new(), move || {
        let got = probe.mutexes().try_lock(m).is_ok();
        let _ = probe.mutexes().unlock(m);
        usize::from(got)
    })?;
    expect_eq(join(rt, t)?, 1, "acquired after full unlock")
}

fn normal_trylock_busy(rt: &Runtime) -> Outcome {
    let m = rt.mutexes().init(MutexKind::Normal)?;
    rt.mutexes().lock(m)?;
    let unlocked = Arc::new(AtomicBool::new(false));
    let (probe, flag) = (rt.clone(), Arc::clone(&unlocked));
    let t = rt.threads().create(ThreadAttr::new(), move || {
        let busy = probe.mutexes().try_lock(m) == Err(Error::Busy);
        let locked = probe.mutexes().lock(m).is_ok();
        let after_unlock = flag.load(Ordering::SeqCst);
        let _ = probe.mutexes().unlock(m);
        usize::from(busy && locked && after_unlock)
    })?;
    std::thread::sleep(Duration::from_millis(20));
    unlocked.store(true, Ordering::SeqCst);
    rt.mutexes().unlock(m)?;
    expect_eq(join(rt, t)?, 1, "busy, then acquired only after unlock")
}

fn handle_reuse(_rt: &Runtime) -> Outcome {
    let registry = Registry::new("scenario", 4);
    let old = registry.allocate("old")?;
    registry.release(old, true)?;
    let new = registry.allocate("new")?;
    ensure(old != new, "recycled handle equals the released one")?;
    expect_eq(registry.lookup(old).err(), Some(Error::InvalidHandle), "stale lookup")?;
    expect_eq(*registry.lookup(new)?, "new", "fresh lookup")
}

fn cleanup_order(rt: &Runtime) -> Outcome {
    let tape = Tape::default();
    let (worker, t2) = (rt.clone(), tape.clone());
    let t = rt.threads().create(ThreadAttr::new(), move || {
        for tag in ['A', 'B', 'C', 'D'] {
            let _ = worker.threads().cleanup_push(t2.recorder(tag));
        }
        worker.threads().exit(0)
    })?;
    join(rt, t)?;
    expect_eq(tape.contents(), "DCBA".to_string(), "cleanup order")
}

fn cleanup_selectivity(rt: &Runtime) -> Outcome {
    let tape = Tape::default();
    let (worker, t2) = (rt.clone(), tape.clone());
    let t = rt.threads().create(ThreadAttr::new(), move || {
        let threads = worker.threads();
        for tag in ['A', 'B', 'C', 'D'] {
            let _ = threads.cleanup_push(t2.recorder(tag));
        }
        for execute in [false, true, false, true] {
            let _ = threads.cleanup_pop(execute);
        }
        0
    })?;
    join(rt, t)?;
    expect_eq(tape.contents(), "CA".to_string(), "executed handlers")
}

fn cleanup_asymmetry(rt: &Runtime) -> Outcome {
    let tape = Tape::default();
    let (worker, t2) = (rt.clone(), tape.clone());
    let t = rt.threads().create(ThreadAttr::new(), move || {
        for tag in ['A', 'B'] {
            let _ = worker.threads().cleanup_push(t2.recorder(tag));
        }
        0
    })?;
    join(rt, t)?;
    expect_eq(tape.contents(), String::new(), "handlers run on normal return")
}

fn condvar_wakeup(rt: &Runtime) -> Outcome {
    let m = rt.mutexes().init(MutexKind::Normal)?;
    let c = rt.conds().init()?;
    let ready = Arc::new(AtomicBool::new(false));
    let (worker, flag) = (rt.clone(), Arc::clone(&ready));
    let t = rt.threads().create(ThreadAttr::new(), move || {
        let mutexes = worker.mutexes();
        if mutexes.lock(m).is_err() {
            return 0;
        }
        while !flag.load(Ordering::SeqCst) {
            if worker.conds().wait(c, m).is_err() {
                return 0;
            }
        }
        let held = mutexes
            .info(m)
            .is_ok_and(|i| i.owner == Some(current_task()));
        let _ = mutexes.unlock(m);
        usize::from(held)
    })?;
    wait_until("waiter", || rt.conds().waiters(c).is_ok_and(|n| n == 1))?;
    let signaled = Instant::now();
    rt.mutexes().lock(m)?;
    ready.store(true, Ordering::SeqCst);
    rt.conds().signal(c)?;
    rt.mutexes().unlock(m)?;
    expect_eq(join(rt, t)?, 1, "mutex held after wait")?;
    ensure(
        signaled.elapsed() < Duration::from_secs(1),
        "wake-up took longer than a second",
    )
}

static TLS_CALLS: AtomicUsize = AtomicUsize::new(0);
static TLS_LAST: AtomicUsize = AtomicUsize::new(0);

fn record_tls(value: usize) {
    TLS_CALLS.fetch_add(1, Ordering::SeqCst);
    TLS_LAST.store(value, Ordering::SeqCst);
}

fn tls_destructor(rt: &Runtime) -> Outcome {
    let key = rt.keys().key_create(Some(record_tls))?;
    let before = TLS_CALLS.load(Ordering::SeqCst);
    let worker = rt.clone();
    let t = rt.threads().create(ThreadAttr::new(), move || {
        for value in [3, 5, 8] {
            let _ = worker.keys().set_specific(key, value);
        }
        0
    })?;
    join(rt, t)?;
    expect_eq(TLS_CALLS.load(Ordering::SeqCst) - before, 1, "destructor calls")?;
    expect_eq(TLS_LAST.load(Ordering::SeqCst), 8, "destructor value")?;
    rt.keys().key_delete(key)?;
    Ok(())
}

static USR1_HITS: AtomicUsize = AtomicUsize::new(0);

fn on_usr1(_sig: u32) {
    USR1_HITS.fetch_add(1, Ordering::SeqCst);
}

fn signal_checkpoint(rt: &Runtime) -> Outcome {
    let armed = Arc::new(AtomicBool::new(false));
    let go = Arc::new(AtomicBool::new(false));
    let (worker, a, g) = (rt.clone(), Arc::clone(&armed), Arc::clone(&go));
    let t = rt.threads().create(ThreadAttr::new(), move || {
        let threads = worker.threads();
        if threads.signal(SIGUSR1, SignalAction::Handler(on_usr1)).is_err() {
            return 0;
        }
        a.store(true, Ordering::SeqCst);
        while !g.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        threads.deliver_pending().unwrap_or(0)
    })?;
    wait_until("handler install", || armed.load(Ordering::SeqCst))?;
    let before = USR1_HITS.load(Ordering::SeqCst);
    expect_eq(rt.threads().raise(t, SIGUSR1)?, true, "signal queued")?;
    expect_eq(
        USR1_HITS.load(Ordering::SeqCst),
        before,
        "handler ran in the raiser",
    )?;
    go.store(true, Ordering::SeqCst);
    expect_eq(join(rt, t)?, 1, "handlers run at checkpoint")
}

fn cancel(rt: &Runtime) -> Outcome {
    let tape = Tape::default();
    let (worker, t2) = (rt.clone(), tape.clone());
    let t = rt.threads().create(ThreadAttr::new(), move || {
        let _ = worker.threads().cleanup_push(t2.recorder('X'));
        loop {
            let _ = worker.threads().sleep(Duration::from_millis(5));
        }
    })?;
    rt.threads().cancel(t)?;
    expect_eq(join(rt, t)?, CANCELED, "exit value")?;
    expect_eq(tape.contents(), "X".to_string(), "cleanup on cancel")
}

fn end_to_end(rt: &Runtime) -> Outcome {
    let m = rt.mutexes().init(MutexKind::Recursive)?;
    let tape = Tape::default();
    let (worker, t2) = (rt.clone(), tape.clone());
    let t = rt.threads().create(ThreadAttr::new(), move || {
        let _ = worker.threads().cleanup_push(t2.recorder('C'));
        let _ = worker.mutexes().lock(m);
        let _ = worker.mutexes().lock(m);
        let _ = worker.mutexes().unlock(m);
        worker.threads().exit(1)
    })?;
    expect_eq(join(rt, t)?, 1, "exit value")?;
    expect_eq(tape.contents(), "C".to_string(), "cleanup ran")?;
    let info = rt.mutexes().info(m)?;
    ensure(info.locked, "mutex released by exit")?;
    expect_eq(info.recursion_count, 1, "recursion count")?;
    rt.mutexes().destroy(m)?;
    expect_eq(rt.mutexes().info(m).err(), Some(Error::InvalidHandle), "after destroy")
}
