//! Engine context, thread registry and finalization.
//!
//! The engine is an explicit context object constructed once at startup by
//! the [`crate::Locksentry`] builder and handed to the monitor thread and the
//! signal handlers. The tracked primitives reach it through a single
//! install-once handle; until one is installed they behave like plain locks.

use crate::core::analyzer::{self, Analysis, live};
use crate::core::prevention::{self, Prevention, SharedLock};
use crate::core::recorder::{Dependency, HoldingSample, ThreadState};
use crate::core::types::{DeadlockInfo, LockId, MAX_INIT_STACK_DEPTH, ThreadIndex};
use crate::core::{callstack, logger, signals};
use anyhow::{Context as _, Result};
use crossbeam_channel::Sender;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::panic::Location;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Callback invoked with every confirmed live deadlock.
pub type DeadlockCallback = Box<dyn Fn(DeadlockInfo) + Send + Sync + 'static>;

static ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

thread_local! {
    static CURRENT_SLOT: RefCell<Option<Arc<ThreadSlot>>> = const { RefCell::new(None) };
}

/// Per-thread registry slot.
///
/// The sampling fields are read by the monitor without locking; everything
/// else sits behind the state mutex, which the owning thread takes briefly
/// on every hook and the monitor only ever `try_lock`s.
pub struct ThreadSlot {
    pub index: ThreadIndex,
    pub active: AtomicBool,
    pub sample: HoldingSample,
    pub state: Mutex<ThreadState>,
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Arc<ThreadSlot>>,
    free: Vec<ThreadIndex>,
    // Dependency stores of joined threads, in retirement order
    retired: Vec<Vec<Dependency>>,
}

/// Thread-index allocation and the identity map, guarded by one
/// process-wide mutex taken briefly at spawn and join.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    alive: AtomicUsize,
    single: AtomicBool,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            inner: Mutex::new(RegistryInner::default()),
            alive: AtomicUsize::new(0),
            single: AtomicBool::new(true),
        }
    }

    /// Allocate a slot for the calling thread, reusing a joined thread's
    /// index when one is free.
    pub fn register(&self) -> Arc<ThreadSlot> {
        let mut inner = self.inner.lock();
        let slot = match inner.free.pop() {
            Some(index) => {
                let slot = Arc::clone(&inner.slots[index]);
                *slot.state.lock() = ThreadState::default();
                slot.sample.last_held.store(0, Ordering::Relaxed);
                slot.sample.depth.store(0, Ordering::Relaxed);
                slot.active.store(true, Ordering::SeqCst);
                slot
            }
            None => {
                let slot = Arc::new(ThreadSlot {
                    index: inner.slots.len(),
                    active: AtomicBool::new(true),
                    sample: HoldingSample::default(),
                    state: Mutex::new(ThreadState::default()),
                });
                inner.slots.push(Arc::clone(&slot));
                slot
            }
        };
        drop(inner);
        if self.alive.fetch_add(1, Ordering::SeqCst) + 1 > 1 {
            self.single.store(false, Ordering::SeqCst);
        }
        slot
    }

    /// Retire a joined thread: move its dependency store to the aggregation
    /// queue and free its index for reuse.
    pub fn retire(&self, slot: &ThreadSlot) {
        if !slot.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let deps = slot.state.lock().take_deps();
        let mut inner = self.inner.lock();
        inner.retired.push(deps);
        inner.free.push(slot.index);
        drop(inner);
        if self.alive.fetch_sub(1, Ordering::SeqCst) - 1 <= 1 {
            self.single.store(true, Ordering::SeqCst);
        }
    }

    /// While effectively single-threaded no dependencies are recorded.
    pub fn is_single_thread(&self) -> bool {
        self.single.load(Ordering::Relaxed)
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn active_slots(&self) -> Vec<Arc<ThreadSlot>> {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }

    // Retired stores plus whatever the still-active threads have recorded.
    fn drain_for_analysis(&self) -> Vec<Vec<Dependency>> {
        let mut inner = self.inner.lock();
        let mut streams = std::mem::take(&mut inner.retired);
        for slot in &inner.slots {
            if slot.active.load(Ordering::SeqCst) {
                streams.push(slot.state.lock().take_deps());
            }
        }
        streams
    }
}

// Executes the deadlock callback on its own thread so a deadlocked or
// exiting detector thread never blocks callback delivery.
pub(crate) struct Dispatcher {
    sender: Sender<DeadlockInfo>,
}

impl Dispatcher {
    fn new(callback: DeadlockCallback) -> Dispatcher {
        let (sender, receiver) = crossbeam_channel::unbounded::<DeadlockInfo>();
        std::thread::spawn(move || {
            while let Ok(info) = receiver.recv() {
                callback(info);
            }
        });
        Dispatcher { sender }
    }

    pub(crate) fn send(&self, info: DeadlockInfo) {
        let _ = self.sender.send(info);
    }
}

// Captured initialization stack and redirection decision for one
// `Mutex::new` call site. Locks created at an already-seen site reuse both
// instead of re-capturing.
struct InitSite {
    stack: Vec<usize>,
    slot: Option<usize>,
}

/// Startup configuration assembled by the builder.
pub struct EngineConfig {
    pub history_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    #[cfg(feature = "report-file")]
    pub report_path: Option<PathBuf>,
    pub live_detection: bool,
    pub callback: DeadlockCallback,
}

/// The engine: registry, prevention state and finalization entry point.
pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) prevention: Option<Prevention>,
    history_path: Option<PathBuf>,
    log_path: Option<PathBuf>,
    #[cfg(feature = "report-file")]
    report_path: Option<PathBuf>,
    init_stacks: Mutex<FxHashMap<LockId, Vec<usize>>>,
    init_sites: Mutex<FxHashMap<usize, Arc<InitSite>>>,
    dispatcher: Dispatcher,
    finalized: AtomicBool,
}

impl Engine {
    /// Construct and install the engine. Fails if one is already installed.
    pub(crate) fn start(config: EngineConfig) -> Result<Arc<Engine>> {
        let prevention = match &config.history_path {
            Some(path) if path.exists() => match Prevention::load(path) {
                Ok(p) => p,
                Err(err) => {
                    eprintln!("locksentry: prevention disabled: {err}");
                    None
                }
            },
            _ => None,
        };

        let engine = Arc::new(Engine {
            registry: Registry::new(),
            prevention,
            history_path: config.history_path,
            log_path: config.log_path,
            #[cfg(feature = "report-file")]
            report_path: config.report_path,
            init_stacks: Mutex::new(FxHashMap::default()),
            init_sites: Mutex::new(FxHashMap::default()),
            dispatcher: Dispatcher::new(config.callback),
            finalized: AtomicBool::new(false),
        });

        if ENGINE.set(Arc::clone(&engine)).is_err() {
            anyhow::bail!("locksentry is already started");
        }

        // The calling thread becomes slot 0.
        let slot = engine.registry.register();
        CURRENT_SLOT.with(|cell| *cell.borrow_mut() = Some(slot));

        signals::install(Arc::clone(&engine)).context("failed to install signal handlers")?;

        if let Some(p) = &engine.prevention {
            eprintln!(
                "locksentry: prevention enabled, {} merge set(s), {} recorded init site(s)",
                p.group_count(),
                p.site_count()
            );
        }
        if config.live_detection {
            let _monitor = live::spawn_monitor(Arc::clone(&engine));
        }
        Ok(engine)
    }

    /// The installed engine, if any.
    pub(crate) fn installed() -> Option<&'static Arc<Engine>> {
        ENGINE.get()
    }

    /// Slot of the calling thread, registering it lazily so acquisitions on
    /// threads not spawned through the tracked API are still observed.
    pub(crate) fn current_slot(&self) -> Arc<ThreadSlot> {
        CURRENT_SLOT.with(|cell| {
            let mut slot = cell.borrow_mut();
            match &*slot {
                Some(s) => Arc::clone(s),
                None => {
                    let s = self.registry.register();
                    *slot = Some(Arc::clone(&s));
                    s
                }
            }
        })
    }

    pub(crate) fn adopt_slot(slot: Arc<ThreadSlot>) {
        CURRENT_SLOT.with(|cell| *cell.borrow_mut() = Some(slot));
    }

    pub(crate) fn dispatch(&self, info: DeadlockInfo) {
        self.dispatcher.send(info);
    }

    /// Record a mutex initialization: capture the init stack (memoized per
    /// call site) and consult the prevention engine. Returns the shared lock
    /// to redirect to, if any.
    pub(crate) fn on_lock_init(
        &self,
        id: LockId,
        site: &'static Location<'static>,
    ) -> Option<Arc<SharedLock>> {
        let key = site as *const Location<'static> as usize;
        let known = self.init_sites.lock().get(&key).cloned();
        let info = match known {
            Some(info) => info,
            None => {
                let stack = callstack::capture(MAX_INIT_STACK_DEPTH);
                let slot = self.prevention.as_ref().and_then(|p| p.match_stack(&stack));
                let info = Arc::new(InitSite { stack, slot });
                self.init_sites.lock().insert(key, Arc::clone(&info));
                info
            }
        };
        self.init_stacks.lock().insert(id, info.stack.clone());
        info.slot
            .map(|slot| self.prevention.as_ref().expect("slot without prevention").shared_for(slot))
    }

    /// Run the offline analysis once: aggregate, detect, report, and in
    /// prevention mode rewrite the deadlock history.
    ///
    /// Returns `None` if finalization already ran.
    pub fn finalize(&self) -> Option<Analysis> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return None;
        }
        let streams = self.registry.drain_for_analysis();
        if streams.len() < 2 {
            return Some(Analysis::default());
        }

        if let Some(path) = &self.log_path {
            if let Err(err) = logger::write_dependency_log(path, &streams) {
                eprintln!("locksentry: failed to write dependency log: {err}");
            }
        }

        let global = analyzer::aggregate(&streams);
        let mut analysis = Analysis {
            unique_dependencies: global.unique(),
            ..Analysis::default()
        };
        if global.unique() < 2 {
            return Some(analysis);
        }

        let detection = analyzer::detect(&streams);
        for cycle in &detection.cycles {
            let chain: Vec<String> = cycle.locks.iter().map(|l| format!("{l:#x}")).collect();
            eprintln!("Deadlock:\n  {} ->", chain.join(" -> "));
        }

        #[cfg(feature = "report-file")]
        if let Some(path) = &self.report_path {
            if let Err(err) = analyzer::write_report(path, &detection.cycles) {
                eprintln!("locksentry: failed to write report: {err}");
            }
        }

        if let Some(path) = &self.history_path {
            let written = std::fs::File::create(path)
                .map_err(anyhow::Error::from)
                .and_then(|mut file| {
                    prevention::generate_history(
                        &mut file,
                        detection.pending_merges.clone(),
                        &global,
                        &self.init_stacks.lock(),
                        self.prevention.as_ref(),
                    )
                    .map_err(anyhow::Error::from)
                });
            if let Err(err) = written {
                eprintln!("locksentry: failed to write deadlock history: {err}");
            }
        }

        analysis.reported = detection.reported;
        analysis.cycles = detection.cycles;
        Some(analysis)
    }
}
