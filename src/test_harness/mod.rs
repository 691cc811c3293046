//! Fixtures shared by unit tests: a graph rooted in a temp directory whose
//! workers run in-process.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::core::{Formula, FormulaId, NodeId};
use crate::daemon::agent::Host;
use crate::daemon::cancel::{CancelReason, CancelToken};
use crate::daemon::gateway::NoDialer;
use crate::daemon::graph::{Graph, GraphOptions};
use crate::daemon::worker::{
    LaunchedWorker, WorkerError, WorkerLauncher, WorkerSettings, WorkerSpec,
};
use crate::paths::DaemonPaths;
use crate::worker::InProcessLauncher;

pub const TEST_MAX_FRAME_BYTES: usize = 1 << 20;

/// Counts launches (and workers not yet exited) and delegates to another
/// launcher.
pub struct CountingLauncher {
    inner: Arc<dyn WorkerLauncher>,
    launches: AtomicUsize,
    live: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingLauncher {
    pub fn new(inner: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            inner,
            launches: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    /// Sleep before each launch, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait for the live count to drop to `expected`.
    pub fn wait_for_live(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.live() != expected {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

impl Default for CountingLauncher {
    fn default() -> Self {
        Self::new(Arc::new(InProcessLauncher))
    }
}

impl WorkerLauncher for CountingLauncher {
    fn launch(&self, spec: &WorkerSpec, cancel: &CancelToken) -> Result<LaunchedWorker, WorkerError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let launched = self.inner.launch(spec, cancel)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        let live = Arc::clone(&self.live);
        launched.exited.on_cancel(move |_| {
            live.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(launched)
    }
}

pub struct TestGraph {
    pub graph: Arc<Graph>,
    pub root: CancelToken,
    pub launcher: Arc<CountingLauncher>,
    dir: TempDir,
}

impl TestGraph {
    pub fn new() -> Self {
        Self::with_launcher(CountingLauncher::default())
    }

    pub fn with_launcher(launcher: CountingLauncher) -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let launcher = Arc::new(launcher);
        let root = CancelToken::new();
        let graph = Graph::new(
            GraphOptions {
                node: NodeId::generate(),
                paths: DaemonPaths::rooted(dir.path()),
                launcher: launcher.clone(),
                dialer: Arc::new(NoDialer),
                settings: WorkerSettings {
                    grace_period: Duration::from_secs(2),
                    max_frame_bytes: TEST_MAX_FRAME_BYTES,
                },
            },
            &root,
        );
        Self {
            graph,
            root,
            launcher,
            dir,
        }
    }

    pub fn paths(&self) -> DaemonPaths {
        DaemonPaths::rooted(self.dir.path())
    }

    pub fn host(&self) -> Arc<Host> {
        self.graph
            .root_host()
            .unwrap_or_else(|e| panic!("root host: {e}"))
    }

    pub fn formulate(&self, formula: Formula) -> FormulaId {
        self.graph
            .formulate(&formula)
            .unwrap_or_else(|e| panic!("formulate: {e}"))
    }

    /// Formula records on disk.
    pub fn formula_count(&self) -> usize {
        count_files(&self.paths().formulas_dir())
    }
}

impl Default for TestGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestGraph {
    fn drop(&mut self) {
        self.root.cancel(CancelReason::shutdown("test finished"));
    }
}

fn count_files(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}
