//! Maintenance loop: reclaims emptied pages and evicts under pressure.
//!
//! The loop sleeps until signaled by the write path (page exhaustion or a
//! low free count) or by a delete that drained a page. A signal raised while
//! a pass is running is remembered and triggers another pass.

use crate::allocator::{self, LOW_WATER};
use crate::engine::Shared;
use crate::metrics;
use crate::page::PageStatus;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct MaintState {
    pending: bool,
    shutdown: bool,
}

/// Wakeup signal for the maintenance thread.
#[derive(Default)]
pub(crate) struct Maintenance {
    state: Mutex<MaintState>,
    cond: Condvar,
}

impl Maintenance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass.
    pub fn wake(&self) {
        self.state.lock().pending = true;
        self.cond.notify_one();
    }

    /// Ask the loop to exit after any pass in progress.
    pub fn stop(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_one();
    }

    /// Block until a pass is requested. Returns `false` on shutdown.
    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while !state.pending && !state.shutdown {
            self.cond.wait(&mut state);
        }
        if state.shutdown {
            return false;
        }
        state.pending = false;
        true
    }
}

/// Body of the maintenance thread.
pub(crate) fn run(shared: Arc<Shared>) {
    debug!("maintenance started");
    while shared.maint.wait() {
        run_pass(&shared);
    }
    debug!("maintenance stopped");
}

/// Outcome of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PassReport {
    /// Pages returned to the free stack by the scan.
    pub freed: usize,
    /// Page closed for eviction, if any.
    pub evicted: Option<u32>,
}

/// Scan every page once, freeing drained pages, and close the least
/// populated Draining page if the free stack was empty when the pass
/// started.
pub(crate) fn run_pass(shared: &Shared) -> PassReport {
    let mut report = PassReport::default();

    let free = shared.state.lock().table.free_count();
    if free > LOW_WATER {
        return report;
    }
    let evict = free == 0;

    metrics::MAINT_PASSES.increment();

    // (page id, object count) of the best eviction candidate
    let mut victim: Option<(u32, u64)> = None;

    for page in &shared.pages {
        let mut inner = page.lock();
        match inner.status {
            PageStatus::Free | PageStatus::Active => continue,
            PageStatus::Closed => {
                if inner.refcount == 0 {
                    allocator::free_page(shared, page, &mut inner);
                    report.freed += 1;
                }
            }
            PageStatus::Draining => {
                if inner.object_count == 0 {
                    if inner.refcount == 0 {
                        allocator::free_page(shared, page, &mut inner);
                        report.freed += 1;
                    }
                } else if victim.is_none_or(|(_, count)| inner.object_count < count) {
                    victim = Some((page.id(), inner.object_count));
                }
            }
        }
    }

    if evict && let Some((page_id, _)) = victim {
        report.evicted = evict_page(shared, page_id);
    }

    debug!(
        free,
        freed = report.freed,
        evicted = ?report.evicted,
        "maintenance pass"
    );
    report
}

/// Close a Draining page, freeing it now if no reader holds it.
fn evict_page(shared: &Shared, page_id: u32) -> Option<u32> {
    let page = &shared.pages[page_id as usize];
    let mut inner = page.lock();

    // the page may have changed since the scan released its lock
    if inner.status != PageStatus::Draining {
        return None;
    }

    inner.status = PageStatus::Closed;
    metrics::PAGES_EVICTED.increment();
    info!(
        page_id,
        version = inner.version,
        objects = inner.object_count,
        refcount = inner.refcount,
        "evicting page"
    );

    if inner.refcount == 0 {
        allocator::free_page(shared, page, &mut inner);
    }
    Some(page_id)
}
