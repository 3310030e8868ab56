//! Control-plane state and the reconfiguration entry points.
//!
//! [`Core`] lives on the control thread. It owns the publishers for the three
//! hot-swappable resource kinds, the private loading catalog and the worker
//! pool. Every change follows the same shape: build the new generation off to
//! the side, publish it, wait (bounded) for every worker to echo past the old
//! one, release the old one.

use std::cell::Cell;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::adapter::AdapterFactory;
use crate::catalog::Catalog;
use crate::config::{CapabilityFlags, Configuration, QuiescenceConfig};
use crate::error::{CoreError, Result};
use crate::generation::{Generation, Publisher, ResourceKind, still_holds};
use crate::handler::QueryHandler;
use crate::quiescence::{Progress, await_quiescence};
use crate::raw::{RawSet, build_raw_set};
use crate::socket::{SocketSet, build_socket_set};
use crate::worker::{WorkerContext, WorkerState, WorkerThread, cpu_for};
use crate::zonefile::{LoadStats, ZonefileLoader};

/// Process-wide control-plane root.
///
/// Not `Sync`: only the thread that owns it may reconfigure, and every entry
/// point takes `&mut self`.
pub struct Core {
    flags: CapabilityFlags,
    adapters: Arc<dyn AdapterFactory>,
    handler: Arc<dyn QueryHandler>,
    sockets: Publisher<SocketSet>,
    raw: Publisher<RawSet>,
    catalog: Publisher<Catalog>,
    db_load: Catalog,
    workers: Vec<WorkerThread>,
    _control_thread: PhantomData<Cell<()>>,
}

impl Core {
    /// Initialise an idle core: empty socket and raw sets, an empty catalog
    /// and no workers.
    pub fn new(
        flags: CapabilityFlags,
        adapters: Arc<dyn AdapterFactory>,
        handler: Arc<dyn QueryHandler>,
    ) -> Self {
        info!(
            pfring = flags.pfring,
            sendq = flags.sendq,
            offline = flags.offline,
            packet_trace = flags.packet_trace,
            "core initialised"
        );
        Self {
            flags,
            adapters,
            handler,
            sockets: Publisher::new(ResourceKind::Sockets, Vec::new()),
            raw: Publisher::new(ResourceKind::Raw, Vec::new()),
            catalog: Publisher::new(ResourceKind::Catalog, Catalog::new()),
            db_load: Catalog::new(),
            workers: Vec::new(),
            _control_thread: PhantomData,
        }
    }

    /// Replace the socket set and raw set where `new` differs from `old`.
    ///
    /// Both replacements are built before either is published; if any bind or
    /// adapter open fails, nothing is published and the previous generations
    /// keep serving.
    pub fn change_worker_sockets(&mut self, new: &Configuration, old: &Configuration) -> Result<()> {
        let sockets_changed = new.listen != old.listen;
        let raw_changed = new.interfaces != old.interfaces;
        if !sockets_changed && !raw_changed {
            debug!("socket configuration unchanged");
            return Ok(());
        }

        let sockets = if sockets_changed {
            let previous = self.sockets.current();
            Some(build_socket_set(&new.listen, previous.value())?)
        } else {
            None
        };
        let raw = if raw_changed {
            Some(build_raw_set(&new.interfaces, self.adapters.as_ref(), &self.flags)?)
        } else {
            None
        };

        if let Some(set) = sockets {
            let count = set.len();
            let generation = self.sockets.publish(set);
            info!(generation, sockets = count, "published socket set");
        }
        if let Some(set) = raw {
            let count = set.len();
            let generation = self.raw.publish(set);
            info!(generation, adapters = count, "published raw set");
        }

        if sockets_changed {
            settle_or_defer(&mut self.sockets, &mut self.workers, &new.quiescence);
        }
        if raw_changed {
            settle_or_defer(&mut self.raw, &mut self.workers, &new.quiescence);
        }
        Ok(())
    }

    /// Grow or shrink the worker pool to `new.worker_threads`.
    ///
    /// The delta is taken against the pool as it actually is, so a repeated
    /// or stale `old` never spawns or stops the wrong number of workers.
    /// Workers that died since the last look are dropped first, so growing
    /// back replaces them.
    pub fn change_worker_threads(&mut self, new: &Configuration, old: &Configuration) -> Result<()> {
        reap_exited(&mut self.workers);
        let current = self.workers.len();
        let target = new.worker_threads;
        if old.worker_threads != current {
            debug!(
                configured = old.worker_threads,
                running = current,
                "previous configuration disagrees with running pool"
            );
        }

        if target == current {
            debug!(workers = current, "worker pool unchanged");
            return Ok(());
        }
        if target > current {
            self.grow(target, new.cpu_pinning)?;
        } else {
            self.shrink(target)?;
        }
        info!(from = current, to = self.workers.len(), "resized worker pool");
        Ok(())
    }

    /// Spawn workers into the lowest free indices until the pool holds
    /// `target`. The pool stays ordered by index.
    fn grow(&mut self, target: usize, pinning: bool) -> Result<()> {
        let start = self.workers.len();
        let taken = self.worker_indices();
        let free: Vec<usize> = (0..)
            .filter(|index| !taken.contains(index))
            .take(target - start)
            .collect();
        let ctx = self.worker_context();

        let mut spawned = Vec::with_capacity(free.len());
        for index in free {
            let cpu = pinning.then(|| cpu_for(index));
            match WorkerThread::spawn(index, cpu, &ctx) {
                Ok(worker) => spawned.push(worker),
                Err(e) => {
                    warn!(index, error = %e, "spawn failed, rolling pool back to {start} workers");
                    if let Err(stop_err) = stop_workers(spawned) {
                        warn!(error = %stop_err, "rollback worker did not stop cleanly");
                    }
                    self.reclaim_now();
                    return Err(e);
                }
            }
        }
        self.workers.extend(spawned);
        self.workers.sort_by_key(WorkerThread::index);
        Ok(())
    }

    fn shrink(&mut self, target: usize) -> Result<()> {
        // Removed workers stay in the pool, and keep gating reclamation,
        // until they have been joined.
        for worker in &self.workers[target..] {
            worker.request_exit();
        }
        let mut result = Ok(());
        for worker in &mut self.workers[target..] {
            if let Err(e) = worker.join() {
                warn!(index = worker.index(), error = %e, "worker did not exit cleanly");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.workers.truncate(target);
        self.reclaim_now();
        result
    }

    /// The private catalog for the zonefile loader to fill.
    pub fn catalog_loading(&mut self) -> &mut Catalog {
        &mut self.db_load
    }

    /// Load every configured zonefile into a fresh `db_load` and, if that
    /// succeeds, swap it in as the serving catalog.
    ///
    /// On failure the partially filled catalog is discarded and the serving
    /// catalog is left untouched.
    pub fn reload_catalog(&mut self, config: &Configuration, loader: &dyn ZonefileLoader) -> Result<LoadStats> {
        self.db_load = Catalog::new();
        match loader.parse_all(&mut self.db_load, config) {
            Ok(stats) => {
                self.swap_catalog(&config.quiescence);
                Ok(stats)
            }
            Err(e) => {
                self.db_load = Catalog::new();
                warn!(
                    error = %e,
                    generation = self.catalog.current_id(),
                    "zonefile load failed, keeping current catalog"
                );
                Err(e.into())
            }
        }
    }

    /// Publish `db_load` as the serving catalog and retire the previous one.
    /// Leaves an empty `db_load` behind. Returns the new generation id.
    pub fn swap_catalog(&mut self, quiescence: &QuiescenceConfig) -> u64 {
        let loaded = std::mem::take(&mut self.db_load);
        let zones = loaded.zone_count();
        let records = loaded.record_count();
        let generation = self.catalog.publish(loaded);
        info!(generation, zones, records, "published catalog");

        settle_or_defer(&mut self.catalog, &mut self.workers, quiescence);
        generation
    }

    /// Wait for and release every retiring generation of every kind.
    ///
    /// Returns the number of generations released, or the first error: a
    /// stall, or a worker found dead along the way.
    pub fn reclaim_retired(&mut self, quiescence: &QuiescenceConfig) -> Result<usize> {
        let sockets = settle(&mut self.sockets, &mut self.workers, quiescence);
        let raw = settle(&mut self.raw, &mut self.workers, quiescence);
        let catalog = settle(&mut self.catalog, &mut self.workers, quiescence);
        Ok(sockets? + raw? + catalog?)
    }

    /// Release whatever is already quiescent, without waiting.
    fn reclaim_now(&mut self) {
        reclaim_once(&mut self.sockets, &mut self.workers);
        reclaim_once(&mut self.raw, &mut self.workers);
        reclaim_once(&mut self.catalog, &mut self.workers);
    }

    /// Stop and join every worker, then release all retiring generations.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() && self.pending_total() == 0 {
            return;
        }
        let count = self.workers.len();
        if let Err(e) = stop_workers(std::mem::take(&mut self.workers)) {
            warn!(error = %e, "worker did not exit cleanly");
        }
        self.reclaim_now();
        info!(workers = count, "core shut down");
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            sockets: self.sockets.slot().clone(),
            raw: self.raw.slot().clone(),
            catalog: self.catalog.slot().clone(),
            handler: self.handler.clone(),
            flags: self.flags,
        }
    }

    pub fn flags(&self) -> &CapabilityFlags {
        &self.flags
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_indices(&self) -> Vec<usize> {
        self.workers.iter().map(WorkerThread::index).collect()
    }

    pub fn worker_cpus(&self) -> Vec<Option<usize>> {
        self.workers.iter().map(WorkerThread::cpu).collect()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(WorkerThread::state).collect()
    }

    /// Queries answered by each worker so far.
    pub fn answered(&self) -> Vec<u64> {
        self.workers.iter().map(|w| w.shared().answered()).collect()
    }

    /// Every worker's current echo for `kind`.
    pub fn echoes(&self, kind: ResourceKind) -> Vec<u64> {
        echo_snapshot(&self.workers, kind)
    }

    pub fn socket_generation(&self) -> u64 {
        self.sockets.current_id()
    }

    pub fn raw_generation(&self) -> u64 {
        self.raw.current_id()
    }

    pub fn catalog_generation(&self) -> u64 {
        self.catalog.current_id()
    }

    /// The serving catalog.
    pub fn catalog(&self) -> Arc<Generation<Catalog>> {
        self.catalog.current()
    }

    /// Local addresses of the serving socket set, in configuration order.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.current().iter().map(|s| s.local_addr()).collect()
    }

    /// Interface names of the serving raw set.
    pub fn raw_interfaces(&self) -> Vec<String> {
        self.raw
            .current()
            .iter()
            .map(|item| item.ifname().to_string())
            .collect()
    }

    /// Retired generations of `kind` not yet released.
    pub fn pending_retirements(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Sockets => self.sockets.pending_count(),
            ResourceKind::Raw => self.raw.pending_count(),
            ResourceKind::Catalog => self.catalog.pending_count(),
        }
    }

    fn pending_total(&self) -> usize {
        ResourceKind::ALL
            .iter()
            .map(|&kind| self.pending_retirements(kind))
            .sum()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn echo_snapshot(workers: &[WorkerThread], kind: ResourceKind) -> Vec<u64> {
    workers
        .iter()
        .map(|w| w.shared().echo(kind).load())
        .collect()
}

fn laggards(workers: &[WorkerThread], kind: ResourceKind, generation: u64) -> Vec<usize> {
    workers
        .iter()
        .filter(|w| still_holds(w.shared().echo(kind).load(), generation))
        .map(WorkerThread::index)
        .collect()
}

/// Join and drop every worker whose thread has finished on its own. Its
/// echo no longer gates reclamation. Returns the indices that panicked.
fn reap_exited(workers: &mut Vec<WorkerThread>) -> Vec<usize> {
    let mut panicked = Vec::new();
    workers.retain_mut(|worker| {
        if !worker.has_exited() {
            return true;
        }
        let index = worker.index();
        match worker.join() {
            Ok(()) => warn!(index, "worker exited unasked, removed from pool"),
            Err(e) => {
                error!(index, error = %e, "worker died, removed from pool");
                panicked.push(index);
            }
        }
        false
    });
    panicked
}

fn reclaim_once<T>(publisher: &mut Publisher<T>, workers: &mut Vec<WorkerThread>) -> (usize, Vec<usize>) {
    let panicked = reap_exited(workers);
    let echoes = echo_snapshot(workers, publisher.kind());
    (publisher.reclaim(&echoes), panicked)
}

/// Wait until every retiring generation of `publisher` is released.
///
/// Workers that die meanwhile are reaped so they cannot stall the wait; the
/// first one is reported once the wait is over.
fn settle<T>(
    publisher: &mut Publisher<T>,
    workers: &mut Vec<WorkerThread>,
    quiescence: &QuiescenceConfig,
) -> Result<usize> {
    let kind = publisher.kind();
    let mut released = 0;
    let mut panicked = Vec::new();
    await_quiescence(quiescence, kind, || {
        let (count, dead) = reclaim_once(publisher, workers);
        released += count;
        panicked.extend(dead);
        match publisher.oldest_pending() {
            None => Progress::Quiescent,
            Some(generation) => Progress::Waiting {
                generation,
                laggards: laggards(workers, kind, generation),
            },
        }
    })?;
    match panicked.first() {
        Some(&index) => Err(CoreError::WorkerPanicked(index)),
        None => Ok(released),
    }
}

/// Like [`settle`], but a stall only leaves the generation pending. The
/// stall has already been logged; a later reconfiguration or
/// [`Core::reclaim_retired`] picks it up again.
fn settle_or_defer<T>(publisher: &mut Publisher<T>, workers: &mut Vec<WorkerThread>, quiescence: &QuiescenceConfig) {
    if let Err(e) = settle(publisher, workers, quiescence) {
        debug!(error = %e, pending = publisher.pending_count(), "reclamation deferred");
    }
}

/// Request exit from every worker first, then join them all.
fn stop_workers(mut workers: Vec<WorkerThread>) -> Result<()> {
    for worker in &workers {
        worker.request_exit();
    }
    let mut first_err: Option<CoreError> = None;
    for worker in &mut workers {
        if let Err(e) = worker.join() {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapters;
    use crate::catalog::{Record, RecordType};
    use crate::config::InterfaceConfig;
    use crate::handler::RefusingHandler;
    use crate::zonefile::ZonefileError;

    fn core_with(adapters: Arc<MemoryAdapters>) -> Core {
        Core::new(
            CapabilityFlags::default(),
            adapters,
            Arc::new(RefusingHandler),
        )
    }

    #[test]
    fn test_new_core_is_idle() {
        let core = core_with(Arc::new(MemoryAdapters::new()));
        assert_eq!(core.worker_count(), 0);
        assert_eq!(core.socket_generation(), 1);
        assert_eq!(core.raw_generation(), 1);
        assert_eq!(core.catalog_generation(), 1);
        assert!(core.catalog().is_empty());
        for kind in ResourceKind::ALL {
            assert_eq!(core.pending_retirements(kind), 0);
        }
    }

    #[test]
    fn test_unchanged_sockets_publish_nothing() {
        let mut core = core_with(Arc::new(MemoryAdapters::new()));
        let config = Configuration::empty();
        core.change_worker_sockets(&config, &config).unwrap();
        assert_eq!(core.socket_generation(), 1);
        assert_eq!(core.raw_generation(), 1);
    }

    #[test]
    fn test_only_changed_kind_is_rebuilt() {
        let adapters = Arc::new(MemoryAdapters::new());
        let mut core = core_with(adapters.clone());
        let old = Configuration::empty();
        let new = Configuration {
            interfaces: vec![InterfaceConfig::new("eth0")],
            ..Configuration::empty()
        };

        core.change_worker_sockets(&new, &old).unwrap();
        assert_eq!(core.socket_generation(), 1);
        assert_eq!(core.raw_generation(), 2);
        assert_eq!(core.raw_interfaces(), vec!["eth0".to_string()]);
        assert_eq!(adapters.open_count(), 1);
    }

    #[test]
    fn test_swap_catalog_without_workers_releases_immediately() {
        let mut core = core_with(Arc::new(MemoryAdapters::new()));
        core.catalog_loading()
            .insert("example.com", Record::new("www.example.com", RecordType::A, 60, "192.0.2.1"));

        let generation = core.swap_catalog(&QuiescenceConfig::default());
        assert_eq!(generation, 2);
        assert_eq!(core.pending_retirements(ResourceKind::Catalog), 0);
        assert!(core.catalog().lookup("www.example.com", RecordType::A).is_some());
        assert!(core.catalog_loading().is_empty());
    }

    #[test]
    fn test_failed_reload_keeps_catalog() {
        let mut core = core_with(Arc::new(MemoryAdapters::new()));
        let failing = |db: &mut Catalog, _: &Configuration| -> std::result::Result<LoadStats, ZonefileError> {
            db.insert("half.test", Record::new("a.half.test", RecordType::A, 1, "192.0.2.9"));
            Err(ZonefileError::Syntax {
                path: "half.test.zone".into(),
                line: 2,
                message: "truncated".into(),
            })
        };

        let err = core
            .reload_catalog(&Configuration::empty(), &failing)
            .unwrap_err();
        assert!(matches!(err, CoreError::Zonefile(_)));
        assert_eq!(core.catalog_generation(), 1);
        assert!(core.catalog_loading().is_empty());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut core = core_with(Arc::new(MemoryAdapters::new()));
        let config = Configuration {
            worker_threads: 2,
            ..Configuration::empty()
        };
        core.change_worker_threads(&config, &Configuration::empty()).unwrap();
        assert_eq!(core.worker_count(), 2);

        core.shutdown();
        assert_eq!(core.worker_count(), 0);
        core.shutdown();
        assert_eq!(core.worker_count(), 0);
    }
}
