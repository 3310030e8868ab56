//! Data-plane worker threads.
//!
//! Each worker owns one OS thread, optionally pinned to a CPU. Once per loop
//! iteration it adopts whatever socket, raw and catalog generations the control
//! thread has published, echoes what it now holds, then drains its sockets and
//! adapters. It never blocks on the control thread.
//!
//! Lifecycle: `Created -> Running -> ExitRequested -> Joined`.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::catalog::Catalog;
use crate::config::CapabilityFlags;
use crate::error::{CoreError, Result};
use crate::frame;
use crate::generation::{Echo, Reader, ResourceKind, Slot};
use crate::handler::QueryHandler;
use crate::raw::{RawItem, RawSet};
use crate::socket::SocketSet;

/// Largest frame or datagram a worker reads in one go.
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Longest a worker sleeps after an iteration that handled nothing.
const IDLE_PARK: Duration = Duration::from_micros(200);

/// Lifecycle state of a worker as seen by the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    ExitRequested,
    Joined,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::ExitRequested => "exit-requested",
            WorkerState::Joined => "joined",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared between a worker and the control thread.
///
/// `should_end` is written only by the control thread; the echoes and
/// `running` only by the worker.
#[derive(Debug)]
pub struct WorkerShared {
    index: usize,
    should_end: AtomicBool,
    running: AtomicBool,
    echoes: [Echo; ResourceKind::COUNT],
    answered: AtomicU64,
}

impl WorkerShared {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            should_end: AtomicBool::new(false),
            running: AtomicBool::new(false),
            echoes: [Echo::new(), Echo::new(), Echo::new()],
            answered: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn echo(&self, kind: ResourceKind) -> &Echo {
        &self.echoes[kind.index()]
    }

    #[inline]
    pub fn should_end(&self) -> bool {
        self.should_end.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queries this worker has answered.
    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }
}

/// Published slots and collaborators every worker is started with.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub sockets: Arc<Slot<SocketSet>>,
    pub raw: Arc<Slot<RawSet>>,
    pub catalog: Arc<Slot<Catalog>>,
    pub handler: Arc<dyn QueryHandler>,
    pub flags: CapabilityFlags,
}

/// The generations one worker currently holds.
struct WorkerView {
    sockets: Reader<SocketSet>,
    raw: Reader<RawSet>,
    catalog: Reader<Catalog>,
}

impl WorkerView {
    /// Seed from the current generations; runs on the control thread.
    fn new(ctx: &WorkerContext, shared: &WorkerShared) -> Self {
        Self {
            sockets: Reader::new(ctx.sockets.clone(), shared.echo(ResourceKind::Sockets)),
            raw: Reader::new(ctx.raw.clone(), shared.echo(ResourceKind::Raw)),
            catalog: Reader::new(ctx.catalog.clone(), shared.echo(ResourceKind::Catalog)),
        }
    }

    fn refresh(&mut self, shared: &WorkerShared) {
        if self.sockets.refresh(shared.echo(ResourceKind::Sockets)) {
            debug!(index = shared.index, generation = self.sockets.current().id(), "adopted sockets");
        }
        if self.raw.refresh(shared.echo(ResourceKind::Raw)) {
            debug!(index = shared.index, generation = self.raw.current().id(), "adopted raw set");
        }
        if self.catalog.refresh(shared.echo(ResourceKind::Catalog)) {
            debug!(index = shared.index, generation = self.catalog.current().id(), "adopted catalog");
        }
    }
}

/// Per-thread packet loop state.
struct PacketLoop {
    shared: Arc<WorkerShared>,
    view: WorkerView,
    handler: Arc<dyn QueryHandler>,
    trace: bool,
    buf: Vec<u8>,
    response: Vec<u8>,
}

/// Marks a worker running for as long as it lives, including through a
/// panic unwinding out of the packet loop.
struct RunningFlag(Arc<WorkerShared>);

impl RunningFlag {
    fn raise(shared: Arc<WorkerShared>) -> Self {
        shared.running.store(true, Ordering::Release);
        Self(shared)
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        if thread::panicking() {
            warn!(index = self.0.index, "worker panicked");
        } else {
            debug!(index = self.0.index, "worker stopped");
        }
    }
}

impl PacketLoop {
    /// Loop until asked to end. Consumes the loop so every generation is
    /// released before the caller's [`RunningFlag`] drops.
    fn run(mut self) {
        debug!(index = self.shared.index, "worker running");
        while !self.shared.should_end() {
            self.view.refresh(&self.shared);
            if self.poll() == 0 {
                thread::park_timeout(IDLE_PARK);
            }
        }
    }

    /// One pass over every socket and adapter. Returns packets received.
    fn poll(&mut self) -> usize {
        let mut received = 0;
        let catalog = self.view.catalog.current().value();

        for item in self.view.sockets.current().iter() {
            match item.socket().recv_from(&mut self.buf) {
                Ok((len, peer)) => {
                    received += 1;
                    if self.trace {
                        trace!(index = self.shared.index, %peer, len, "datagram");
                    }
                    self.response.clear();
                    if !self.handler.answer(catalog, &self.buf[..len], &mut self.response) {
                        continue;
                    }
                    match item.socket().send_to(&self.response, peer) {
                        Ok(_) => {
                            self.shared.answered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => debug!(%peer, error = %e, "send failed"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => debug!(local = %item.local_addr(), error = %e, "receive failed"),
            }
        }

        for item in self.view.raw.current().iter() {
            match item.adapter().receive(&mut self.buf) {
                Ok(Some(len)) => {
                    received += 1;
                    let answered = answer_frame(
                        item,
                        &self.buf[..len],
                        catalog,
                        self.handler.as_ref(),
                        &mut self.response,
                        self.trace,
                    );
                    if answered {
                        self.shared.answered.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(ifname = %item.ifname(), error = %e, "receive failed"),
            }
        }

        received
    }
}

fn answer_frame(
    item: &RawItem,
    frame_bytes: &[u8],
    catalog: &Catalog,
    handler: &dyn QueryHandler,
    response: &mut Vec<u8>,
    trace: bool,
) -> bool {
    let Some(dgram) = frame::parse_udp(frame_bytes) else {
        return false;
    };
    if dgram.dst.port() != item.port() || !item.accepts(dgram.dst.ip()) {
        return false;
    }
    if trace {
        trace!(ifname = %item.ifname(), src = %dgram.src, len = dgram.payload.len(), "raw query");
    }

    response.clear();
    if !handler.answer(catalog, dgram.payload, response) {
        return false;
    }
    let Some(reply) = frame::build_udp_frame(
        item.mac(),
        item.reply_mac(dgram.src_mac),
        dgram.dst,
        dgram.src,
        response,
    ) else {
        return false;
    };
    match item.adapter().send(&reply) {
        Ok(()) => true,
        Err(e) => {
            debug!(ifname = %item.ifname(), error = %e, "send failed");
            false
        }
    }
}

/// CPUs this process may run on, in ascending order.
pub fn allowed_cpus() -> Vec<usize> {
    let allowed = match sched_getaffinity(Pid::from_raw(0)) {
        Ok(set) => (0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .collect(),
        Err(e) => {
            debug!(error = %e, "sched_getaffinity failed");
            Vec::new()
        }
    };
    if allowed.is_empty() {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        return (0..cpus).collect();
    }
    allowed
}

/// CPU a worker with `index` pins to: the `index`-th allowed CPU, wrapping.
pub fn cpu_for(index: usize) -> usize {
    let allowed = allowed_cpus();
    allowed[index % allowed.len()]
}

fn pin_to_cpu(cpu: usize) -> nix::Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// Control-thread handle on one worker.
pub struct WorkerThread {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
    cpu: Option<usize>,
}

impl WorkerThread {
    /// Spawn worker `index`, pinned to `cpu` if given.
    pub(crate) fn spawn(index: usize, cpu: Option<usize>, ctx: &WorkerContext) -> Result<Self> {
        let shared = Arc::new(WorkerShared::new(index));
        let packet_loop = PacketLoop {
            shared: shared.clone(),
            view: WorkerView::new(ctx, &shared),
            handler: ctx.handler.clone(),
            trace: ctx.flags.packet_trace,
            buf: vec![0u8; MAX_FRAME_SIZE],
            response: Vec::with_capacity(MAX_FRAME_SIZE),
        };

        let handle = thread::Builder::new()
            .name(format!("dns-worker-{index}"))
            .spawn(move || {
                let _running = RunningFlag::raise(packet_loop.shared.clone());
                if let Some(cpu) = cpu
                    && let Err(e) = pin_to_cpu(cpu)
                {
                    warn!(index, cpu, error = %e, "failed to pin worker");
                }
                packet_loop.run();
            })
            .map_err(|source| CoreError::Spawn { index, source })?;

        info!(index, ?cpu, "worker started");
        Ok(Self {
            shared,
            handle: Some(handle),
            cpu,
        })
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn cpu(&self) -> Option<usize> {
        self.cpu
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    ///
    /// A thread that finished without being asked to, for instance by
    /// panicking, reports [`WorkerState::ExitRequested`] until it is joined.
    pub fn state(&self) -> WorkerState {
        if self.handle.is_none() {
            WorkerState::Joined
        } else if self.shared.should_end() || self.has_exited() {
            WorkerState::ExitRequested
        } else if self.shared.is_running() {
            WorkerState::Running
        } else {
            WorkerState::Created
        }
    }

    /// The thread has finished and only needs joining.
    pub fn has_exited(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_finished())
    }

    /// Ask the worker to leave its loop; it notices within one iteration.
    pub fn request_exit(&self) {
        self.shared.should_end.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Wait for the thread to finish. Idempotent.
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| CoreError::WorkerPanicked(self.shared.index))?;
        debug!(index = self.shared.index, "worker joined");
        Ok(())
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_exit();
            let _ = self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{Publisher, UNADOPTED};
    use crate::handler::RefusingHandler;
    use crate::test_util::wait_until;

    struct Fixture {
        sockets: Publisher<SocketSet>,
        raw: Publisher<RawSet>,
        catalog: Publisher<Catalog>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                sockets: Publisher::new(ResourceKind::Sockets, Vec::new()),
                raw: Publisher::new(ResourceKind::Raw, Vec::new()),
                catalog: Publisher::new(ResourceKind::Catalog, Catalog::new()),
            }
        }

        fn context(&self) -> WorkerContext {
            WorkerContext {
                sockets: self.sockets.slot().clone(),
                raw: self.raw.slot().clone(),
                catalog: self.catalog.slot().clone(),
                handler: Arc::new(RefusingHandler),
                flags: CapabilityFlags::default(),
            }
        }
    }

    #[test]
    fn test_new_shared_is_unadopted() {
        let shared = WorkerShared::new(3);
        assert_eq!(shared.index(), 3);
        assert!(!shared.should_end());
        for kind in ResourceKind::ALL {
            assert_eq!(shared.echo(kind).load(), UNADOPTED);
        }
    }

    #[test]
    fn test_lifecycle() {
        let fixture = Fixture::new();
        let mut worker = WorkerThread::spawn(0, None, &fixture.context()).unwrap();
        for kind in ResourceKind::ALL {
            assert_eq!(worker.shared().echo(kind).load(), 1);
        }

        assert!(wait_until(Duration::from_secs(5), || worker.state() == WorkerState::Running));

        worker.request_exit();
        assert_eq!(worker.state(), WorkerState::ExitRequested);
        worker.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Joined);
        assert!(!worker.shared().is_running());
        worker.join().unwrap();
    }

    #[test]
    fn test_worker_echoes_new_generation() {
        let mut fixture = Fixture::new();
        let worker = WorkerThread::spawn(1, None, &fixture.context()).unwrap();

        let generation = fixture.catalog.publish(Catalog::new());
        let echo = worker.shared().clone();
        assert!(wait_until(Duration::from_secs(5), || {
            echo.echo(ResourceKind::Catalog).load() == generation
        }));

        let echoes = [worker.shared().echo(ResourceKind::Catalog).load()];
        assert_eq!(fixture.catalog.reclaim(&echoes), 1);
    }

    #[test]
    fn test_drop_joins_thread() {
        let fixture = Fixture::new();
        let worker = WorkerThread::spawn(2, None, &fixture.context()).unwrap();
        let shared = worker.shared().clone();
        assert!(wait_until(Duration::from_secs(5), || shared.is_running()));
        drop(worker);
        assert!(!shared.is_running());
        assert!(shared.should_end());
    }

    #[test]
    fn test_cpu_for_uses_allowed_ids() {
        let allowed = allowed_cpus();
        assert!(!allowed.is_empty());
        for index in 0..allowed.len() * 2 {
            assert_eq!(cpu_for(index), allowed[index % allowed.len()]);
        }
    }

    #[test]
    fn test_pinning_inside_restricted_mask() {
        let allowed = allowed_cpus();
        let last = *allowed.last().unwrap();
        let fixture = Fixture::new();

        // Restrict a helper thread to the highest allowed CPU, the way
        // `taskset` would, then check worker 0 lands on that CPU.
        let pinned = thread::spawn(move || {
            pin_to_cpu(last).unwrap();
            (cpu_for(0), cpu_for(1))
        })
        .join()
        .unwrap();
        assert_eq!(pinned, (last, last));

        let worker = WorkerThread::spawn(0, Some(cpu_for(0)), &fixture.context()).unwrap();
        assert!(allowed.contains(&worker.cpu().unwrap()));
    }
}
