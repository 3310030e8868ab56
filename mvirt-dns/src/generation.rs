//! Publish/echo/retire primitive for hot-swappable resources.
//!
//! The control thread owns a [`Publisher`] per resource kind. Publishing stores
//! a fresh immutable [`Generation`] into the shared [`Slot`]; the previous
//! generation is queued for retirement. Each worker owns a [`Reader`] that
//! adopts the newest generation once per loop iteration and writes the id it
//! holds into its [`Echo`]. A retired generation is released only once no
//! echo can still name it.
//!
//! Ordering: the slot's generation pointer is swapped before the `latest`
//! counter is stored with `Release`; readers load `latest` with `Acquire` and
//! then the pointer, so a reader that sees a new id always sees the fully
//! constructed generation behind it. Echoes are stored with `Release` after the
//! reader has dropped its previous generation and loaded with `Acquire` by the
//! control thread.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tracing::debug;

/// Echo value of a worker that has not adopted any generation.
///
/// Real generation ids start at 1.
pub const UNADOPTED: u64 = 0;

/// The hot-swappable resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Sockets,
    Raw,
    Catalog,
}

impl ResourceKind {
    pub const COUNT: usize = 3;
    pub const ALL: [ResourceKind; Self::COUNT] =
        [ResourceKind::Sockets, ResourceKind::Raw, ResourceKind::Catalog];

    pub fn index(self) -> usize {
        match self {
            ResourceKind::Sockets => 0,
            ResourceKind::Raw => 1,
            ResourceKind::Catalog => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Sockets => "sockets",
            ResourceKind::Raw => "raw",
            ResourceKind::Catalog => "catalog",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable version of a resource.
#[derive(Debug)]
pub struct Generation<T> {
    id: u64,
    value: T,
}

impl<T> Generation<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for Generation<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Shared publication point read by every worker.
pub struct Slot<T> {
    current: ArcSwap<Generation<T>>,
    latest: AtomicU64,
}

impl<T> Slot<T> {
    /// Id of the newest published generation.
    #[inline]
    pub fn latest_id(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// Take a reference to the newest published generation.
    #[inline]
    pub fn load(&self) -> Arc<Generation<T>> {
        self.current.load_full()
    }
}

/// Written by exactly one worker; read by the control thread.
#[derive(Debug)]
pub struct Echo(AtomicU64);

impl Echo {
    pub const fn new() -> Self {
        Echo(AtomicU64::new(UNADOPTED))
    }

    #[inline]
    pub fn store(&self, generation: u64) {
        self.0.store(generation, Ordering::Release);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for Echo {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a worker whose echo reads `echo` may still hold `generation`.
///
/// A reader echoes only after adopting, so between loading a newer generation
/// and echoing it the reader's echo names an older one. Any echo at or below
/// `generation` therefore still pins it; only the sentinel and strictly newer
/// echoes release it.
#[inline]
pub fn still_holds(echo: u64, generation: u64) -> bool {
    echo != UNADOPTED && echo <= generation
}

/// Worker-side view of a slot.
pub struct Reader<T> {
    slot: Arc<Slot<T>>,
    cached: Arc<Generation<T>>,
}

impl<T> Reader<T> {
    /// Create a reader seeded with the current generation and echo it.
    ///
    /// Called on the control thread before the worker starts, so a worker never
    /// holds a generation its echo does not account for.
    pub fn new(slot: Arc<Slot<T>>, echo: &Echo) -> Self {
        let cached = slot.load();
        echo.store(cached.id());
        Self { slot, cached }
    }

    /// Adopt the newest generation if it changed. Returns true on adoption.
    #[inline]
    pub fn refresh(&mut self, echo: &Echo) -> bool {
        if self.slot.latest_id() == self.cached.id() {
            return false;
        }
        // Assigning drops the old reference before the echo is written.
        self.cached = self.slot.load();
        echo.store(self.cached.id());
        true
    }

    #[inline]
    pub fn current(&self) -> &Generation<T> {
        &self.cached
    }
}

/// Control-thread side of a slot: publishes and retires generations.
pub struct Publisher<T> {
    kind: ResourceKind,
    slot: Arc<Slot<T>>,
    retiring: VecDeque<Arc<Generation<T>>>,
}

impl<T> Publisher<T> {
    /// Create a publisher whose first generation (id 1) holds `initial`.
    pub fn new(kind: ResourceKind, initial: T) -> Self {
        let first = Arc::new(Generation {
            id: UNADOPTED + 1,
            value: initial,
        });
        let slot = Arc::new(Slot {
            current: ArcSwap::new(first),
            latest: AtomicU64::new(UNADOPTED + 1),
        });
        Self {
            kind,
            slot,
            retiring: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn slot(&self) -> &Arc<Slot<T>> {
        &self.slot
    }

    pub fn current_id(&self) -> u64 {
        self.slot.latest_id()
    }

    /// The newest generation, for control-thread inspection.
    pub fn current(&self) -> Arc<Generation<T>> {
        self.slot.load()
    }

    /// Publish `value` as the next generation and queue the previous one for
    /// retirement. Never blocks.
    pub fn publish(&mut self, value: T) -> u64 {
        let id = self.slot.latest_id() + 1;
        let fresh = Arc::new(Generation { id, value });
        let previous = self.slot.current.swap(fresh);
        self.slot.latest.store(id, Ordering::Release);
        debug!(kind = %self.kind, generation = id, retiring = previous.id(), "published generation");
        self.retiring.push_back(previous);
        id
    }

    /// Ids of generations waiting for quiescence, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = u64> + '_ {
        self.retiring.iter().map(|g| g.id())
    }

    pub fn pending_count(&self) -> usize {
        self.retiring.len()
    }

    pub fn oldest_pending(&self) -> Option<u64> {
        self.retiring.front().map(|g| g.id())
    }

    /// Release every retiring generation that no echo still holds.
    ///
    /// `echoes` is a snapshot of every live worker's echo for this kind.
    /// Returns the number of generations released.
    pub fn reclaim(&mut self, echoes: &[u64]) -> usize {
        let before = self.retiring.len();
        self.retiring.retain(|generation| {
            let id = generation.id();
            echoes.iter().any(|&echo| still_holds(echo, id))
        });
        let reclaimed = before - self.retiring.len();
        if reclaimed > 0 {
            debug!(kind = %self.kind, reclaimed, pending = self.retiring.len(), "reclaimed generations");
        }
        reclaimed
    }
}
