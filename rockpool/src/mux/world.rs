//! The central multiplexer object: registries, pending maps and the
//! scheduler facade.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    sync::Arc,
};

use crate::{
    guard::ThreadGuard,
    handle::{ConnectionHandle, DatagramHandle, EndpointId, ListenerHandle},
    runnable::{Notification, Runnable, RunnableQueue, Work},
};

use super::state::{ConnectionState, DatagramState, ListenerState};

/// Internal registry state, centrally owned behind one `RefCell` so handle
/// keyed access never fights the borrow checker across call sites.
pub(crate) struct MuxInner {
    pub(crate) connections: BTreeMap<ConnectionHandle, ConnectionState>,
    pub(crate) listeners: BTreeMap<ListenerHandle, ListenerState>,
    pub(crate) datagrams: BTreeMap<DatagramHandle, DatagramState>,

    /// Inbound connections queued on a listener, awaiting `accept`.
    pub(crate) pending_accepts: BTreeMap<ListenerHandle, VecDeque<ConnectionHandle>>,
    /// Outbound connection requests resolvable by exact `(host, port)` match.
    pub(crate) pending_outbound: BTreeMap<(String, u16), ConnectionHandle>,
    /// Listener ports reserved ahead of the listener object.
    pub(crate) reserved_listeners: BTreeMap<u16, ListenerHandle>,
    /// Local datagram ports reserved ahead of the endpoint object.
    pub(crate) reserved_local_datagrams: BTreeMap<u16, DatagramHandle>,
    /// Remote datagram addresses reserved ahead of the endpoint object.
    pub(crate) reserved_remote_datagrams: BTreeMap<(String, u16), DatagramHandle>,
    /// Freshly allocated endpoint ids not yet attached to a peer map.
    pub(crate) pending_endpoints: BTreeMap<EndpointId, DatagramHandle>,

    next_endpoint_id: u64,
}

impl MuxInner {
    fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
            listeners: BTreeMap::new(),
            datagrams: BTreeMap::new(),
            pending_accepts: BTreeMap::new(),
            pending_outbound: BTreeMap::new(),
            reserved_listeners: BTreeMap::new(),
            reserved_local_datagrams: BTreeMap::new(),
            reserved_remote_datagrams: BTreeMap::new(),
            pending_endpoints: BTreeMap::new(),
            next_endpoint_id: 0,
        }
    }

    #[track_caller]
    pub(crate) fn connection(&self, hdl: ConnectionHandle) -> &ConnectionState {
        self.connections
            .get(&hdl)
            .unwrap_or_else(|| panic!("unknown connection handle {}", hdl.id()))
    }

    #[track_caller]
    pub(crate) fn connection_mut(&mut self, hdl: ConnectionHandle) -> &mut ConnectionState {
        self.connections
            .get_mut(&hdl)
            .unwrap_or_else(|| panic!("unknown connection handle {}", hdl.id()))
    }

    #[track_caller]
    pub(crate) fn listener(&self, hdl: ListenerHandle) -> &ListenerState {
        self.listeners
            .get(&hdl)
            .unwrap_or_else(|| panic!("unknown listener handle {}", hdl.id()))
    }

    #[track_caller]
    pub(crate) fn listener_mut(&mut self, hdl: ListenerHandle) -> &mut ListenerState {
        self.listeners
            .get_mut(&hdl)
            .unwrap_or_else(|| panic!("unknown listener handle {}", hdl.id()))
    }

    #[track_caller]
    pub(crate) fn datagram(&self, hdl: DatagramHandle) -> &DatagramState {
        self.datagrams
            .get(&hdl)
            .unwrap_or_else(|| panic!("unknown datagram handle {}", hdl.id()))
    }

    #[track_caller]
    pub(crate) fn datagram_mut(&mut self, hdl: DatagramHandle) -> &mut DatagramState {
        self.datagrams
            .get_mut(&hdl)
            .unwrap_or_else(|| panic!("unknown datagram handle {}", hdl.id()))
    }
}

/// A deterministic, in-process substitute for an operating-system network
/// reactor.
///
/// The multiplexer models connections, listeners and datagram endpoints as
/// addressable handles backed by explicit, inspectable buffers, and replaces
/// asynchronous readiness delivery with a FIFO queue of runnables that test
/// code drains one step at a time.
///
/// One instance stands for one simulated host. Instances are plain values
/// with no hidden singleton, so two of them can be cross-wired (see
/// [`entangle`](SimMultiplexer::entangle)) to simulate two communicating
/// processes inside a single test.
///
/// All registry-touching operations are confined to the constructing thread;
/// only the runnable queue may be driven from outside (see
/// [`runnables`](SimMultiplexer::runnables)).
pub struct SimMultiplexer {
    pub(crate) inner: Rc<RefCell<MuxInner>>,
    pub(crate) runnables: Arc<RunnableQueue>,
    pub(crate) guard: ThreadGuard,
}

impl SimMultiplexer {
    /// Creates an empty multiplexer owned by the calling thread.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(MuxInner::new())),
            runnables: Arc::new(RunnableQueue::new()),
            guard: ThreadGuard::new(),
        }
    }

    /// Allocates the next process-local endpoint id.
    ///
    /// Ids increase monotonically and are never reused. Exhausting the id
    /// space is a fatal programming error.
    pub fn next_endpoint_id(&self) -> EndpointId {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_endpoint_id;
        inner.next_endpoint_id = id.checked_add(1).expect("endpoint id space exhausted");
        EndpointId::new(id)
    }

    /// Returns a shareable handle to the runnable queue.
    ///
    /// The queue handle is `Send + Sync`, so a background collaborator can
    /// schedule work from another thread while the owning thread drains it.
    pub fn runnables(&self) -> Arc<RunnableQueue> {
        Arc::clone(&self.runnables)
    }

    /// Schedules a deferred execution unit.
    ///
    /// Under an active inline budget the unit executes synchronously right
    /// here instead of queueing; see
    /// [`inline_next_runnables`](SimMultiplexer::inline_next_runnables).
    pub fn schedule<R>(&self, runnable: R)
    where
        R: Runnable + 'static,
    {
        self.runnables.schedule(Box::new(runnable));
    }

    /// Executes the front runnable if one is queued. Returns whether a unit
    /// ran.
    pub fn try_run_once(&self) -> bool {
        self.guard.check();
        match self.runnables.pop(false) {
            Some(work) => {
                self.exec(work);
                true
            }
            None => false,
        }
    }

    /// Executes the front runnable, blocking until one becomes available.
    ///
    /// The wait is coordinated through a condition variable, so a producer
    /// thread scheduling through [`runnables`](SimMultiplexer::runnables)
    /// wakes this call up.
    pub fn run_once(&self) {
        self.guard.check();
        if let Some(work) = self.runnables.pop(true) {
            self.exec(work);
        }
    }

    /// Executes queued runnables until the queue is empty. Returns the number
    /// of units executed.
    pub fn drain(&self) -> usize {
        self.guard.check();
        let mut executed = 0;
        while self.try_run_once() {
            executed += 1;
        }
        executed
    }

    /// Makes the next `num` scheduled units execute synchronously at schedule
    /// time instead of queueing.
    pub fn inline_next_runnables(&self, num: usize) {
        self.runnables.inline_next_runnables(num);
    }

    /// Makes the next scheduled unit execute synchronously at schedule time.
    pub fn inline_next_runnable(&self) {
        self.runnables.inline_next_runnable();
    }

    /// Resets the inline budget.
    pub fn reset_inlining(&self) {
        self.runnables.reset_inlining();
    }

    /// Installs a one-shot callback fired after the last inlined unit runs.
    pub fn after_next_inlined_runnable<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.runnables.after_next_inlined_runnable(callback);
    }

    /// Routes an internal notification through the queue, honoring the
    /// inlining shortcut. Must be called with no outstanding borrow of
    /// `inner`.
    pub(crate) fn schedule_notification(&self, note: Notification) {
        match self.runnables.reserve_inline() {
            Some(callback) => {
                tracing::trace!(?note, "inlining notification");
                self.dispatch(note);
                if let Some(callback) = callback {
                    callback();
                }
            }
            None => self.runnables.push(Work::Notify(note)),
        }
    }

    fn exec(&self, work: Work) {
        match work {
            Work::User(runnable) => runnable.run(),
            Work::Notify(note) => self.dispatch(note),
        }
    }

    /// Resolves a notification against the registries and calls into the
    /// servant. Servants are cloned out of the registry first so re-entrant
    /// multiplexer calls from inside a servant are safe.
    fn dispatch(&self, note: Notification) {
        match note {
            Notification::ConnectionAccepted {
                listener,
                connection,
            } => {
                let servant = {
                    let inner = self.inner.borrow();
                    match inner.listeners.get(&listener) {
                        Some(state) => state.servant.clone(),
                        None => {
                            tracing::debug!(
                                listener = listener.id(),
                                "dropping accept notification for a closed listener"
                            );
                            return;
                        }
                    }
                };
                let servant = servant.unwrap_or_else(|| {
                    panic!("listener {} has no servant to accept with", listener.id())
                });
                servant
                    .borrow_mut()
                    .connection_accepted(self, listener, connection);
            }
            Notification::StreamWriteAck {
                connection,
                num_bytes,
            } => {
                let servant = {
                    let inner = self.inner.borrow();
                    inner
                        .connections
                        .get(&connection)
                        .and_then(|state| state.servant.clone())
                };
                match servant {
                    Some(servant) => servant.borrow_mut().write_acked(self, connection, num_bytes),
                    None => tracing::trace!(
                        connection = connection.id(),
                        "dropping write ack for a closed connection"
                    ),
                }
            }
            Notification::DatagramWriteAck { datagram, num_bytes } => {
                let servant = {
                    let inner = self.inner.borrow();
                    inner
                        .datagrams
                        .get(&datagram)
                        .and_then(|state| state.servant.clone())
                };
                match servant {
                    Some(servant) => servant.borrow_mut().write_acked(self, datagram, num_bytes),
                    None => tracing::trace!(
                        datagram = datagram.id(),
                        "dropping write ack for a closed endpoint"
                    ),
                }
            }
        }
    }
}

impl Default for SimMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}
