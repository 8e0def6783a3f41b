//! # Rockpool
//!
//! A deterministic, in-process substitute for an operating-system network
//! reactor, used to drive and verify event-driven I/O layers without touching
//! real sockets.
//!
//! Production reactors multiplex real file descriptors through OS polling and
//! deliver readiness notifications asynchronously, which makes tests of
//! protocol layers and connection state machines flaky: the ordering of
//! reads, writes, accepts and datagrams is not controllable. Rockpool
//! replaces the OS with a virtual network: connections, listeners and
//! datagram endpoints are addressable handles backed by explicit, inspectable
//! buffers, and readiness delivery becomes a FIFO queue of runnables that
//! test code steps through one at a time.
//!
//! ## Model
//!
//! - Data is injected with `virtual_send`, which appends to an endpoint's
//!   input buffer and immediately attempts a policy-governed read.
//! - Two [`SimMultiplexer`] instances stand for two simulated hosts; their
//!   connection (or datagram) records can be *entangled* so that one side's
//!   output buffer is the other side's input buffer, modeling a connected
//!   pipe with no transport underneath.
//! - Everything is single-threaded by design and guarded by a thread
//!   confinement check; the runnable queue is the only primitive that may be
//!   driven from another thread.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Error types for simulated network conditions.
pub mod error;
/// Thread-confinement guard for the multiplexer's registries.
pub mod guard;
/// Handle types identifying simulated network resources.
pub mod handle;
/// The virtual network multiplexer.
pub mod mux;
/// Receive policies governing stream reads.
pub mod policy;
/// Deferred execution units and the FIFO runnable queue.
pub mod runnable;
/// Collaborator traits for endpoint implementation objects.
pub mod servant;

pub use error::{MuxError, MuxResult};
pub use guard::ThreadGuard;
pub use handle::{ConnectionHandle, DatagramHandle, EndpointId, ListenerHandle};
pub use mux::{DEFAULT_MAX_DATAGRAM_SIZE, Job, SimMultiplexer};
pub use policy::ReceivePolicy;
pub use runnable::{Runnable, RunnableQueue};
pub use servant::{
    AcceptServant, DatagramServant, SharedAcceptServant, SharedDatagramServant,
    SharedStreamServant, StreamServant,
};
