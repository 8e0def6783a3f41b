//! Per-handle state records for the virtual network.
//!
//! Connection records hold byte buffers, datagram records hold job queues.
//! Input and output storage is reference counted so two records can be
//! entangled: one side's output buffer is the same allocation as the other
//! side's input buffer, which is how a connected pipe is modeled without any
//! real transport underneath. Destroying one record never invalidates the
//! peer's view of the shared storage.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use crate::{
    handle::{DatagramHandle, EndpointId},
    policy::ReceivePolicy,
    servant::{SharedAcceptServant, SharedDatagramServant, SharedStreamServant},
};

/// Default maximum payload size accepted by a datagram endpoint, in bytes.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_535;

/// Reference-counted byte storage shared between entangled connections.
pub(crate) type SharedBuffer = Rc<RefCell<Vec<u8>>>;

/// Reference-counted job storage shared between entangled datagram endpoints.
pub(crate) type SharedJobQueue = Rc<RefCell<VecDeque<Job>>>;

/// One datagram in flight: a payload addressed by peer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Identity of the peer this payload came from or is destined for.
    pub peer: EndpointId,
    /// The datagram payload.
    pub payload: Vec<u8>,
}

/// State backing one connection handle.
pub(crate) struct ConnectionState {
    /// Pending data "on the network", i.e. the input buffer the operating
    /// system would normally manage. Shared with the peer's `wr_buf` when
    /// entangled.
    pub(crate) vn_buf: SharedBuffer,
    /// Outgoing bytes. Shared with the peer's `vn_buf` when entangled.
    pub(crate) wr_buf: SharedBuffer,
    /// Bytes staged by the most recent read, kept for inspection.
    pub(crate) rd_buf: Vec<u8>,
    pub(crate) recv_policy: ReceivePolicy,
    pub(crate) stopped_reading: bool,
    pub(crate) passive_mode: bool,
    pub(crate) ack_writes: bool,
    pub(crate) servant: Option<SharedStreamServant>,
}

impl ConnectionState {
    /// Creates a record with fresh, independent buffers.
    pub(crate) fn new() -> Self {
        Self::entangled(
            Rc::new(RefCell::new(Vec::new())),
            Rc::new(RefCell::new(Vec::new())),
        )
    }

    /// Creates a record over existing storage, so that this record's input
    /// can be another record's output and vice versa.
    pub(crate) fn entangled(input: SharedBuffer, output: SharedBuffer) -> Self {
        Self {
            vn_buf: input,
            wr_buf: output,
            rd_buf: Vec::new(),
            recv_policy: ReceivePolicy::default(),
            stopped_reading: false,
            passive_mode: false,
            ack_writes: false,
            servant: None,
        }
    }
}

/// State backing one listener handle.
pub(crate) struct ListenerState {
    pub(crate) servant: Option<SharedAcceptServant>,
    pub(crate) port: u16,
    pub(crate) stopped_reading: bool,
    pub(crate) passive_mode: bool,
}

impl ListenerState {
    pub(crate) fn new(port: u16) -> Self {
        Self {
            servant: None,
            port,
            stopped_reading: false,
            passive_mode: false,
        }
    }
}

/// State backing one datagram handle.
pub(crate) struct DatagramState {
    /// Pending jobs "on the network". Shared with the peer's `wr_buf` when
    /// entangled.
    pub(crate) vn_buf: SharedJobQueue,
    /// Outgoing jobs. Shared with the peer's `vn_buf` when entangled.
    pub(crate) wr_buf: SharedJobQueue,
    /// The job delivered by the most recent read, kept for inspection.
    pub(crate) rd_buf: Option<Job>,
    pub(crate) stopped_reading: bool,
    pub(crate) passive_mode: bool,
    pub(crate) ack_writes: bool,
    /// Port of the remote peer this record stands for, when it is one.
    pub(crate) port: u16,
    /// Port of the local socket, for endpoints that are simultaneously a
    /// socket and a peer.
    pub(crate) local_port: u16,
    pub(crate) max_datagram_size: usize,
    /// Every peer this endpoint has spoken with, by process-local identity.
    pub(crate) peers: BTreeMap<EndpointId, DatagramHandle>,
    pub(crate) servant: Option<SharedDatagramServant>,
}

impl DatagramState {
    /// Creates a record with fresh, independent job queues.
    pub(crate) fn new() -> Self {
        Self::entangled(
            Rc::new(RefCell::new(VecDeque::new())),
            Rc::new(RefCell::new(VecDeque::new())),
        )
    }

    /// Creates a record over existing job queues for entangled pairs.
    pub(crate) fn entangled(input: SharedJobQueue, output: SharedJobQueue) -> Self {
        Self {
            vn_buf: input,
            wr_buf: output,
            rd_buf: None,
            stopped_reading: false,
            passive_mode: false,
            ack_writes: false,
            port: 0,
            local_port: 0,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            peers: BTreeMap::new(),
            servant: None,
        }
    }
}
