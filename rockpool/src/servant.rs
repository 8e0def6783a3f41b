//! Collaborator traits for endpoint implementation objects.
//!
//! Every handle registered with a [`SimMultiplexer`] can carry an
//! implementation object ("servant") supplied by the layer under test. The
//! multiplexer calls into these traits to deliver received bytes, completed
//! accepts and write acknowledgements; servants call back into the
//! multiplexer to write, close or reconfigure their endpoint.
//!
//! Servants are shared through `Rc<RefCell<…>>` so that tests can keep a
//! typed reference for assertions while the multiplexer owns a dynamically
//! typed one.
//!
//! [`SimMultiplexer`]: crate::SimMultiplexer

use std::{cell::RefCell, rc::Rc};

use crate::{
    handle::{ConnectionHandle, DatagramHandle, EndpointId, ListenerHandle},
    mux::SimMultiplexer,
};

/// Implementation object behind a connection handle.
pub trait StreamServant {
    /// Delivers bytes drained from the connection's input buffer.
    fn consume(&mut self, mux: &SimMultiplexer, hdl: ConnectionHandle, buf: &[u8]);

    /// Notifies the servant that `num_bytes` of its traffic were
    /// acknowledged. Only called when write acknowledgements are enabled for
    /// the handle.
    fn write_acked(&mut self, mux: &SimMultiplexer, hdl: ConnectionHandle, num_bytes: usize) {
        let _ = (mux, hdl, num_bytes);
    }
}

/// Implementation object behind a listener handle.
pub trait AcceptServant {
    /// Notifies the servant that a pending connection on `src` was accepted
    /// and is now live as `hdl`.
    fn connection_accepted(&mut self, mux: &SimMultiplexer, src: ListenerHandle, hdl: ConnectionHandle);
}

/// Implementation object behind a datagram handle.
pub trait DatagramServant {
    /// Delivers one datagram popped from the endpoint's input queue.
    fn datagram_received(
        &mut self,
        mux: &SimMultiplexer,
        hdl: DatagramHandle,
        peer: EndpointId,
        buf: &[u8],
    );

    /// Notifies the servant that `num_bytes` of its traffic were
    /// acknowledged. Only called when write acknowledgements are enabled for
    /// the handle.
    fn write_acked(&mut self, mux: &SimMultiplexer, hdl: DatagramHandle, num_bytes: usize) {
        let _ = (mux, hdl, num_bytes);
    }
}

/// Shared reference to a stream servant.
pub type SharedStreamServant = Rc<RefCell<dyn StreamServant>>;

/// Shared reference to an accept servant.
pub type SharedAcceptServant = Rc<RefCell<dyn AcceptServant>>;

/// Shared reference to a datagram servant.
pub type SharedDatagramServant = Rc<RefCell<dyn DatagramServant>>;
