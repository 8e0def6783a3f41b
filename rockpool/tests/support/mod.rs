//! Recording servants shared by the integration tests.
#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use rockpool::{
    AcceptServant, ConnectionHandle, DatagramHandle, EndpointId, ListenerHandle,
    SharedStreamServant, SimMultiplexer, StreamServant,
};

/// Stream servant that records every delivery and acknowledgement.
#[derive(Default)]
pub struct RecordingStream {
    pub received: Vec<Vec<u8>>,
    pub acked: Vec<usize>,
}

impl StreamServant for RecordingStream {
    fn consume(&mut self, _mux: &SimMultiplexer, _hdl: ConnectionHandle, buf: &[u8]) {
        self.received.push(buf.to_vec());
    }

    fn write_acked(&mut self, _mux: &SimMultiplexer, _hdl: ConnectionHandle, num_bytes: usize) {
        self.acked.push(num_bytes);
    }
}

pub fn stream_servant() -> Rc<RefCell<RecordingStream>> {
    Rc::new(RefCell::new(RecordingStream::default()))
}

/// Accept servant that records completed accepts and optionally attaches a
/// prepared stream servant to the accepted connection, the way a broker
/// would spin up a new connection object.
#[derive(Default)]
pub struct RecordingAcceptor {
    pub accepted: Vec<(ListenerHandle, ConnectionHandle)>,
    pub attach: Option<SharedStreamServant>,
}

impl AcceptServant for RecordingAcceptor {
    fn connection_accepted(
        &mut self,
        mux: &SimMultiplexer,
        src: ListenerHandle,
        hdl: ConnectionHandle,
    ) {
        self.accepted.push((src, hdl));
        if let Some(servant) = self.attach.take() {
            mux.new_connection(hdl, servant);
        }
    }
}

pub fn acceptor() -> Rc<RefCell<RecordingAcceptor>> {
    Rc::new(RefCell::new(RecordingAcceptor::default()))
}

pub fn attaching_acceptor(attach: SharedStreamServant) -> Rc<RefCell<RecordingAcceptor>> {
    Rc::new(RefCell::new(RecordingAcceptor {
        accepted: Vec::new(),
        attach: Some(attach),
    }))
}

/// Datagram servant that records every delivered job and acknowledgement.
#[derive(Default)]
pub struct RecordingDatagram {
    pub received: Vec<(EndpointId, Vec<u8>)>,
    pub acked: Vec<usize>,
}

impl rockpool::DatagramServant for RecordingDatagram {
    fn datagram_received(
        &mut self,
        _mux: &SimMultiplexer,
        _hdl: DatagramHandle,
        peer: EndpointId,
        buf: &[u8],
    ) {
        self.received.push((peer, buf.to_vec()));
    }

    fn write_acked(&mut self, _mux: &SimMultiplexer, _hdl: DatagramHandle, num_bytes: usize) {
        self.acked.push(num_bytes);
    }
}

pub fn datagram_servant() -> Rc<RefCell<RecordingDatagram>> {
    Rc::new(RefCell::new(RecordingDatagram::default()))
}
