//! Connection and listener operations.
//!
//! The stream path models full-duplex byte pipes. Data is injected with
//! [`virtual_send`](crate::SimMultiplexer::virtual_send), which appends to a
//! connection's input buffer and immediately attempts a policy-governed read;
//! inbound connections queue on a listener until an explicit `accept`.

use std::rc::Rc;

use crate::{
    error::{MuxError, MuxResult},
    handle::{ConnectionHandle, ListenerHandle},
    policy::ReceivePolicy,
    runnable::Notification,
    servant::{SharedAcceptServant, SharedStreamServant},
};

use super::{
    state::{ConnectionState, ListenerState, SharedBuffer},
    world::SimMultiplexer,
};

impl SimMultiplexer {
    /// Registers a connection servant under `hdl`.
    ///
    /// A fresh record with independent buffers is created unless provisioning
    /// or entanglement already created one, in which case the servant is
    /// attached to the existing record.
    pub fn new_connection(&self, hdl: ConnectionHandle, servant: SharedStreamServant) {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        let state = inner
            .connections
            .entry(hdl)
            .or_insert_with(ConnectionState::new);
        state.servant = Some(servant);
        tracing::debug!(hdl = hdl.id(), "registered connection");
    }

    /// Registers a listener servant under `hdl`, bound to `port`.
    ///
    /// Consumes a reservation for `port` if one exists. Fails with
    /// [`MuxError::AlreadyBound`] when another live listener holds the port.
    pub fn new_listener(
        &self,
        hdl: ListenerHandle,
        port: u16,
        servant: SharedAcceptServant,
    ) -> MuxResult<()> {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        if inner
            .listeners
            .iter()
            .any(|(h, state)| *h != hdl && state.port == port)
        {
            return Err(MuxError::AlreadyBound { port });
        }
        if inner.reserved_listeners.remove(&port).is_some() {
            tracing::trace!(port, "consumed listener reservation");
        }
        let mut state = ListenerState::new(port);
        state.servant = Some(servant);
        inner.listeners.insert(hdl, state);
        tracing::debug!(hdl = hdl.id(), port, "registered listener");
        Ok(())
    }

    /// Reserves `port` for a listener ahead of its creation, so tests can
    /// wire topology before the listener object exists.
    ///
    /// Fails with [`MuxError::AlreadyBound`] when the port is already
    /// reserved or bound. After [`close_listener`](Self::close_listener) the
    /// port becomes reservable again.
    pub fn provision_listener(&self, port: u16, hdl: ListenerHandle) -> MuxResult<()> {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        let taken = inner.reserved_listeners.contains_key(&port)
            || inner.listeners.values().any(|state| state.port == port);
        if taken {
            return Err(MuxError::AlreadyBound { port });
        }
        inner.reserved_listeners.insert(port, hdl);
        tracing::debug!(hdl = hdl.id(), port, "provisioned listener");
        Ok(())
    }

    /// Reserves an outbound target: a later [`connect`](Self::connect) for
    /// exactly `(host, port)` resolves to `hdl`.
    pub fn provision_connection(
        &self,
        host: impl Into<String>,
        port: u16,
        hdl: ConnectionHandle,
    ) -> MuxResult<()> {
        self.guard.check();
        let host = host.into();
        let mut inner = self.inner.borrow_mut();
        if inner.pending_outbound.contains_key(&(host.clone(), port)) {
            return Err(MuxError::AlreadyBound { port });
        }
        tracing::debug!(hdl = hdl.id(), host = %host, port, "provisioned connection");
        inner.pending_outbound.insert((host, port), hdl);
        Ok(())
    }

    /// Requests an outbound connection to `(host, port)`.
    ///
    /// Resolves against provisioned outbound targets by exact match,
    /// consuming the reservation. Fails with [`MuxError::ConnectionRefused`]
    /// when nothing matches.
    pub fn connect(&self, host: &str, port: u16) -> MuxResult<ConnectionHandle> {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        match inner.pending_outbound.remove(&(host.to_string(), port)) {
            Some(hdl) => {
                inner
                    .connections
                    .entry(hdl)
                    .or_insert_with(ConnectionState::new);
                tracing::debug!(hdl = hdl.id(), host, port, "resolved outbound connection");
                Ok(hdl)
            }
            None => Err(MuxError::ConnectionRefused {
                host: host.to_string(),
                port,
            }),
        }
    }

    /// Queues `hdl` as a pending inbound connection on listener `src`.
    pub fn add_pending_connect(&self, src: ListenerHandle, hdl: ConnectionHandle) {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        inner.pending_accepts.entry(src).or_default().push_back(hdl);
        tracing::trace!(listener = src.id(), hdl = hdl.id(), "queued pending connect");
    }

    /// Wires a client/server connection pair across two multiplexers.
    ///
    /// Registers `hdl` as pending-accept on `src`, provisions `(host, port)`
    /// on `peer` so its `connect` resolves to `peer_hdl`, and entangles the
    /// two records: bytes written on one side become readable input on the
    /// other. Entangling over an already-existing record is a fatal logic
    /// error, as it would silently break the shared-buffer invariant.
    pub fn entangle(
        &self,
        src: ListenerHandle,
        hdl: ConnectionHandle,
        peer: &SimMultiplexer,
        host: impl Into<String>,
        port: u16,
        peer_hdl: ConnectionHandle,
    ) -> MuxResult<()> {
        self.guard.check();
        assert!(
            !Rc::ptr_eq(&self.inner, &peer.inner),
            "cannot entangle a multiplexer with itself"
        );
        let host = host.into();
        peer.provision_connection(host.clone(), port, peer_hdl)?;

        let input: SharedBuffer = SharedBuffer::default();
        let output: SharedBuffer = SharedBuffer::default();
        {
            let mut inner = self.inner.borrow_mut();
            assert!(
                !inner.connections.contains_key(&hdl),
                "connection handle {} already has a record",
                hdl.id()
            );
            inner.connections.insert(
                hdl,
                ConnectionState::entangled(Rc::clone(&input), Rc::clone(&output)),
            );
        }
        {
            let mut peer_inner = peer.inner.borrow_mut();
            assert!(
                !peer_inner.connections.contains_key(&peer_hdl),
                "connection handle {} already has a record on the peer",
                peer_hdl.id()
            );
            peer_inner
                .connections
                .insert(peer_hdl, ConnectionState::entangled(output, input));
        }
        self.add_pending_connect(src, hdl);
        tracing::debug!(
            listener = src.id(),
            hdl = hdl.id(),
            peer_hdl = peer_hdl.id(),
            host = %host,
            port,
            "entangled connection pair"
        );
        Ok(())
    }

    /// Completes one pending connection on `src`.
    ///
    /// The oldest pending connection is moved into the live registry and a
    /// runnable notifying the listener's servant is scheduled. Returns
    /// `false` (no-op) when nothing is pending.
    pub fn accept(&self, src: ListenerHandle) -> bool {
        self.guard.check();
        let hdl = {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.listeners.contains_key(&src),
                "unknown listener handle {}",
                src.id()
            );
            let Some(queue) = inner.pending_accepts.get_mut(&src) else {
                return false;
            };
            let Some(hdl) = queue.pop_front() else {
                return false;
            };
            if queue.is_empty() {
                inner.pending_accepts.remove(&src);
            }
            inner
                .connections
                .entry(hdl)
                .or_insert_with(ConnectionState::new);
            hdl
        };
        tracing::debug!(listener = src.id(), hdl = hdl.id(), "accepted connection");
        self.schedule_notification(Notification::ConnectionAccepted {
            listener: src,
            connection: hdl,
        });
        true
    }

    /// Accepts the first pending connection found, scanning listeners in
    /// ascending handle order. Returns whether an accept happened.
    pub fn try_accept(&self) -> bool {
        self.guard.check();
        let target = {
            let inner = self.inner.borrow();
            inner
                .listeners
                .keys()
                .copied()
                .find(|src| inner.pending_accepts.get(src).is_some_and(|q| !q.is_empty()))
        };
        match target {
            Some(src) => self.accept(src),
            None => false,
        }
    }

    /// Models data arriving on the wire: appends `bytes` to the connection's
    /// input buffer, then immediately attempts a read.
    pub fn virtual_send(&self, hdl: ConnectionHandle, bytes: &[u8]) {
        self.guard.check();
        {
            let inner = self.inner.borrow();
            let state = inner.connection(hdl);
            state.vn_buf.borrow_mut().extend_from_slice(bytes);
        }
        tracing::trace!(hdl = hdl.id(), num_bytes = bytes.len(), "virtual send");
        self.read(hdl);
    }

    /// Drains the connection's input buffer according to its receive policy.
    ///
    /// Performs at most one policy-governed drain per call and delivers the
    /// consumed bytes synchronously to the servant. When write
    /// acknowledgements are enabled for the handle, an acknowledgement
    /// runnable is scheduled after the delivery. Returns `false` without
    /// consuming anything when reading is stopped, no servant is attached or
    /// the policy is not satisfied.
    pub fn read(&self, hdl: ConnectionHandle) -> bool {
        self.guard.check();
        let (servant, chunk, ack) = {
            let mut inner = self.inner.borrow_mut();
            let state = inner.connection_mut(hdl);
            if state.stopped_reading {
                return false;
            }
            let Some(servant) = state.servant.clone() else {
                return false;
            };
            let available = state.vn_buf.borrow().len();
            let Some(take) = state.recv_policy.admissible(available) else {
                return false;
            };
            let chunk: Vec<u8> = state.vn_buf.borrow_mut().drain(..take).collect();
            state.rd_buf = chunk.clone();
            (servant, chunk, state.ack_writes)
        };
        tracing::trace!(hdl = hdl.id(), num_bytes = chunk.len(), "delivering bytes");
        servant.borrow_mut().consume(self, hdl, &chunk);
        if ack {
            self.schedule_notification(Notification::StreamWriteAck {
                connection: hdl,
                num_bytes: chunk.len(),
            });
        }
        true
    }

    /// Attempts one read on every connection, in ascending handle order.
    /// Returns whether any of them made progress.
    pub fn read_all(&self) -> bool {
        self.guard.check();
        let handles: Vec<ConnectionHandle> =
            self.inner.borrow().connections.keys().copied().collect();
        let mut progressed = false;
        for hdl in handles {
            progressed |= self.read(hdl);
        }
        progressed
    }

    /// Reads from the first connection (ascending handle order) whose policy
    /// admits progress. Returns whether a read happened.
    pub fn try_read_one(&self) -> bool {
        self.guard.check();
        let handles: Vec<ConnectionHandle> =
            self.inner.borrow().connections.keys().copied().collect();
        handles.into_iter().any(|hdl| self.read(hdl))
    }

    /// Appends `bytes` to the connection's output buffer, which is the peer's input
    /// buffer when the pair is entangled. Schedules a write acknowledgement
    /// when enabled for the handle.
    pub fn write(&self, hdl: ConnectionHandle, bytes: &[u8]) {
        self.guard.check();
        let ack = {
            let inner = self.inner.borrow();
            let state = inner.connection(hdl);
            state.wr_buf.borrow_mut().extend_from_slice(bytes);
            state.ack_writes
        };
        tracing::trace!(hdl = hdl.id(), num_bytes = bytes.len(), "write");
        if ack {
            self.schedule_notification(Notification::StreamWriteAck {
                connection: hdl,
                num_bytes: bytes.len(),
            });
        }
    }

    /// Drops the connection record and purges the handle from every
    /// pending-accept queue. The peer of an entangled pair keeps its view of
    /// the shared buffers.
    pub fn close_connection(&self, hdl: ConnectionHandle) {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.connections.remove(&hdl).is_some(),
            "unknown connection handle {}",
            hdl.id()
        );
        for queue in inner.pending_accepts.values_mut() {
            queue.retain(|pending| *pending != hdl);
        }
        inner.pending_accepts.retain(|_, queue| !queue.is_empty());
        tracing::debug!(hdl = hdl.id(), "closed connection");
    }

    /// Drops the listener record, freeing its port for re-reservation.
    /// Pending connections still queued on the listener are discarded.
    pub fn close_listener(&self, hdl: ListenerHandle) {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.listeners.remove(&hdl).is_some(),
            "unknown listener handle {}",
            hdl.id()
        );
        inner.pending_accepts.remove(&hdl);
        tracing::debug!(hdl = hdl.id(), "closed listener");
    }

    // Flags and inspection.

    /// Returns the connection's receive policy.
    pub fn read_policy(&self, hdl: ConnectionHandle) -> ReceivePolicy {
        self.guard.check();
        self.inner.borrow().connection(hdl).recv_policy
    }

    /// Sets the connection's receive policy.
    pub fn set_read_policy(&self, hdl: ConnectionHandle, policy: ReceivePolicy) {
        self.guard.check();
        self.inner.borrow_mut().connection_mut(hdl).recv_policy = policy;
    }

    /// Returns whether the connection is closed for reading.
    pub fn stopped_reading(&self, hdl: ConnectionHandle) -> bool {
        self.guard.check();
        self.inner.borrow().connection(hdl).stopped_reading
    }

    /// Sets whether the connection is closed for reading.
    pub fn set_stopped_reading(&self, hdl: ConnectionHandle, value: bool) {
        self.guard.check();
        self.inner.borrow_mut().connection_mut(hdl).stopped_reading = value;
    }

    /// Returns whether the connection is in passive mode.
    pub fn passive_mode(&self, hdl: ConnectionHandle) -> bool {
        self.guard.check();
        self.inner.borrow().connection(hdl).passive_mode
    }

    /// Sets whether the connection is in passive mode.
    pub fn set_passive_mode(&self, hdl: ConnectionHandle, value: bool) {
        self.guard.check();
        self.inner.borrow_mut().connection_mut(hdl).passive_mode = value;
    }

    /// Returns whether the connection receives write acknowledgements.
    pub fn ack_writes(&self, hdl: ConnectionHandle) -> bool {
        self.guard.check();
        self.inner.borrow().connection(hdl).ack_writes
    }

    /// Sets whether the connection receives write acknowledgements.
    pub fn set_ack_writes(&self, hdl: ConnectionHandle, value: bool) {
        self.guard.check();
        self.inner.borrow_mut().connection_mut(hdl).ack_writes = value;
    }

    /// Snapshot of the pending data "on the network" for `hdl`, i.e. bytes
    /// injected but not yet consumed by a read.
    pub fn virtual_buffer(&self, hdl: ConnectionHandle) -> Vec<u8> {
        self.guard.check();
        self.inner.borrow().connection(hdl).vn_buf.borrow().clone()
    }

    /// Snapshot of the connection's output buffer.
    pub fn output_buffer(&self, hdl: ConnectionHandle) -> Vec<u8> {
        self.guard.check();
        self.inner.borrow().connection(hdl).wr_buf.borrow().clone()
    }

    /// Snapshot of the bytes staged by the most recent read on `hdl`.
    pub fn read_buffer(&self, hdl: ConnectionHandle) -> Vec<u8> {
        self.guard.check();
        self.inner.borrow().connection(hdl).rd_buf.clone()
    }

    /// Returns the port the listener is bound to.
    pub fn listener_port(&self, hdl: ListenerHandle) -> u16 {
        self.guard.check();
        self.inner.borrow().listener(hdl).port
    }

    /// Returns whether the listener is closed for reading.
    pub fn listener_stopped_reading(&self, hdl: ListenerHandle) -> bool {
        self.guard.check();
        self.inner.borrow().listener(hdl).stopped_reading
    }

    /// Sets whether the listener is closed for reading.
    pub fn set_listener_stopped_reading(&self, hdl: ListenerHandle, value: bool) {
        self.guard.check();
        self.inner.borrow_mut().listener_mut(hdl).stopped_reading = value;
    }

    /// Returns whether the listener is in passive mode.
    pub fn listener_passive_mode(&self, hdl: ListenerHandle) -> bool {
        self.guard.check();
        self.inner.borrow().listener(hdl).passive_mode
    }

    /// Sets whether the listener is in passive mode.
    pub fn set_listener_passive_mode(&self, hdl: ListenerHandle, value: bool) {
        self.guard.check();
        self.inner.borrow_mut().listener_mut(hdl).passive_mode = value;
    }

    /// Snapshot of the connections queued on `src` awaiting accept.
    pub fn pending_accepts(&self, src: ListenerHandle) -> Vec<ConnectionHandle> {
        self.guard.check();
        self.inner
            .borrow()
            .pending_accepts
            .get(&src)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns whether an outbound target is provisioned for `(host, port)`.
    pub fn has_pending_outbound(&self, host: &str, port: u16) -> bool {
        self.guard.check();
        self.inner
            .borrow()
            .pending_outbound
            .contains_key(&(host.to_string(), port))
    }

    /// Returns whether `port` is held by a live listener or a reservation.
    pub fn is_known_port(&self, port: u16) -> bool {
        self.guard.check();
        let inner = self.inner.borrow();
        inner.reserved_listeners.contains_key(&port)
            || inner.listeners.values().any(|state| state.port == port)
    }

    /// Returns whether `hdl` names a live listener or a reservation target.
    pub fn is_known_listener(&self, hdl: ListenerHandle) -> bool {
        self.guard.check();
        let inner = self.inner.borrow();
        inner.listeners.contains_key(&hdl)
            || inner.reserved_listeners.values().any(|h| *h == hdl)
    }
}
