//! Datagram endpoint operations.
//!
//! Datagrams are message-oriented: the unit of transfer is a job, a payload
//! tagged with the process-local identity of its peer. Reads pop exactly
//! one job, never coalescing or splitting. One local socket can fan out to
//! many remote peers through its peer map.

use std::rc::Rc;

use crate::{
    error::{MuxError, MuxResult},
    handle::{DatagramHandle, EndpointId},
    runnable::Notification,
    servant::SharedDatagramServant,
};

use super::{
    state::{DatagramState, Job, SharedJobQueue},
    world::SimMultiplexer,
};

impl SimMultiplexer {
    /// Registers a datagram servant under `hdl`.
    ///
    /// A fresh record with independent job queues is created unless
    /// provisioning or entanglement already created one, in which case the
    /// servant is attached to the existing record.
    pub fn new_datagram(&self, hdl: DatagramHandle, servant: SharedDatagramServant) {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        let state = inner.datagrams.entry(hdl).or_insert_with(DatagramState::new);
        state.servant = Some(servant);
        tracing::debug!(hdl = hdl.id(), "registered datagram endpoint");
    }

    /// Registers a local datagram socket bound to `port`.
    ///
    /// Consumes a local reservation for `port` if one exists. Fails with
    /// [`MuxError::AlreadyBound`] when another live endpoint holds the local
    /// port.
    pub fn new_local_datagram(
        &self,
        hdl: DatagramHandle,
        port: u16,
        servant: SharedDatagramServant,
    ) -> MuxResult<()> {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        // Port 0 marks an unbound record, so it never collides.
        if port != 0
            && inner
                .datagrams
                .iter()
                .any(|(h, state)| *h != hdl && state.local_port == port)
        {
            return Err(MuxError::AlreadyBound { port });
        }
        if inner.reserved_local_datagrams.remove(&port).is_some() {
            tracing::trace!(port, "consumed local datagram reservation");
        }
        let state = inner.datagrams.entry(hdl).or_insert_with(DatagramState::new);
        state.servant = Some(servant);
        state.local_port = port;
        tracing::debug!(hdl = hdl.id(), port, "registered local datagram socket");
        Ok(())
    }

    /// Registers a datagram record standing for the remote peer at
    /// `(host, port)`.
    ///
    /// Allocates a fresh endpoint id for the peer, registers it in the
    /// pending-endpoint map so jobs addressed to it resolve to `hdl`, and
    /// returns the id.
    pub fn new_remote_datagram(
        &self,
        hdl: DatagramHandle,
        host: &str,
        port: u16,
        servant: SharedDatagramServant,
    ) -> EndpointId {
        self.guard.check();
        let ep = self.next_endpoint_id();
        let mut inner = self.inner.borrow_mut();
        let state = inner.datagrams.entry(hdl).or_insert_with(DatagramState::new);
        state.servant = Some(servant);
        state.port = port;
        inner.pending_endpoints.insert(ep, hdl);
        tracing::debug!(
            hdl = hdl.id(),
            host,
            port,
            ep = ep.id(),
            "registered remote datagram endpoint"
        );
        ep
    }

    /// Reserves a local datagram `port` ahead of the endpoint object.
    pub fn provision_local_datagram(&self, port: u16, hdl: DatagramHandle) -> MuxResult<()> {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        let taken = inner.reserved_local_datagrams.contains_key(&port)
            || (port != 0 && inner.datagrams.values().any(|state| state.local_port == port));
        if taken {
            return Err(MuxError::AlreadyBound { port });
        }
        inner.reserved_local_datagrams.insert(port, hdl);
        tracing::debug!(hdl = hdl.id(), port, "provisioned local datagram endpoint");
        Ok(())
    }

    /// Reserves a remote datagram address ahead of the endpoint object.
    pub fn provision_remote_datagram(
        &self,
        host: impl Into<String>,
        port: u16,
        hdl: DatagramHandle,
    ) -> MuxResult<()> {
        self.guard.check();
        let host = host.into();
        let mut inner = self.inner.borrow_mut();
        if inner
            .reserved_remote_datagrams
            .contains_key(&(host.clone(), port))
        {
            return Err(MuxError::AlreadyBound { port });
        }
        tracing::debug!(hdl = hdl.id(), host = %host, port, "provisioned remote datagram endpoint");
        inner.reserved_remote_datagrams.insert((host, port), hdl);
        Ok(())
    }

    /// Requests a local datagram socket on `port`.
    ///
    /// Resolves against local reservations, consuming the match. Fails with
    /// [`MuxError::AddressUnavailable`] when nothing is reserved.
    pub fn local_datagram(&self, port: u16) -> MuxResult<DatagramHandle> {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        match inner.reserved_local_datagrams.remove(&port) {
            Some(hdl) => {
                let state = inner.datagrams.entry(hdl).or_insert_with(DatagramState::new);
                state.local_port = port;
                tracing::debug!(hdl = hdl.id(), port, "resolved local datagram endpoint");
                Ok(hdl)
            }
            None => Err(MuxError::AddressUnavailable { port }),
        }
    }

    /// Requests a datagram endpoint for the remote peer at `(host, port)`.
    ///
    /// Resolves against remote reservations by exact match, consuming it.
    /// Fails with [`MuxError::AddressUnavailable`] when nothing is reserved.
    pub fn remote_datagram(&self, host: &str, port: u16) -> MuxResult<DatagramHandle> {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        match inner
            .reserved_remote_datagrams
            .remove(&(host.to_string(), port))
        {
            Some(hdl) => {
                let state = inner.datagrams.entry(hdl).or_insert_with(DatagramState::new);
                state.port = port;
                tracing::debug!(hdl = hdl.id(), host, port, "resolved remote datagram endpoint");
                Ok(hdl)
            }
            None => Err(MuxError::AddressUnavailable { port }),
        }
    }

    /// Registers `hdl` as the resolution target for the freshly observed
    /// endpoint id `ep`, so jobs addressed to `ep` reach the right record.
    pub fn register_pending_endpoint(&self, ep: EndpointId, hdl: DatagramHandle) {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        inner.pending_endpoints.insert(ep, hdl);
        tracing::trace!(ep = ep.id(), hdl = hdl.id(), "registered pending endpoint");
    }

    /// Records `peer_hdl` in `hdl`'s peer map under identity `ep`.
    pub fn register_peer(&self, hdl: DatagramHandle, ep: EndpointId, peer_hdl: DatagramHandle) {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        inner.datagram_mut(hdl).peers.insert(ep, peer_hdl);
        tracing::trace!(hdl = hdl.id(), ep = ep.id(), peer = peer_hdl.id(), "registered peer");
    }

    /// Wires a datagram endpoint pair across two multiplexers.
    ///
    /// Entangles the job queues of `hdl` and `peer_hdl` (jobs written on one
    /// side become readable input on the other) and provisions
    /// `(host, port)` on `peer` so its `remote_datagram` resolves to
    /// `peer_hdl`. Entangling over an already-existing record is a fatal
    /// logic error.
    pub fn entangle_datagram(
        &self,
        hdl: DatagramHandle,
        peer: &SimMultiplexer,
        host: impl Into<String>,
        port: u16,
        peer_hdl: DatagramHandle,
    ) -> MuxResult<()> {
        self.guard.check();
        assert!(
            !Rc::ptr_eq(&self.inner, &peer.inner),
            "cannot entangle a multiplexer with itself"
        );
        let host = host.into();
        peer.provision_remote_datagram(host.clone(), port, peer_hdl)?;

        let input: SharedJobQueue = SharedJobQueue::default();
        let output: SharedJobQueue = SharedJobQueue::default();
        {
            let mut inner = self.inner.borrow_mut();
            assert!(
                !inner.datagrams.contains_key(&hdl),
                "datagram handle {} already has a record",
                hdl.id()
            );
            inner.datagrams.insert(
                hdl,
                DatagramState::entangled(Rc::clone(&input), Rc::clone(&output)),
            );
        }
        {
            let mut peer_inner = peer.inner.borrow_mut();
            assert!(
                !peer_inner.datagrams.contains_key(&peer_hdl),
                "datagram handle {} already has a record on the peer",
                peer_hdl.id()
            );
            peer_inner
                .datagrams
                .insert(peer_hdl, DatagramState::entangled(output, input));
        }
        tracing::debug!(
            hdl = hdl.id(),
            peer_hdl = peer_hdl.id(),
            host = %host,
            port,
            "entangled datagram pair"
        );
        Ok(())
    }

    /// Models a datagram arriving on the wire: enqueues `(ep, bytes)` on the
    /// endpoint's input queue, then immediately attempts a read.
    ///
    /// Fails with [`MuxError::MessageTooLarge`] when the payload exceeds the
    /// endpoint's configured maximum, leaving the queue untouched.
    pub fn virtual_send_datagram(
        &self,
        src: DatagramHandle,
        ep: EndpointId,
        bytes: &[u8],
    ) -> MuxResult<()> {
        self.guard.check();
        {
            let inner = self.inner.borrow();
            let state = inner.datagram(src);
            if bytes.len() > state.max_datagram_size {
                return Err(MuxError::MessageTooLarge {
                    size: bytes.len(),
                    max: state.max_datagram_size,
                });
            }
            state.vn_buf.borrow_mut().push_back(Job {
                peer: ep,
                payload: bytes.to_vec(),
            });
        }
        tracing::trace!(
            hdl = src.id(),
            ep = ep.id(),
            num_bytes = bytes.len(),
            "virtual send datagram"
        );
        self.read_datagram(src);
        Ok(())
    }

    /// Pops exactly one job from the endpoint's input queue and delivers it.
    ///
    /// A peer identity not yet present in the endpoint's peer map is
    /// auto-registered by consuming its pending-endpoint entry; an identity
    /// known to neither map is a fatal logic error. Returns `false` without
    /// consuming anything when reading is stopped, no servant is attached or
    /// the queue is empty.
    pub fn read_datagram(&self, hdl: DatagramHandle) -> bool {
        self.guard.check();
        let (servant, job) = {
            let mut inner = self.inner.borrow_mut();
            {
                let state = inner.datagram(hdl);
                if state.stopped_reading || state.servant.is_none() {
                    return false;
                }
            }
            let job = {
                let state = inner.datagram(hdl);
                let mut queue = state.vn_buf.borrow_mut();
                match queue.pop_front() {
                    Some(job) => job,
                    None => return false,
                }
            };
            if !inner.datagram(hdl).peers.contains_key(&job.peer) {
                match inner.pending_endpoints.remove(&job.peer) {
                    Some(target) => {
                        inner.datagram_mut(hdl).peers.insert(job.peer, target);
                        tracing::trace!(
                            hdl = hdl.id(),
                            ep = job.peer.id(),
                            peer = target.id(),
                            "auto-registered peer"
                        );
                    }
                    None => panic!(
                        "datagram peer id {} was never registered with endpoint {}",
                        job.peer.id(),
                        hdl.id()
                    ),
                }
            }
            let state = inner.datagram_mut(hdl);
            let servant = state
                .servant
                .clone()
                .unwrap_or_else(|| panic!("datagram endpoint {} lost its servant", hdl.id()));
            state.rd_buf = Some(job.clone());
            (servant, job)
        };
        tracing::trace!(
            hdl = hdl.id(),
            ep = job.peer.id(),
            num_bytes = job.payload.len(),
            "delivering datagram"
        );
        servant
            .borrow_mut()
            .datagram_received(self, hdl, job.peer, &job.payload);
        true
    }

    /// Enqueues `(ep, bytes)` on the endpoint's output queue, which is the peer's
    /// input queue when the pair is entangled. Schedules a write
    /// acknowledgement when enabled for the handle.
    ///
    /// Fails with [`MuxError::MessageTooLarge`] when the payload exceeds the
    /// endpoint's configured maximum.
    pub fn write_datagram(
        &self,
        hdl: DatagramHandle,
        ep: EndpointId,
        bytes: &[u8],
    ) -> MuxResult<()> {
        self.guard.check();
        let ack = {
            let inner = self.inner.borrow();
            let state = inner.datagram(hdl);
            if bytes.len() > state.max_datagram_size {
                return Err(MuxError::MessageTooLarge {
                    size: bytes.len(),
                    max: state.max_datagram_size,
                });
            }
            state.wr_buf.borrow_mut().push_back(Job {
                peer: ep,
                payload: bytes.to_vec(),
            });
            state.ack_writes
        };
        tracing::trace!(
            hdl = hdl.id(),
            ep = ep.id(),
            num_bytes = bytes.len(),
            "write datagram"
        );
        if ack {
            self.schedule_notification(Notification::DatagramWriteAck {
                datagram: hdl,
                num_bytes: bytes.len(),
            });
        }
        Ok(())
    }

    /// Drops the datagram record. Entangled peers keep their view of the
    /// shared job queues.
    pub fn close_datagram(&self, hdl: DatagramHandle) {
        self.guard.check();
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.datagrams.remove(&hdl).is_some(),
            "unknown datagram handle {}",
            hdl.id()
        );
        tracing::debug!(hdl = hdl.id(), "closed datagram endpoint");
    }

    // Flags and inspection.

    /// Returns whether the endpoint is closed for reading.
    pub fn datagram_stopped_reading(&self, hdl: DatagramHandle) -> bool {
        self.guard.check();
        self.inner.borrow().datagram(hdl).stopped_reading
    }

    /// Sets whether the endpoint is closed for reading.
    pub fn set_datagram_stopped_reading(&self, hdl: DatagramHandle, value: bool) {
        self.guard.check();
        self.inner.borrow_mut().datagram_mut(hdl).stopped_reading = value;
    }

    /// Returns whether the endpoint is in passive mode.
    pub fn datagram_passive_mode(&self, hdl: DatagramHandle) -> bool {
        self.guard.check();
        self.inner.borrow().datagram(hdl).passive_mode
    }

    /// Sets whether the endpoint is in passive mode.
    pub fn set_datagram_passive_mode(&self, hdl: DatagramHandle, value: bool) {
        self.guard.check();
        self.inner.borrow_mut().datagram_mut(hdl).passive_mode = value;
    }

    /// Returns whether the endpoint receives write acknowledgements.
    pub fn datagram_ack_writes(&self, hdl: DatagramHandle) -> bool {
        self.guard.check();
        self.inner.borrow().datagram(hdl).ack_writes
    }

    /// Sets whether the endpoint receives write acknowledgements.
    pub fn set_datagram_ack_writes(&self, hdl: DatagramHandle, value: bool) {
        self.guard.check();
        self.inner.borrow_mut().datagram_mut(hdl).ack_writes = value;
    }

    /// Returns the remote port this record stands for.
    pub fn datagram_port(&self, hdl: DatagramHandle) -> u16 {
        self.guard.check();
        self.inner.borrow().datagram(hdl).port
    }

    /// Sets the remote port this record stands for.
    pub fn set_datagram_port(&self, hdl: DatagramHandle, port: u16) {
        self.guard.check();
        self.inner.borrow_mut().datagram_mut(hdl).port = port;
    }

    /// Returns the endpoint's local socket port.
    pub fn local_port(&self, hdl: DatagramHandle) -> u16 {
        self.guard.check();
        self.inner.borrow().datagram(hdl).local_port
    }

    /// Sets the endpoint's local socket port.
    pub fn set_local_port(&self, hdl: DatagramHandle, port: u16) {
        self.guard.check();
        self.inner.borrow_mut().datagram_mut(hdl).local_port = port;
    }

    /// Returns the endpoint's maximum accepted datagram size.
    pub fn max_datagram_size(&self, hdl: DatagramHandle) -> usize {
        self.guard.check();
        self.inner.borrow().datagram(hdl).max_datagram_size
    }

    /// Sets the endpoint's maximum accepted datagram size.
    pub fn set_max_datagram_size(&self, hdl: DatagramHandle, size: usize) {
        self.guard.check();
        self.inner.borrow_mut().datagram_mut(hdl).max_datagram_size = size;
    }

    /// Snapshot of the jobs pending "on the network" for `hdl`.
    pub fn virtual_queue(&self, hdl: DatagramHandle) -> Vec<Job> {
        self.guard.check();
        self.inner
            .borrow()
            .datagram(hdl)
            .vn_buf
            .borrow()
            .iter()
            .cloned()
            .collect()
    }

    /// Snapshot of the endpoint's pending outbound jobs.
    pub fn output_queue(&self, hdl: DatagramHandle) -> Vec<Job> {
        self.guard.check();
        self.inner
            .borrow()
            .datagram(hdl)
            .wr_buf
            .borrow()
            .iter()
            .cloned()
            .collect()
    }

    /// Returns the job delivered by the most recent read on `hdl`.
    pub fn last_job(&self, hdl: DatagramHandle) -> Option<Job> {
        self.guard.check();
        self.inner.borrow().datagram(hdl).rd_buf.clone()
    }

    /// Returns the handle of the peer that sent the most recently read job.
    pub fn last_sender(&self, hdl: DatagramHandle) -> Option<DatagramHandle> {
        self.guard.check();
        let inner = self.inner.borrow();
        let state = inner.datagram(hdl);
        state
            .rd_buf
            .as_ref()
            .and_then(|job| state.peers.get(&job.peer).copied())
    }

    /// Snapshot of every peer the endpoint has spoken with.
    pub fn peers(&self, hdl: DatagramHandle) -> Vec<(EndpointId, DatagramHandle)> {
        self.guard.check();
        self.inner
            .borrow()
            .datagram(hdl)
            .peers
            .iter()
            .map(|(ep, peer)| (*ep, *peer))
            .collect()
    }

    /// Returns the resolution target registered for `ep`, if any.
    pub fn pending_endpoint(&self, ep: EndpointId) -> Option<DatagramHandle> {
        self.guard.check();
        self.inner.borrow().pending_endpoints.get(&ep).copied()
    }

    /// Returns whether a remote datagram reservation exists for
    /// `(host, port)`.
    pub fn has_pending_remote_endpoint(&self, host: &str, port: u16) -> bool {
        self.guard.check();
        self.inner
            .borrow()
            .reserved_remote_datagrams
            .contains_key(&(host.to_string(), port))
    }

    /// Returns whether `hdl` names a live datagram endpoint or a reservation
    /// target.
    pub fn is_known_datagram(&self, hdl: DatagramHandle) -> bool {
        self.guard.check();
        let inner = self.inner.borrow();
        inner.datagrams.contains_key(&hdl)
            || inner.reserved_local_datagrams.values().any(|h| *h == hdl)
            || inner.reserved_remote_datagrams.values().any(|h| *h == hdl)
    }
}
