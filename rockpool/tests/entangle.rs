//! Cross-multiplexer tests: entangled pairs, accepts and the end-to-end
//! client/server scenario.

mod support;

use rockpool::{ConnectionHandle, DatagramHandle, ListenerHandle, SimMultiplexer};
use support::{acceptor, attaching_acceptor, datagram_servant, stream_servant};

#[test]
fn client_server_end_to_end() {
    // Two multiplexers stand for two processes: m1 is the server host,
    // m2 the client host.
    let m1 = SimMultiplexer::new();
    let m2 = SimMultiplexer::new();
    let lst = ListenerHandle::new(1);
    let c1 = ConnectionHandle::new(10);
    let c2 = ConnectionHandle::new(20);

    m1.provision_listener(8080, lst).unwrap();
    let server_stream = stream_servant();
    let listener = attaching_acceptor(server_stream.clone());
    m1.new_listener(lst, 8080, listener.clone()).unwrap();

    m1.entangle(lst, c1, &m2, "localhost", 8080, c2).unwrap();
    assert_eq!(m1.pending_accepts(lst), vec![c1]);

    let resolved = m2.connect("localhost", 8080).unwrap();
    assert_eq!(resolved, c2);
    let client_stream = stream_servant();
    m2.new_connection(c2, client_stream.clone());
    m2.set_ack_writes(c2, true);

    // Accepting completes the pending connection and notifies the listener's
    // servant through the runnable queue.
    assert!(m1.accept(lst));
    assert!(m1.pending_accepts(lst).is_empty());
    assert_eq!(m1.drain(), 1);
    assert_eq!(listener.borrow().accepted, vec![(lst, c1)]);

    // The client writes; draining m2 flushes its write acknowledgement.
    m2.write(c2, b"ping");
    assert_eq!(m2.drain(), 1);
    assert_eq!(client_stream.borrow().acked, vec![4]);

    // The bytes surface on the server side.
    assert!(m1.read(c1));
    assert_eq!(server_stream.borrow().received, vec![b"ping".to_vec()]);
}

#[test]
fn entangled_buffers_stay_symmetric() {
    let m1 = SimMultiplexer::new();
    let m2 = SimMultiplexer::new();
    let lst = ListenerHandle::new(1);
    let c1 = ConnectionHandle::new(1);
    let c2 = ConnectionHandle::new(2);

    m1.new_listener(lst, 8080, acceptor()).unwrap();
    m1.entangle(lst, c1, &m2, "localhost", 8080, c2).unwrap();
    m2.connect("localhost", 8080).unwrap();

    let server = stream_servant();
    let client = stream_servant();
    m1.new_connection(c1, server.clone());
    m2.new_connection(c2, client.clone());

    // Server to client, split across two writes, delivered as one read.
    m1.write(c1, b"he");
    m1.write(c1, b"llo");
    assert!(m2.read(c2));
    assert_eq!(client.borrow().received, vec![b"hello".to_vec()]);

    // Client to server, interleaved with reads, stays ordered and lossless.
    m2.write(c2, b"wor");
    assert!(m1.read(c1));
    m2.write(c2, b"ld");
    assert!(m1.read(c1));
    assert_eq!(
        server.borrow().received,
        vec![b"wor".to_vec(), b"ld".to_vec()]
    );

    // Nothing is duplicated.
    assert!(!m1.read(c1));
    assert!(!m2.read(c2));
}

#[test]
fn accept_without_pending_is_a_no_op() {
    let mux = SimMultiplexer::new();
    let lst = ListenerHandle::new(1);
    mux.new_listener(lst, 8080, acceptor()).unwrap();

    assert!(!mux.accept(lst));
    assert!(!mux.try_accept());
    assert_eq!(mux.drain(), 0);
}

#[test]
fn try_accept_scans_listeners_in_handle_order() {
    let mux = SimMultiplexer::new();
    let lst_a = ListenerHandle::new(1);
    let lst_b = ListenerHandle::new(2);
    let conn_a = ConnectionHandle::new(10);
    let conn_b = ConnectionHandle::new(20);

    let listener_a = acceptor();
    let listener_b = acceptor();
    mux.new_listener(lst_a, 8080, listener_a.clone()).unwrap();
    mux.new_listener(lst_b, 8081, listener_b.clone()).unwrap();
    mux.add_pending_connect(lst_b, conn_b);
    mux.add_pending_connect(lst_a, conn_a);

    // The listener with the lowest handle wins, regardless of queueing order.
    assert!(mux.try_accept());
    mux.drain();
    assert_eq!(listener_a.borrow().accepted, vec![(lst_a, conn_a)]);
    assert!(listener_b.borrow().accepted.is_empty());

    assert!(mux.try_accept());
    mux.drain();
    assert_eq!(listener_b.borrow().accepted, vec![(lst_b, conn_b)]);

    assert!(!mux.try_accept());
}

#[test]
fn accepts_complete_in_fifo_order() {
    let mux = SimMultiplexer::new();
    let lst = ListenerHandle::new(1);
    let first = ConnectionHandle::new(10);
    let second = ConnectionHandle::new(11);

    let listener = acceptor();
    mux.new_listener(lst, 8080, listener.clone()).unwrap();
    mux.add_pending_connect(lst, first);
    mux.add_pending_connect(lst, second);

    assert!(mux.accept(lst));
    assert!(mux.accept(lst));
    assert!(!mux.accept(lst));
    mux.drain();
    assert_eq!(
        listener.borrow().accepted,
        vec![(lst, first), (lst, second)]
    );
}

#[test]
fn accept_notification_honors_inlining() {
    let mux = SimMultiplexer::new();
    let lst = ListenerHandle::new(1);
    let conn = ConnectionHandle::new(10);
    let listener = acceptor();
    mux.new_listener(lst, 8080, listener.clone()).unwrap();
    mux.add_pending_connect(lst, conn);

    mux.inline_next_runnable();
    assert!(mux.accept(lst));

    // The notification ran synchronously instead of queueing.
    assert!(mux.runnables().is_empty());
    assert_eq!(listener.borrow().accepted, vec![(lst, conn)]);
}

#[test]
fn datagram_pair_across_multiplexers() {
    let m1 = SimMultiplexer::new();
    let m2 = SimMultiplexer::new();
    let d1 = DatagramHandle::new(1);
    let d2 = DatagramHandle::new(2);

    m1.entangle_datagram(d1, &m2, "localhost", 9000, d2).unwrap();
    assert_eq!(m2.remote_datagram("localhost", 9000).unwrap(), d2);

    let server = datagram_servant();
    let client = datagram_servant();
    m1.new_datagram(d1, server.clone());
    m2.new_datagram(d2, client.clone());

    // m1 knows the remote peer under a local identity.
    let ep = m1.next_endpoint_id();
    m1.register_pending_endpoint(ep, d2);

    m2.write_datagram(d2, ep, b"probe").unwrap();
    assert!(m1.read_datagram(d1));
    assert_eq!(server.borrow().received, vec![(ep, b"probe".to_vec())]);
    assert_eq!(m1.last_sender(d1), Some(d2));
    assert_eq!(m1.peers(d1), vec![(ep, d2)]);
}

#[test]
#[should_panic(expected = "already has a record")]
fn entangling_over_an_existing_record_panics() {
    let m1 = SimMultiplexer::new();
    let m2 = SimMultiplexer::new();
    let lst = ListenerHandle::new(1);
    let c1 = ConnectionHandle::new(1);
    let c2 = ConnectionHandle::new(2);

    m1.new_connection(c1, stream_servant());
    let _ = m1.entangle(lst, c1, &m2, "localhost", 8080, c2);
}
