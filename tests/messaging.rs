use std::thread;
use std::time::{Duration, Instant};

use nano_aio::{
    cv_request, timed_signal, Block, Code, Context, DialOptions, Error, ListenOptions, NotifyFlag,
    PipeEvent, PipeNotify, Protocol, Signal, Socket, TlsConfig,
};

const PATIENCE: Duration = Duration::from_secs(5);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn connect(listener: Protocol, dialer: Protocol, url: &str) -> (Socket, Socket) {
    let server = Socket::open(listener).unwrap();
    let bound = server.listen(url, ListenOptions::new()).unwrap().url();

    let client = Socket::open(dialer).unwrap();
    client
        .dial(&bound, DialOptions::new().block(true))
        .unwrap();

    (server, client)
}

#[test]
fn pair_round_trip_inproc() {
    init();

    let (a, b) = connect(Protocol::Pair, Protocol::Pair, "inproc://messaging-pair");

    b.send(b"hello", Block::Forever).unwrap();
    assert_eq!(a.recv(Block::Timeout(PATIENCE)).unwrap(), b"hello");

    a.send(b"world", Block::Forever).unwrap();
    assert_eq!(b.recv(Block::Timeout(PATIENCE)).unwrap(), b"world");
}

#[test]
fn pair_round_trip_tcp() {
    init();

    let (a, b) = connect(Protocol::Pair, Protocol::Pair, "tcp://127.0.0.1:0");

    // The listener side may still be handshaking; its send is queued until
    // the pipe attaches.
    a.send(b"from listener", Block::Timeout(PATIENCE)).unwrap();
    assert_eq!(b.recv(Block::Timeout(PATIENCE)).unwrap(), b"from listener");

    let big = vec![0x5a_u8; 256 * 1024];
    b.send(&big, Block::Forever).unwrap();
    assert_eq!(a.recv(Block::Timeout(PATIENCE)).unwrap(), big);
}

#[test]
fn req_rep_with_contexts() {
    init();

    let (rep, req) = connect(Protocol::Rep, Protocol::Req, "tcp://127.0.0.1:0");

    let servers = (0..2)
        .map(|_| {
            let ctx = Context::open(&rep).unwrap();

            thread::spawn(move || {
                let request = ctx.recv(Block::Timeout(PATIENCE)).unwrap();
                assert_eq!(request, b"ping");

                ctx.send(b"pong", Block::Timeout(PATIENCE)).unwrap();
            })
        })
        .collect::<Vec<_>>();

    let clients = (0..2)
        .map(|_| {
            let ctx = Context::open(&req).unwrap();

            thread::spawn(move || {
                let signal = Signal::new();

                cv_request(&ctx, b"ping", &signal, Some(PATIENCE))
            })
        })
        .collect::<Vec<_>>();

    for client in clients {
        assert_eq!(client.join().unwrap(), Ok(b"pong".to_vec()));
    }

    for server in servers {
        server.join().unwrap();
    }
}

#[test]
fn req_rep_socket_level() {
    init();

    let (rep, req) = connect(Protocol::Rep, Protocol::Req, "inproc://messaging-reqrep");

    req.send(b"what time is it", Block::Forever).unwrap();

    let request = rep.recv(Block::Timeout(PATIENCE)).unwrap();
    assert_eq!(request, b"what time is it");
    rep.send(b"late", Block::Forever).unwrap();

    assert_eq!(req.recv(Block::Timeout(PATIENCE)).unwrap(), b"late");

    // A rep socket with nothing to answer has no one to reply to.
    assert_eq!(
        rep.send(b"unprompted", Block::Forever),
        Err(Error::Transport(Code::STATE))
    );
}

#[test]
fn pub_sub_filters_topics() {
    init();

    let (publisher, subscriber) = connect(Protocol::Pub, Protocol::Sub, "inproc://messaging-pubsub");

    subscriber.subscribe(b"news").unwrap();

    for message in [&b"news: one"[..], b"sports: two", b"news: three"] {
        publisher.send(message, Block::Forever).unwrap();
    }

    assert_eq!(subscriber.recv(Block::Timeout(PATIENCE)).unwrap(), b"news: one");
    assert_eq!(subscriber.recv(Block::Timeout(PATIENCE)).unwrap(), b"news: three");
    assert_eq!(
        subscriber.recv(Block::Timeout(Duration::from_millis(50))),
        Err(Error::Timeout)
    );

    assert_eq!(
        subscriber.unsubscribe(b"weather"),
        Err(Error::Transport(Code::NOT_FOUND))
    );
    assert_eq!(
        publisher.recv(Block::NonBlocking),
        Err(Error::Transport(Code::NOT_SUPPORTED))
    );
}

#[test]
fn push_pull_keeps_order() {
    init();

    let (pull, push) = connect(Protocol::Pull, Protocol::Push, "inproc://messaging-pipeline");

    for n in 0..3_u8 {
        push.send(&[n], Block::Forever).unwrap();
    }

    for n in 0..3_u8 {
        assert_eq!(pull.recv(Block::Timeout(PATIENCE)).unwrap(), vec![n]);
    }
}

#[test]
fn bus_reaches_every_peer() {
    init();

    let hub = Socket::open(Protocol::Bus).unwrap();
    hub.listen("inproc://messaging-bus", ListenOptions::new())
        .unwrap();

    let spokes = (0..2)
        .map(|_| {
            let spoke = Socket::open(Protocol::Bus).unwrap();
            spoke
                .dial("inproc://messaging-bus", DialOptions::new().block(true))
                .unwrap();
            spoke
        })
        .collect::<Vec<_>>();

    hub.send(b"all hands", Block::Forever).unwrap();

    for spoke in &spokes {
        assert_eq!(spoke.recv(Block::Timeout(PATIENCE)).unwrap(), b"all hands");
    }

    spokes[0].send(b"from a spoke", Block::Forever).unwrap();
    assert_eq!(hub.recv(Block::Timeout(PATIENCE)).unwrap(), b"from a spoke");
}

#[test]
fn pair_round_trip_tls() {
    init();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_pem = cert.cert.pem();
    let key_pem = cert.key_pair.serialize_pem();

    let server = Socket::open(Protocol::Pair).unwrap();
    let listener = server
        .listen(
            "tls+tcp://127.0.0.1:0",
            ListenOptions::new().tls(TlsConfig::server(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap()),
        )
        .unwrap();

    let port = listener.url().rsplit(':').next().unwrap().to_string();

    let client = Socket::open(Protocol::Pair).unwrap();
    client
        .dial(
            &format!("tls+tcp://localhost:{port}"),
            DialOptions::new()
                .block(true)
                .tls(TlsConfig::client_with_ca(cert_pem.as_bytes()).unwrap()),
        )
        .unwrap();

    client.send(b"secret", Block::Forever).unwrap();
    assert_eq!(server.recv(Block::Timeout(PATIENCE)).unwrap(), b"secret");

    server.send(b"also secret", Block::Timeout(PATIENCE)).unwrap();
    assert_eq!(client.recv(Block::Timeout(PATIENCE)).unwrap(), b"also secret");
}

#[test]
fn pipe_notify_signals_add_and_remove() {
    init();

    let server = Socket::open(Protocol::Pair).unwrap();
    server
        .listen("inproc://messaging-notify", ListenOptions::new())
        .unwrap();

    let signal = Signal::new();
    server
        .pipe_notify(PipeEvent::Add | PipeEvent::Remove, PipeNotify::Signal(signal.clone()))
        .unwrap();

    let client = Socket::open(Protocol::Pair).unwrap();
    client
        .dial("inproc://messaging-notify", DialOptions::new().block(true))
        .unwrap();

    assert_eq!(signal.wait_timeout(PATIENCE), Ok(PipeEvent::Add.code()));
    assert_eq!(server.pipes(), 1);

    client.close().unwrap();

    assert_eq!(signal.wait_timeout(PATIENCE), Ok(PipeEvent::Remove.code()));
    assert_eq!(server.pipes(), 0);
}

#[test]
fn notifier_table_is_bounded() {
    init();

    let socket = Socket::open(Protocol::Bus).unwrap();

    for _ in 0..nano_aio::MAX_NOTIFIERS {
        socket
            .pipe_notify(PipeEvent::Add.into(), PipeNotify::Signal(Signal::new()))
            .unwrap();
    }

    assert_eq!(
        socket.pipe_notify(PipeEvent::Add.into(), PipeNotify::Signal(Signal::new())),
        Err(Error::Transport(Code::NO_MEMORY))
    );
}

#[test]
fn blocking_dial_to_nobody_is_refused() {
    init();

    let socket = Socket::open(Protocol::Req).unwrap();

    let dialed = socket.dial("tcp://127.0.0.1:1", DialOptions::new().block(true));

    assert_eq!(
        dialed.map(|_| ()),
        Err(Error::Transport(Code::CONN_REFUSED))
    );
}

#[test]
fn cv_request_to_unreachable_peer_times_out() {
    init();

    let socket = Socket::open(Protocol::Req).unwrap();
    socket
        .dial("tcp://127.0.0.1:1", DialOptions::new())
        .unwrap();

    let ctx = Context::open(&socket).unwrap();
    let signal = Signal::new();

    let timeout = Duration::from_millis(100);
    let started = Instant::now();

    assert_eq!(
        cv_request(&ctx, b"anyone?", &signal, Some(timeout)),
        Err(Error::Timeout)
    );

    let elapsed = started.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(2));

    // The stopped request raised the signal once, with its cancellation.
    assert_eq!(signal.wait_timeout(PATIENCE), Ok(Code::CANCELED.raw()));
    assert_eq!(
        signal.wait_timeout(Duration::from_millis(100)),
        Err(Error::Timeout)
    );
}

#[test]
fn locked_socket_refuses_new_pipes() {
    init();

    let server = Socket::open(Protocol::Bus).unwrap();
    server
        .listen("inproc://messaging-locked", ListenOptions::new())
        .unwrap();

    server.lock(None).unwrap();

    let client = Socket::open(Protocol::Bus).unwrap();
    assert_eq!(
        client
            .dial("inproc://messaging-locked", DialOptions::new().block(true))
            .map(|_| ()),
        Err(Error::Transport(Code::CONN_REFUSED))
    );
    assert_eq!(server.pipes(), 0);

    server.unlock().unwrap();

    client
        .dial("inproc://messaging-locked", DialOptions::new().block(true))
        .unwrap();
    assert_eq!(server.pipes(), 1);
}

#[test]
fn signal_lock_admits_one_peer_at_a_time() {
    init();

    let url = "inproc://messaging-one-at-a-time";

    let server = Socket::open(Protocol::Bus).unwrap();
    server.listen(url, ListenOptions::new()).unwrap();

    let signal = Signal::new();
    let also = Signal::new();

    server
        .pipe_notify(
            PipeEvent::Add | PipeEvent::Remove,
            PipeNotify::Signals {
                signal: signal.clone(),
                also: Some(also.clone()),
                flag: NotifyFlag::Set,
            },
        )
        .unwrap();
    server.lock(Some(signal.clone())).unwrap();

    let first = Socket::open(Protocol::Bus).unwrap();
    first.dial(url, DialOptions::new().block(true)).unwrap();

    assert_eq!(signal.wait_timeout(PATIENCE), Ok(PipeEvent::Add.code()));
    assert_eq!(also.wait_timeout(PATIENCE), Ok(PipeEvent::Add.code()));
    assert!(signal.is_flagged());

    let second = Socket::open(Protocol::Bus).unwrap();
    assert_eq!(
        second.dial(url, DialOptions::new().block(true)).map(|_| ()),
        Err(Error::Transport(Code::CONN_REFUSED))
    );

    first.close().unwrap();
    assert_eq!(signal.wait_timeout(PATIENCE), Ok(PipeEvent::Remove.code()));

    second.dial(url, DialOptions::new().block(true)).unwrap();
    assert_eq!(server.pipes(), 1);
}

#[test]
fn socket_options_read_back() {
    init();

    let socket = Socket::open(Protocol::Pull).unwrap();

    assert_eq!(socket.recv_timeout(), Ok(None));

    socket
        .set_recv_timeout(Some(Duration::from_millis(20)))
        .unwrap();
    assert_eq!(socket.recv_timeout(), Ok(Some(Duration::from_millis(20))));
    assert_eq!(socket.send_timeout(), Ok(None));

    // The timeout applies to `Block::Default`.
    assert_eq!(socket.recv(Block::Default), Err(Error::Timeout));

    socket.close().unwrap();
    assert_eq!(socket.recv_timeout(), Err(Error::Closed));
}

#[test]
fn timed_signal_wakes_a_waiter() {
    init();

    let signal = Signal::new();

    let started = Instant::now();
    timed_signal(&signal, 5, Duration::from_millis(50));

    assert_eq!(signal.wait_timeout(PATIENCE), Ok(5));
    assert!(started.elapsed() >= Duration::from_millis(50));
}
