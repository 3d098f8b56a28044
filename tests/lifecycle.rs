use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::task::Poll;
use std::thread;
use std::time::{Duration, Instant};

use nano_aio::{
    configure, AioState, Block, Context, DialOptions, DispatcherConfig, EndpointState, Error,
    ListenOptions, Pipe, PipeEvent, PipeNotify, Protocol, ResourceState, Signal, Socket,
};

const PATIENCE: Duration = Duration::from_secs(5);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pair(name: &str) -> (Socket, Socket) {
    let url = format!("inproc://lifecycle-{name}");

    let a = Socket::open(Protocol::Pair).unwrap();
    a.listen(&url, ListenOptions::new()).unwrap();

    let b = Socket::open(Protocol::Pair).unwrap();
    b.dial(&url, DialOptions::new().block(true)).unwrap();

    (a, b)
}

#[test]
fn signal_wait_alternates_between_threads() {
    init();

    let ping = Signal::new();
    let pong = Signal::new();

    let echo = {
        let ping = ping.clone();
        let pong = pong.clone();

        thread::spawn(move || {
            for _ in 0..100 {
                let value = ping.wait();
                pong.signal(value + 1);
            }
        })
    };

    for n in 0..100 {
        ping.signal(n);
        assert_eq!(pong.wait_timeout(PATIENCE), Ok(n + 1));
    }

    echo.join().unwrap();
}

#[test]
fn concurrent_close_tears_down_once() {
    init();

    let (a, _b) = pair("close-race");

    let removed = Arc::new(AtomicUsize::new(0));
    let done = Signal::new();

    {
        let removed = removed.clone();

        a.pipe_notify(
            PipeEvent::Remove.into(),
            PipeNotify::Callback(Arc::new(move |_: PipeEvent, _: Pipe| {
                removed.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }

    a.pipe_notify(PipeEvent::Remove.into(), PipeNotify::Signal(done.clone()))
        .unwrap();

    let barrier = Arc::new(Barrier::new(8));

    let closers = (0..8)
        .map(|_| {
            let a = a.clone();
            let barrier = barrier.clone();

            thread::spawn(move || {
                barrier.wait();
                a.close()
            })
        })
        .collect::<Vec<_>>();

    for closer in closers {
        assert_eq!(closer.join().unwrap(), Ok(()));
    }

    assert_eq!(done.wait_timeout(PATIENCE), Ok(PipeEvent::Remove.code()));
    thread::sleep(Duration::from_millis(50));

    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(a.state(), ResourceState::Closed);
}

#[test]
fn close_fails_pending_operations() {
    init();

    let socket = Socket::open(Protocol::Rep).unwrap();
    let ctx = Context::open(&socket).unwrap();

    let on_socket = socket.recv_aio(None).unwrap();
    let on_context = ctx.recv_aio(None).unwrap();

    socket.close().unwrap();

    for aio in [&on_socket, &on_context] {
        assert_eq!(aio.wait(), AioState::Errored);
        assert_eq!(aio.take(), Poll::Ready(Err(Error::Closed)));
    }

    assert_eq!(ctx.state(), ResourceState::Closed);
    assert_eq!(ctx.recv(Block::NonBlocking), Err(Error::Closed));
    assert_eq!(socket.send(b"late", Block::NonBlocking), Err(Error::Closed));
}

#[test]
fn closing_a_context_leaves_the_socket_alone() {
    init();

    let socket = Socket::open(Protocol::Req).unwrap();
    let first = Context::open(&socket).unwrap();
    let second = Context::open(&socket).unwrap();

    first.close().unwrap();
    first.close().unwrap();

    assert_eq!(first.state(), ResourceState::Closed);
    assert_eq!(second.state(), ResourceState::Open);
    assert_eq!(socket.state(), ResourceState::Open);
}

#[test]
fn dropping_the_last_handle_finalizes() {
    init();

    let socket = Socket::open(Protocol::Pull).unwrap();
    let id = socket.id();

    let pending = socket.recv_aio(None).unwrap();
    let other = socket.clone();

    drop(socket);
    assert!(Socket::find(id).is_some());

    drop(other);
    assert!(Socket::find(id).is_none());

    let deadline = Instant::now() + PATIENCE;
    assert_eq!(pending.wait_until(deadline), AioState::Errored);
    assert_eq!(pending.take(), Poll::Ready(Err(Error::Closed)));
}

#[test]
fn closing_a_dialer_drops_its_pipes() {
    init();

    let server = Socket::open(Protocol::Bus).unwrap();
    server
        .listen("inproc://lifecycle-dialer", ListenOptions::new())
        .unwrap();

    let client = Socket::open(Protocol::Bus).unwrap();
    let dialer = client
        .dial("inproc://lifecycle-dialer", DialOptions::new().block(true))
        .unwrap();

    assert_eq!(client.pipes(), 1);
    assert_eq!(server.pipes(), 1);
    assert_eq!(client.dialers().len(), 1);

    dialer.close().unwrap();
    dialer.close().unwrap();

    assert_eq!(dialer.state(), EndpointState::Closed);
    assert_eq!(client.pipes(), 0);
    assert_eq!(server.pipes(), 0);
}

#[test]
fn aio_is_a_future() {
    init();

    let (a, b) = pair("future");

    let receive = a.recv_aio(Some(PATIENCE)).unwrap();
    b.send(b"awaited", Block::Forever).unwrap();

    assert_eq!(
        futures_lite::future::block_on(receive),
        Ok(b"awaited".to_vec())
    );
}

#[test]
fn completions_run_off_the_submitting_thread() {
    init();

    let (a, _b) = pair("off-thread");

    let (tx, rx) = mpsc::channel();

    let aio = a.send_aio(b"x", None).unwrap();
    aio.on_complete(move |aio| {
        let _ = tx.send((thread::current().id(), aio.state()));
    });

    let (completed_on, state) = rx.recv_timeout(PATIENCE).unwrap();

    assert_ne!(completed_on, thread::current().id());
    assert_eq!(state, AioState::Completed);

    // Stopping a resolved handle changes nothing.
    aio.stop();
    assert_eq!(aio.take(), Poll::Ready(Ok(())));
}

#[test]
fn configuring_a_running_dispatcher_is_rejected() {
    init();

    let socket = Socket::open(Protocol::Push).unwrap();
    socket.send(b"queued", Block::NonBlocking).ok();
    socket.close().unwrap();

    assert!(!configure(DispatcherConfig::new()));
}
