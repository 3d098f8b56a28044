use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::{Duration, Instant};

use nano_aio::{ncurl, ncurl_aio, AioState, Code, Error, HttpRequest, HttpState, Session};

const PATIENCE: Duration = Duration::from_secs(5);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A tiny HTTP/1.1 server answering every request with `handler(request
/// line)`. Connections are kept alive unless the response says otherwise.
/// Returns the base URL and a counter of accepted connections.
fn serve<F>(handler: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());

    let connections = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    {
        let connections = connections.clone();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else {
                    break;
                };

                connections.fetch_add(1, Ordering::SeqCst);

                let handler = handler.clone();

                thread::spawn(move || {
                    let mut reader = BufReader::new(stream.try_clone().unwrap());

                    loop {
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                            break;
                        }

                        let mut content_length = 0;
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                                return;
                            }

                            let line = line.trim_end();
                            if line.is_empty() {
                                break;
                            }

                            if let Some((name, value)) = line.split_once(':') {
                                if name.eq_ignore_ascii_case("content-length") {
                                    content_length = value.trim().parse().unwrap();
                                }
                            }
                        }

                        let mut body = vec![0_u8; content_length];
                        reader.read_exact(&mut body).unwrap();

                        let response = handler(request_line.trim_end());
                        if stream.write_all(response.as_bytes()).is_err() {
                            break;
                        }

                        if response.contains("Connection: close") {
                            break;
                        }
                    }
                });
            }
        });
    }

    (base, connections)
}

/// Accepts connections and never answers.
fn silent() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://127.0.0.1:{}/", listener.local_addr().unwrap().port());

    thread::spawn(move || {
        let held = listener.incoming().take(4).collect::<Vec<_>>();
        thread::sleep(Duration::from_secs(30));
        drop(held);
    });

    url
}

fn ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn moved(status: &str, location: &str) -> String {
    format!("HTTP/1.1 {status}\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n")
}

#[test]
fn follows_one_redirect() {
    init();

    let (base, _) = serve(|line| {
        if line.starts_with("GET /old ") {
            moved("301 Moved Permanently", "/new")
        } else {
            ok("arrived")
        }
    });

    let response = ncurl(&format!("{base}/old"), HttpRequest::new().timeout(PATIENCE)).unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "arrived");
    assert_eq!(response.url(), format!("{base}/new"));
    assert_eq!(response.header("content-type"), Some("text/plain"));
}

#[test]
fn session_follows_one_redirect_and_stays_usable() {
    init();

    let hits = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

    let (base, connections) = {
        let hits = hits.clone();

        serve(move |line| {
            if line.starts_with("GET /old ") {
                hits[0].fetch_add(1, Ordering::SeqCst);
                moved("301 Moved Permanently", "/new")
            } else {
                hits[1].fetch_add(1, Ordering::SeqCst);
                ok("arrived")
            }
        })
    };

    let session = Session::new(&format!("{base}/old"), HttpRequest::new().timeout(PATIENCE)).unwrap();

    let response = session.transact().unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "arrived");
    assert_eq!(response.url(), format!("{base}/new"));
    assert_eq!(hits[0].load(Ordering::SeqCst), 1);
    assert_eq!(hits[1].load(Ordering::SeqCst), 1);

    // The session connection carried the 301 and is kept; the hop to /new
    // used a one-shot connection of its own.
    let response = session.transact().unwrap();

    assert_eq!(response.text(), "arrived");
    assert_eq!(hits[0].load(Ordering::SeqCst), 2);
    assert_eq!(hits[1].load(Ordering::SeqCst), 2);
    assert_eq!(connections.load(Ordering::SeqCst), 3);
    assert_eq!(session.state(), HttpState::Complete);
}

#[test]
fn huge_content_length_fails_the_request() {
    init();

    let (base, _) = serve(|_| {
        "HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nabc".to_string()
    });

    let aio = ncurl_aio(&base, HttpRequest::new()).unwrap();

    assert_eq!(aio.wait_until(Instant::now() + PATIENCE), AioState::Errored);
    assert_eq!(
        aio.take(),
        Poll::Ready(Err(Error::Transport(Code::PROTOCOL)))
    );

    // The same limit is configurable per request.
    let (base, _) = serve(|_| ok("0123456789"));

    assert_eq!(
        ncurl(&base, HttpRequest::new().max_body(4).timeout(PATIENCE)).map(|_| ()),
        Err(Error::Transport(Code::PROTOCOL))
    );
}

#[test]
fn redirect_loop_is_bounded() {
    init();

    let (base, _) = serve(|_| moved("302 Found", "/again"));

    let outcome = ncurl(
        &format!("{base}/start"),
        HttpRequest::new().max_redirects(3).timeout(PATIENCE),
    );

    assert_eq!(outcome, Err(Error::TooManyRedirects { limit: 3 }));
    assert_eq!(
        Error::TooManyRedirects { limit: 3 }.code(),
        Code::PROTOCOL
    );
}

#[test]
fn redirects_can_be_left_alone() {
    init();

    let (base, _) = serve(|_| moved("307 Temporary Redirect", "/elsewhere"));

    let response = ncurl(
        &format!("{base}/here"),
        HttpRequest::new().follow_redirects(false).timeout(PATIENCE),
    )
    .unwrap();

    assert_eq!(response.status(), 307);
    assert_eq!(response.header("Location"), Some("/elsewhere"));
}

#[test]
fn see_other_turns_post_into_get() {
    init();

    let (base, _) = serve(|line| {
        if line.starts_with("POST /form ") {
            moved("303 See Other", "/done")
        } else {
            ok(line)
        }
    });

    let response = ncurl(
        &format!("{base}/form"),
        HttpRequest::new()
            .method("post")
            .header("Content-Type", "text/plain")
            .body("payload")
            .timeout(PATIENCE),
    )
    .unwrap();

    assert_eq!(response.text(), "GET /done HTTP/1.1");
}

#[test]
fn chunked_bodies_and_header_selection() {
    init();

    let (base, _) = serve(|_| {
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-Keep: yes\r\nX-Drop: no\r\n\r\n\
         4\r\nchun\r\n3\r\nked\r\n0\r\n\r\n"
            .to_string()
    });

    let response = ncurl(
        &base,
        HttpRequest::new()
            .response_headers(["x-keep"])
            .timeout(PATIENCE),
    )
    .unwrap();

    assert_eq!(response.body(), b"chunked");
    assert_eq!(response.headers(), [("X-Keep".to_string(), "yes".to_string())]);
}

#[test]
fn session_reuses_its_connection() {
    init();

    let (base, connections) = serve(|_| ok("again"));

    let session = Session::new(&format!("{base}/poll"), HttpRequest::new().timeout(PATIENCE)).unwrap();

    for _ in 0..3 {
        assert_eq!(session.transact().unwrap().text(), "again");
    }

    assert_eq!(session.state(), HttpState::Complete);
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    session.close().unwrap();
    session.close().unwrap();

    assert_eq!(session.transact().map(|_| ()), Err(Error::Closed));
}

#[test]
fn session_reconnects_after_server_close() {
    init();

    let (base, connections) = serve(|_| {
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 3\r\n\r\nbye".to_string()
    });

    let session = Session::new(&base, HttpRequest::new().timeout(PATIENCE)).unwrap();

    assert_eq!(session.transact().unwrap().text(), "bye");
    assert_eq!(session.transact().unwrap().text(), "bye");

    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[test]
fn session_transactions_do_not_overlap() {
    init();

    let session = Session::new(&silent(), HttpRequest::new()).unwrap();

    let first = session.transact_aio().unwrap();
    assert_eq!(
        session.transact_aio().map(|_| ()),
        Err(Error::Transport(Code::BUSY))
    );

    session.close().unwrap();

    assert_eq!(first.wait(), AioState::Errored);
    assert_eq!(first.take(), Poll::Ready(Err(Error::Closed)));
}

#[test]
fn stopping_a_request_cancels_it() {
    init();

    let aio = ncurl_aio(&silent(), HttpRequest::new()).unwrap();

    thread::sleep(Duration::from_millis(50));
    aio.stop();

    assert_eq!(aio.wait(), AioState::Errored);
    assert_eq!(aio.take(), Poll::Ready(Err(Error::Transport(Code::CANCELED))));
}

#[test]
fn overall_timeout_bounds_the_request() {
    init();

    let timeout = Duration::from_millis(100);
    let started = Instant::now();

    let outcome = ncurl(&silent(), HttpRequest::new().timeout(timeout));

    assert_eq!(outcome, Err(Error::Timeout));
    assert!(started.elapsed() < timeout + Duration::from_secs(2));
}
