mod common;

use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use common::FakeSpawner;
use portico::cgi::registry::CgiRegistry;
use portico::cgi::session::{CgiIo, CgiSession, CgiState};
use portico::cgi::spawn::{CgiLaunch, Signal};
use portico::config::Timeouts;
use portico::event::lab::LabBackend;
use portico::event::{Interest, Readiness};
use portico::http::queue::ResponseQueue;
use portico::http::request::{Method, RequestBuilder};
use portico::http::response::ConnectionPolicy;
use portico::server::context::Context;

fn post_launch(body: &[u8]) -> CgiLaunch {
    let request = RequestBuilder::new()
        .method(Method::POST)
        .path("/script.cgi?debug=1")
        .header("Host", "x")
        .header("Content-Type", "text/plain")
        .header("Content-Length", body.len().to_string())
        .body(body.to_vec())
        .build()
        .unwrap();
    CgiLaunch::from_request(Path::new("/srv/script.cgi"), &request)
}

/// Reads until the child's stdout is drained and closed.
fn read_to_eof(session: &mut CgiSession, now: Instant) {
    for _ in 0..100 {
        match session.on_read(now) {
            CgiIo::ReadComplete => return,
            CgiIo::Continue => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
    panic!("stdout never reached eof");
}

#[test]
fn test_launch_environment() {
    let launch = post_launch(b"abcd");

    assert_eq!(launch.var("REQUEST_METHOD"), Some("POST"));
    assert_eq!(launch.var("CONTENT_LENGTH"), Some("4"));
    assert_eq!(launch.var("CONTENT_TYPE"), Some("text/plain"));
    assert_eq!(launch.var("QUERY_STRING"), Some("debug=1"));
    assert_eq!(launch.env.len(), 4);
}

#[test]
fn test_session_writes_body_then_reads_output() {
    let mut spawner = FakeSpawner::default();
    let now = Instant::now();
    let mut session = CgiSession::new(9, ConnectionPolicy::KeepAlive, now);
    session
        .start(&mut spawner, &post_launch(b"abcd"), b"abcd".to_vec(), now)
        .unwrap();
    assert_eq!(session.state(), CgiState::Writing);

    assert_eq!(session.on_write(now), CgiIo::WriteComplete);
    assert_eq!(session.written(), 4);
    assert_eq!(session.state(), CgiState::Reading);

    let mut child = spawner.take_child();
    let mut received = [0u8; 4];
    child.stdin.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"abcd");

    child
        .stdout
        .write_all(b"Content-Type: text/plain\r\nContent-Length: 2\r\n\r\nok")
        .unwrap();
    drop(child.stdout);
    read_to_eof(&mut session, now);
    assert!(session.is_eof());

    let mut queue = ResponseQueue::new();
    session.build_response(&mut queue);
    assert!(session.is_completed());
    assert!(session.is_response_sent());

    let text = String::from_utf8_lossy(queue.pop().unwrap().bytes()).to_string();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Connection: keep-alive\r\n"));
    assert!(text.ends_with("ok"));
}

#[test]
fn test_stdout_watched_only_after_body_is_written() {
    let lab = LabBackend::new();
    let spawner = FakeSpawner::default();
    let mut ctx = Context::new(Box::new(lab.clone()), Box::new(spawner.clone()), Timeouts::default());
    let now = Instant::now();

    let id = ctx
        .launch_cgi(9, &post_launch(b"abcd"), b"abcd".to_vec(), ConnectionPolicy::KeepAlive, now)
        .unwrap();
    let stdin = ctx.cgi.get(id).unwrap().stdin_fd().unwrap();
    let stdout = ctx.cgi.get(id).unwrap().stdout_fd().unwrap();

    assert!(lab.is_watched(stdin, Interest::WRITABLE));
    assert!(lab.interest(stdout).is_none());
    assert!(!ctx.cgi.has_fd(stdout));

    assert_eq!(ctx.cgi.get_mut(id).unwrap().on_write(now), CgiIo::WriteComplete);
    ctx.switch_to_stdout(id, stdin, now).unwrap();

    assert!(lab.interest(stdin).is_none());
    assert!(!ctx.cgi.has_fd(stdin));
    assert!(lab.is_watched(stdout, Interest::READABLE));
    assert_eq!(ctx.cgi.get(id).unwrap().stdin_fd(), None);

    let mut child = spawner.take_child();
    let mut received = Vec::new();
    child.stdin.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"abcd".to_vec());
}

#[test]
fn test_each_pipe_closed_once() {
    let mut spawner = FakeSpawner::default();
    let now = Instant::now();
    let mut session = CgiSession::new(3, ConnectionPolicy::KeepAlive, now);
    session.start(&mut spawner, &post_launch(b""), Vec::new(), now).unwrap();
    let stdin = session.stdin_fd().unwrap();
    let stdout = session.stdout_fd().unwrap();

    let mut registry = CgiRegistry::new();
    let id = registry.insert(session);
    assert!(registry.add_fd(stdin, id));
    assert!(registry.add_fd(stdout, id));
    assert!(!registry.add_fd(stdout, id));

    assert!(registry.remove_fd(stdin).is_none());
    assert!(registry.remove_fd(stdin).is_none());
    assert_eq!(registry.fd_count(), 1);
    assert!(!registry.get_mut(id).unwrap().close_fd(stdin));

    // Client still attached: the session survives losing its last pipe.
    assert!(registry.remove_fd(stdout).is_none());
    assert_eq!(registry.len(), 1);

    let released = registry.detach_client(id);
    assert!(released.is_some());
    assert!(registry.is_empty());
}

#[test]
fn test_detached_session_lives_until_last_pipe() {
    let mut spawner = FakeSpawner::default();
    let now = Instant::now();
    let mut session = CgiSession::new(3, ConnectionPolicy::KeepAlive, now);
    session.start(&mut spawner, &post_launch(b""), Vec::new(), now).unwrap();
    let stdout = session.stdout_fd().unwrap();

    let mut registry = CgiRegistry::new();
    let id = registry.insert(session);
    registry.add_fd(stdout, id);

    assert!(registry.detach_client(id).is_none());
    assert_eq!(registry.len(), 1);
    assert!(registry.remove_fd(stdout).is_some());
    assert!(registry.is_empty());
}

#[test]
fn test_timeout_terminates_child() {
    let mut spawner = FakeSpawner::default();
    let start = Instant::now();
    let mut session = CgiSession::new(3, ConnectionPolicy::KeepAlive, start);
    session
        .start(&mut spawner, &post_launch(b"abcd"), b"abcd".to_vec(), start)
        .unwrap();

    let limit = Duration::from_secs(10);
    assert!(!session.is_timed_out(start + Duration::from_secs(5), limit));
    assert!(session.is_timed_out(start + Duration::from_secs(11), limit));

    session.on_timeout();
    assert_eq!(session.state(), CgiState::TimedOut);
    assert!(session.is_failed());
    assert_eq!(*spawner.signals.borrow(), vec![Signal::Terminate]);

    session.on_timeout();
    assert_eq!(spawner.signals.borrow().len(), 1);

    let mut queue = ResponseQueue::new();
    session.build_response(&mut queue);
    assert!(queue.pop().unwrap().bytes().starts_with(b"HTTP/1.1 500"));
}

#[test]
fn test_failed_launch_leaves_nothing_behind() {
    let lab = LabBackend::new();
    let spawner = FakeSpawner::default();
    spawner.refuse.set(true);
    let mut ctx = Context::new(Box::new(lab.clone()), Box::new(spawner), Timeouts::default());

    let result = ctx.launch_cgi(
        9,
        &post_launch(b""),
        Vec::new(),
        ConnectionPolicy::KeepAlive,
        Instant::now(),
    );

    assert!(result.is_err());
    assert!(ctx.cgi.is_empty());
    assert_eq!(lab.watched(), 0);
}
