//! Pool behaviour against an in-process fake backend.
//!
//! The fake speaks just enough of the protocol: trust authentication, the
//! simple query protocol, and a handful of canned statements:
//!
//! | statement   | reply                                   |
//! |-------------|-----------------------------------------|
//! | `select X`  | one row, one column, value `X`          |
//! | `update`    | `CommandComplete` without rows          |
//! | `boom`      | `ErrorResponse` with SQLSTATE 42601     |
//! | `bye`       | like `select bye`, then the socket closes |

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use garrison_reactor::{Binding, EventSink, Reactor, Token};

use crate::{Completion, ConnInfo, ConnStatus, PgError, PgPool, PgQuery, PingStatus, PoolConfig};

// ============================================================================
// Fake backend
// ============================================================================

struct FakeBackend {
    port: u16,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeBackend {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake backend");
        let port = listener.local_addr().expect("local addr").port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&log);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let log = Arc::clone(&shared);
                thread::spawn(move || serve(stream, &log));
            }
        });
        Self { port, log }
    }

    fn info(&self) -> ConnInfo {
        ConnInfo {
            host: "127.0.0.1".to_string(),
            port: self.port,
            ..ConnInfo::default()
        }
    }

    fn queries(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }
}

fn serve(mut stream: TcpStream, log: &Mutex<Vec<String>>) {
    let Some(len) = read_len(&mut stream) else {
        return;
    };
    let mut startup = vec![0u8; len - 4];
    if stream.read_exact(&mut startup).is_err() {
        return;
    }

    let mut hello = Vec::new();
    hello.extend(message(b'R', &0i32.to_be_bytes()));
    hello.extend(message(b'S', b"server_version\x0016.4\x00"));
    hello.extend(message(b'K', &[42i32.to_be_bytes(), 7i32.to_be_bytes()].concat()));
    hello.extend(message(b'Z', b"I"));
    if stream.write_all(&hello).is_err() {
        return;
    }

    loop {
        let mut tag = [0u8; 1];
        if stream.read_exact(&mut tag).is_err() {
            return;
        }
        let Some(len) = read_len(&mut stream) else {
            return;
        };
        let mut body = vec![0u8; len - 4];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        if tag[0] != b'Q' {
            return;
        }

        let sql = String::from_utf8_lossy(&body[..body.len().saturating_sub(1)]).into_owned();
        log.lock().expect("log lock").push(sql.clone());
        let (reply, hang_up) = respond(&sql);
        if stream.write_all(&reply).is_err() || hang_up {
            return;
        }
    }
}

/// A backend that serves `sessions` connections and then stops listening.
/// Joining the handle guarantees later connects are refused.
fn short_lived_backend(sessions: usize) -> (ConnInfo, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake backend");
    let port = listener.local_addr().expect("local addr").port();
    let handle = thread::spawn(move || {
        let log = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..sessions {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let log = Arc::clone(&log);
            thread::spawn(move || serve(stream, &log));
        }
    });
    let info = ConnInfo {
        host: "127.0.0.1".to_string(),
        port,
        ..ConnInfo::default()
    };
    (info, handle)
}

fn respond(sql: &str) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut hang_up = false;
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        match statement {
            "boom" => {
                out.extend(error_response("42601", "syntax error at or near \"boom\""));
                break;
            }
            "update" => out.extend(message(b'C', b"UPDATE 1\x00")),
            "bye" => {
                out.extend(single_row("bye"));
                hang_up = true;
            }
            other => {
                let value = other.strip_prefix("select ").unwrap_or(other);
                out.extend(single_row(value));
            }
        }
    }
    out.extend(message(b'Z', b"I"));
    (out, hang_up)
}

fn read_len(stream: &mut TcpStream) -> Option<usize> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).ok()?;
    usize::try_from(i32::from_be_bytes(len)).ok().filter(|&n| n >= 4)
}

fn message(tag: u8, body: &[u8]) -> Vec<u8> {
    let len = i32::try_from(body.len() + 4).expect("message length");
    let mut out = vec![tag];
    out.extend(len.to_be_bytes());
    out.extend(body);
    out
}

fn single_row(value: &str) -> Vec<u8> {
    let mut description = Vec::new();
    description.extend(1i16.to_be_bytes());
    description.extend(b"?column?\x00");
    description.extend(0i32.to_be_bytes());
    description.extend(0i16.to_be_bytes());
    description.extend(25i32.to_be_bytes());
    description.extend((-1i16).to_be_bytes());
    description.extend((-1i32).to_be_bytes());
    description.extend(0i16.to_be_bytes());

    let mut row = Vec::new();
    row.extend(1i16.to_be_bytes());
    row.extend(i32::try_from(value.len()).expect("cell length").to_be_bytes());
    row.extend(value.as_bytes());

    let mut out = message(b'T', &description);
    out.extend(message(b'D', &row));
    out.extend(message(b'C', b"SELECT 1\x00"));
    out
}

fn error_response(code: &str, text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', text)] {
        body.push(field);
        body.extend(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    message(b'E', &body)
}

// ============================================================================
// Reactor driver
// ============================================================================

struct Driver {
    pool: PgPool<u32>,
    done: Vec<Completion<u32>>,
}

impl EventSink for Driver {
    fn on_accept(&mut self, _reactor: &mut Reactor, _token: Token) {}

    fn on_read(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        if let Binding::Pg(slot) = binding {
            self.pool.on_read(reactor, slot);
        }
    }

    fn on_write(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        if let Binding::Pg(slot) = binding {
            self.pool.on_write(reactor, slot);
        }
    }

    fn on_timeout(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        if let Binding::Pg(slot) = binding {
            self.pool.on_timeout(reactor, slot);
        }
    }
}

fn setup(backend: &FakeBackend, size_min: usize, size_max: usize) -> (Reactor, Driver) {
    let mut reactor = Reactor::new(64).expect("reactor");
    let config = PoolConfig {
        size_min,
        size_max,
        connect_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    };
    let mut pool = PgPool::new(backend.info(), config);
    pool.start(&mut reactor).expect("pool start");
    (reactor, Driver { pool, done: Vec::new() })
}

fn drive_until(reactor: &mut Reactor, driver: &mut Driver, mut done: impl FnMut(&Driver) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(driver) {
        assert!(Instant::now() < deadline, "timed out driving the pool");
        reactor
            .run_once(Some(Duration::from_millis(20)), driver)
            .expect("run_once");
        let finished = driver.pool.take_completions();
        driver.done.extend(finished);
    }
}

fn submit(reactor: &mut Reactor, driver: &mut Driver, sql: &str, tag: u32) {
    if let Err(rejected) = driver.pool.query_start(reactor, PgQuery::new(sql, tag)) {
        panic!("query {tag} rejected: {}", rejected.error);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_query_returns_rows() {
    let backend = FakeBackend::start();
    let (mut reactor, mut driver) = setup(&backend, 1, 2);

    submit(&mut reactor, &mut driver, "select 41", 1);
    drive_until(&mut reactor, &mut driver, |d| d.done.len() == 1);

    let completion = &driver.done[0];
    assert_eq!(completion.tag, 1);
    let results = completion.outcome.as_ref().expect("query succeeds");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].columns, vec!["?column?".to_string()]);
    assert_eq!(results[0].value(0, 0), Some("41"));
    assert_eq!(results[0].command_tag.as_deref(), Some("SELECT 1"));
}

#[test]
fn test_single_connection_serializes_queries() {
    let backend = FakeBackend::start();
    let (mut reactor, mut driver) = setup(&backend, 1, 1);

    submit(&mut reactor, &mut driver, "select 1", 1);
    submit(&mut reactor, &mut driver, "select 2", 2);
    assert_eq!(driver.pool.size(), 1);

    drive_until(&mut reactor, &mut driver, |d| d.done.len() == 2);

    let order: Vec<u32> = driver.done.iter().map(|c| c.tag).collect();
    assert_eq!(order, vec![1, 2]);
    assert!(driver.done.iter().all(Completion::is_ok));
    assert_eq!(backend.queries(), vec!["select 1", "select 2"]);
    assert_eq!(driver.pool.size(), 1);
}

#[test]
fn test_batch_yields_one_result_per_statement() {
    let backend = FakeBackend::start();
    let (mut reactor, mut driver) = setup(&backend, 1, 1);

    let query = PgQuery::batch(vec!["select a".to_string(), "select b".to_string()], 5);
    assert!(driver.pool.query_start(&mut reactor, query).is_ok());
    drive_until(&mut reactor, &mut driver, |d| d.done.len() == 1);

    let results = driver.done[0].outcome.as_ref().expect("batch succeeds");
    let values: Vec<_> = results.iter().map(|r| r.value(0, 0)).collect();
    assert_eq!(values, vec![Some("a"), Some("b")]);
}

#[test]
fn test_server_error_is_delivered_and_connection_reused() {
    let backend = FakeBackend::start();
    let (mut reactor, mut driver) = setup(&backend, 1, 1);

    submit(&mut reactor, &mut driver, "boom", 1);
    drive_until(&mut reactor, &mut driver, |d| d.done.len() == 1);
    match &driver.done[0].outcome {
        Err(PgError::Query { sqlstate, message }) => {
            assert_eq!(sqlstate, "42601");
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    submit(&mut reactor, &mut driver, "select 2", 2);
    drive_until(&mut reactor, &mut driver, |d| d.done.len() == 2);
    assert!(driver.done[1].is_ok());
    assert_eq!(driver.pool.statuses(), vec![(0, ConnStatus::Ready)]);
}

#[test]
fn test_command_without_rows_is_unexpected_status() {
    let backend = FakeBackend::start();
    let (mut reactor, mut driver) = setup(&backend, 1, 1);

    submit(&mut reactor, &mut driver, "update", 1);
    drive_until(&mut reactor, &mut driver, |d| d.done.len() == 1);
    assert!(matches!(
        driver.done[0].outcome,
        Err(PgError::UnexpectedStatus(ref status)) if status == "PGRES_COMMAND_OK"
    ));
}

#[test]
fn test_queue_full_rejects_with_query() {
    let backend = FakeBackend::start();
    let mut reactor = Reactor::new(64).expect("reactor");
    let config = PoolConfig {
        size_min: 0,
        size_max: 1,
        ..PoolConfig::default()
    };
    let mut pool: PgPool<u32> = PgPool::new(backend.info(), config);
    pool.start(&mut reactor).expect("pool start");

    // The first query is bound to the connection being opened.
    assert!(pool.query_start(&mut reactor, PgQuery::new("select 0", 0)).is_ok());
    for tag in 1..=65_535u32 {
        assert!(
            pool.query_start(&mut reactor, PgQuery::new("select 1", tag)).is_ok(),
            "query {tag} should be queued"
        );
    }
    assert_eq!(pool.queue_len(), 65_535);

    let rejected = pool
        .query_start(&mut reactor, PgQuery::new("select 1", 65_536))
        .expect_err("queue is full");
    assert!(matches!(rejected.error, PgError::QueueFull));
    assert_eq!(rejected.query.tag, 65_536);
    assert_eq!(rejected.error.to_string(), "Request queue is full!");
}

#[test]
fn test_closed_connection_is_reset_on_demand() {
    let backend = FakeBackend::start();
    let (mut reactor, mut driver) = setup(&backend, 1, 1);

    submit(&mut reactor, &mut driver, "bye", 1);
    drive_until(&mut reactor, &mut driver, |d| {
        d.pool.statuses() == vec![(0, ConnStatus::Error)]
    });
    assert!(driver.done[0].is_ok());

    submit(&mut reactor, &mut driver, "select 3", 2);
    drive_until(&mut reactor, &mut driver, |d| d.done.len() == 2);
    let results = driver.done[1].outcome.as_ref().expect("query after reset");
    assert_eq!(results[0].value(0, 0), Some("3"));
    assert_eq!(driver.pool.statuses(), vec![(0, ConnStatus::Ready)]);
}

#[test]
fn test_pool_shrinks_back_after_burst() {
    let backend = FakeBackend::start();
    let (mut reactor, mut driver) = setup(&backend, 1, 2);

    submit(&mut reactor, &mut driver, "select 1", 1);
    submit(&mut reactor, &mut driver, "select 2", 2);
    assert_eq!(driver.pool.size(), 2);

    drive_until(&mut reactor, &mut driver, |d| d.done.len() == 2);
    let mut tags: Vec<u32> = driver.done.iter().map(|c| c.tag).collect();
    tags.sort_unstable();
    assert_eq!(tags, vec![1, 2]);
    assert_eq!(driver.pool.size(), 1);
}

#[test]
fn test_stop_fails_outstanding_queries() {
    let backend = FakeBackend::start();
    let (mut reactor, mut driver) = setup(&backend, 1, 1);

    submit(&mut reactor, &mut driver, "select 1", 1);
    submit(&mut reactor, &mut driver, "select 2", 2);
    driver.pool.stop(&mut reactor);

    let done = driver.pool.take_completions();
    assert_eq!(done.len(), 2);
    assert!(done.iter().all(|c| matches!(c.outcome, Err(PgError::Stopped))));
    assert!(!driver.pool.is_active());
}

#[test]
fn test_unreachable_backend_fails_start() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let mut reactor = Reactor::new(16).expect("reactor");
    let info = ConnInfo {
        host: "127.0.0.1".to_string(),
        port,
        ..ConnInfo::default()
    };
    let mut pool: PgPool<u32> = PgPool::new(info, PoolConfig::default());
    match pool.start(&mut reactor) {
        Err(PgError::Ping { status }) => assert_eq!(status, PingStatus::NoResponse),
        other => panic!("unexpected start result: {other:?}"),
    }
}

#[test]
fn test_lost_backend_does_not_block_query_start() {
    let (info, listening) = short_lived_backend(1);
    let mut reactor = Reactor::new(64).expect("reactor");
    let config = PoolConfig {
        size_min: 0,
        size_max: 2,
        connect_timeout: Duration::from_secs(2),
        ..PoolConfig::default()
    };
    let mut driver = Driver {
        pool: PgPool::new(info, config),
        done: Vec::new(),
    };
    driver.pool.start(&mut reactor).expect("ping succeeds");
    listening.join().expect("backend thread");

    for tag in 1..=3u32 {
        let started = Instant::now();
        let submitted = driver.pool.query_start(&mut reactor, PgQuery::new("select 1", tag));
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(500), "query {tag} start took {elapsed:?}");
        match submitted {
            Ok(()) => drive_until(&mut reactor, &mut driver, |d| d.done.iter().any(|c| c.tag == tag)),
            Err(rejected) => assert!(matches!(rejected.error, PgError::Connection(_))),
        }
    }
    assert!(driver.done.iter().all(|c| !c.is_ok()));
    assert_eq!(driver.pool.size(), 0);
    assert_eq!(driver.pool.queue_len(), 0);
}

#[test]
fn test_failed_growth_is_not_queued() {
    // One session for the ping, one for the warm connection.
    let (info, listening) = short_lived_backend(2);
    let mut reactor = Reactor::new(64).expect("reactor");
    let config = PoolConfig {
        size_min: 1,
        size_max: 2,
        connect_timeout: Duration::from_secs(2),
        ..PoolConfig::default()
    };
    let mut driver = Driver {
        pool: PgPool::new(info, config),
        done: Vec::new(),
    };
    driver.pool.start(&mut reactor).expect("pool start");
    listening.join().expect("backend thread");
    drive_until(&mut reactor, &mut driver, |d| d.pool.idle_count() == 1);

    submit(&mut reactor, &mut driver, "select 1", 1);
    let second = driver.pool.query_start(&mut reactor, PgQuery::new("select 2", 2));
    assert_eq!(driver.pool.queue_len(), 0);

    let expected = match second {
        Ok(()) => 2,
        Err(rejected) => {
            assert_eq!(rejected.query.tag, 2);
            assert!(matches!(rejected.error, PgError::Connection(_)));
            1
        }
    };
    drive_until(&mut reactor, &mut driver, |d| d.done.len() == expected);

    let first = driver.done.iter().find(|c| c.tag == 1).expect("first query completes");
    assert!(first.is_ok());
    if let Some(grown) = driver.done.iter().find(|c| c.tag == 2) {
        assert!(!grown.is_ok());
    }
    assert_eq!(driver.pool.size(), 1);
}
