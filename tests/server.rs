use bytes::BytesMut;
use mill_serve::prelude::*;
use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Signal handlers are process-wide, so servers in this binary run one at a
/// time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Answers one line per call with `+<line>`. `quit` closes, `fail` returns
/// an error, `panic` panics, `slow` holds the worker for `pause` first.
struct LineEcho {
    disconnects: Arc<AtomicUsize>,
    pause: Duration,
}

impl ConnectionHandler for LineEcho {
    type Session = ();

    fn on_connect(&self, _conn_id: ConnectionId, _peer: SocketAddr) {}

    fn on_data(&self, _: &mut (), input: &mut BytesMut, output: &mut BytesMut) -> Result<Verdict> {
        let Some(end) = input.iter().position(|b| *b == b'\n') else {
            return Ok(Verdict::NeedMore);
        };
        let line = input.split_to(end + 1);
        match &line[..end] {
            b"quit" => Ok(Verdict::Close),
            b"fail" => Err(Error::handler("requested failure")),
            b"panic" => panic!("requested panic"),
            other => {
                if other == b"slow" {
                    thread::sleep(self.pause);
                }
                output.extend_from_slice(b"+");
                output.extend_from_slice(&line);
                Ok(Verdict::Respond { keep_alive: true })
            }
        }
    }

    fn on_disconnect(&self, _conn_id: ConnectionId) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct Running {
    addr: SocketAddr,
    handle: ShutdownHandle,
    stats: Stats,
    disconnects: Arc<AtomicUsize>,
    thread: JoinHandle<Result<()>>,
}

impl Running {
    fn connect(&self) -> BufReader<TcpStream> {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        BufReader::new(stream)
    }

    fn stop(self) -> Result<()> {
        self.handle.shutdown();
        self.thread.join().unwrap()
    }
}

fn config() -> ServerConfig {
    ServerConfig::builder()
        .address("127.0.0.1".parse().unwrap())
        .port(0)
        .workers(2)
        .queue_capacity(16)
        .build()
}

fn start(config: ServerConfig) -> Running {
    start_with_pause(config, Duration::from_millis(500))
}

fn start_with_pause(config: ServerConfig, pause: Duration) -> Running {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let server = Server::bind(
        config,
        LineEcho {
            disconnects: Arc::clone(&disconnects),
            pause,
        },
    )
    .unwrap();

    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let stats = server.stats();
    let thread = thread::spawn(move || server.run());

    Running {
        addr,
        handle,
        stats,
        disconnects,
        thread,
    }
}

fn request(client: &mut BufReader<TcpStream>, line: &str) -> String {
    client.get_mut().write_all(line.as_bytes()).unwrap();
    let mut reply = String::new();
    client.read_line(&mut reply).unwrap();
    reply
}

fn assert_closed(client: &mut BufReader<TcpStream>) {
    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, read {n} bytes"),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
}

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn test_keep_alive_round_trips() {
    let _guard = serial();
    let server = start(config());

    let mut client = server.connect();
    assert_eq!(request(&mut client, "hello\n"), "+hello\n");
    assert_eq!(request(&mut client, "again\n"), "+again\n");
    assert!(wait_for(|| server.stats.live_connections() == 1, Duration::from_secs(2)));

    drop(client);
    assert!(wait_for(|| server.stats.live_connections() == 0, Duration::from_secs(2)));
    server.stop().unwrap();
}

#[test]
fn test_partial_input_waits_for_more() {
    let _guard = serial();
    let server = start(config());

    let mut client = server.connect();
    client.get_mut().write_all(b"hel").unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(request(&mut client, "lo\n"), "+hello\n");

    server.stop().unwrap();
}

#[test]
fn test_pipelined_lines_are_all_answered() {
    let _guard = serial();
    let server = start(config());

    let mut client = server.connect();
    client.get_mut().write_all(b"one\ntwo\nthree\n").unwrap();
    for expected in ["+one\n", "+two\n", "+three\n"] {
        let mut reply = String::new();
        client.read_line(&mut reply).unwrap();
        assert_eq!(reply, expected);
    }

    server.stop().unwrap();
}

#[test]
fn test_close_verdict_and_failures_only_drop_one_connection() {
    let _guard = serial();
    let server = start(config());

    for command in ["quit\n", "fail\n", "panic\n"] {
        let mut doomed = server.connect();
        doomed.get_mut().write_all(command.as_bytes()).unwrap();
        assert_closed(&mut doomed);
    }

    let mut client = server.connect();
    assert_eq!(request(&mut client, "still here\n"), "+still here\n");
    assert!(wait_for(
        || server.disconnects.load(Ordering::SeqCst) == 3,
        Duration::from_secs(2)
    ));

    server.stop().unwrap();
}

#[test]
fn test_idle_connection_evicted() {
    let _guard = serial();
    let server = start(
        ServerConfig::builder()
            .address("127.0.0.1".parse().unwrap())
            .workers(1)
            .timeslot_secs(1)
            .idle_timeout_secs(1)
            .build(),
    );

    let mut idle = server.connect();
    let mut active = server.connect();
    assert_eq!(request(&mut active, "ping\n"), "+ping\n");

    let started = Instant::now();
    assert_closed(&mut idle);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(wait_for(|| server.stats.live_connections() <= 1, Duration::from_secs(1)));

    server.stop().unwrap();
}

#[test]
fn test_activity_refreshes_deadline() {
    let _guard = serial();
    let server = start(
        ServerConfig::builder()
            .address("127.0.0.1".parse().unwrap())
            .workers(1)
            .timeslot_secs(1)
            .idle_timeout_secs(3)
            .build(),
    );

    let mut client = server.connect();
    for _ in 0..4 {
        thread::sleep(Duration::from_millis(1000));
        assert_eq!(request(&mut client, "tick\n"), "+tick\n");
    }
    assert_eq!(server.stats.live_connections(), 1);

    server.stop().unwrap();
}

#[test]
fn test_refused_task_closes_only_that_connection() {
    let _guard = serial();
    let server = start_with_pause(
        ServerConfig::builder()
            .address("127.0.0.1".parse().unwrap())
            .workers(1)
            .queue_capacity(1)
            .submit_policy(SubmitPolicy::Reject)
            .build(),
        Duration::from_millis(1000),
    );

    // one task on the worker, one in the queue
    let mut running = server.connect();
    running.get_mut().write_all(b"slow\n").unwrap();
    thread::sleep(Duration::from_millis(150));
    let mut queued = server.connect();
    queued.get_mut().write_all(b"slow\n").unwrap();
    thread::sleep(Duration::from_millis(150));

    let mut refused = server.connect();
    refused.get_mut().write_all(b"hi\n").unwrap();
    assert_closed(&mut refused);
    assert!(wait_for(
        || server.disconnects.load(Ordering::SeqCst) == 1,
        Duration::from_secs(1)
    ));

    for client in [&mut running, &mut queued] {
        let mut reply = String::new();
        client.read_line(&mut reply).unwrap();
        assert_eq!(reply, "+slow\n");
    }

    let mut later = server.connect();
    assert_eq!(request(&mut later, "after\n"), "+after\n");
    assert_eq!(server.stats.live_connections(), 3);

    server.stop().unwrap();
}

#[test]
fn test_busy_connection_evicted_and_late_result_dropped() {
    let _guard = serial();
    let server = start_with_pause(
        ServerConfig::builder()
            .address("127.0.0.1".parse().unwrap())
            .workers(1)
            .timeslot_secs(1)
            .idle_timeout_secs(1)
            .build(),
        Duration::from_secs(4),
    );

    let mut client = server.connect();
    let started = Instant::now();
    client.get_mut().write_all(b"slow\n").unwrap();

    // evicted while the worker still holds the request
    assert_closed(&mut client);
    assert!(started.elapsed() < Duration::from_millis(3500));
    assert!(wait_for(|| server.stats.live_connections() == 0, Duration::from_secs(1)));
    assert_eq!(server.disconnects.load(Ordering::SeqCst), 1);

    // the worker finishes and its completion names a freed slot
    thread::sleep(Duration::from_secs(4).saturating_sub(started.elapsed()) + Duration::from_millis(300));
    let mut next = server.connect();
    assert_eq!(request(&mut next, "fresh\n"), "+fresh\n");
    assert_eq!(server.stats.live_connections(), 1);
    assert_eq!(server.disconnects.load(Ordering::SeqCst), 1);

    server.stop().unwrap();
}

#[test]
fn test_full_table_rejects_without_counting() {
    let _guard = serial();
    // every descriptor in a test process is >= 1, so nothing fits
    let server = start(
        ServerConfig::builder()
            .address("127.0.0.1".parse().unwrap())
            .max_connections(1)
            .build(),
    );

    let mut rejected = server.connect();
    assert_closed(&mut rejected);
    assert_eq!(server.stats.live_connections(), 0);
    assert_eq!(server.disconnects.load(Ordering::SeqCst), 0);

    server.stop().unwrap();
}

#[test]
fn test_shutdown_closes_live_connections() {
    let _guard = serial();
    let server = start(config());

    let mut client = server.connect();
    assert_eq!(request(&mut client, "hi\n"), "+hi\n");

    let disconnects = Arc::clone(&server.disconnects);
    let stats = server.stats.clone();
    server.stop().unwrap();

    assert_closed(&mut client);
    assert_eq!(stats.live_connections(), 0);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sigterm_stops_gracefully() {
    let _guard = serial();
    let server = start(config());

    let mut client = server.connect();
    assert_eq!(request(&mut client, "hi\n"), "+hi\n");

    // SAFETY: signalling our own process; the bridge handler is installed.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGTERM);
    }

    let thread = server.thread;
    assert!(wait_for(|| thread.is_finished(), Duration::from_secs(5)));
    thread.join().unwrap().unwrap();
}

#[test]
fn test_one_server_per_process() {
    let _guard = serial();
    let server = start(config());

    let second = Server::bind(
        config(),
        LineEcho {
            disconnects: Arc::new(AtomicUsize::new(0)),
            pause: Duration::ZERO,
        },
    );
    assert!(matches!(second, Err(Error::SignalBridgeInUse)));

    server.stop().unwrap();
    let third = Server::bind(
        config(),
        LineEcho {
            disconnects: Arc::new(AtomicUsize::new(0)),
            pause: Duration::ZERO,
        },
    );
    assert!(third.is_ok());
}
