//! The primary's event loop against a real worker and a real client.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use fanout::balancer::{Primary, Process, ReactorConfig, WorkerConfig, run_primary, run_worker};
use fanout::core::key::BindSpec;
use fanout::protocol::UnixChannel;

/// Stands in for the worker's process; the worker itself runs on a thread.
struct Thread;

impl Process for Thread {
    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn exit_code(&self) -> Option<i32> {
        None
    }

    fn signal_code(&self) -> Option<i32> {
        None
    }

    fn refresh(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn kill(&mut self, _signal: i32) -> io::Result<()> {
        Ok(())
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(e) if Instant::now() > deadline => panic!("never listening: {e}"),
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
}

#[test]
fn primary_serves_through_worker_until_it_leaves() {
    let port = free_port();
    let spec = BindSpec::tcp(Some("127.0.0.1"), port);

    let (ours, theirs) = UnixChannel::pair().unwrap();
    let mut primary = Primary::new();
    primary.add_worker(1, Thread, ours).unwrap();

    let config = WorkerConfig {
        max_connections: Some(1),
        ..WorkerConfig::new(1, spec)
    };
    let worker = thread::spawn(move || run_worker(theirs, config).map_err(|e| e.to_string()));

    let client = thread::spawn(move || {
        let mut stream = connect(port);
        stream
            .write_all(b"GET /through HTTP/1.1\r\nHost: t\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    });

    let config = ReactorConfig {
        reap_interval: Duration::from_millis(20),
        ..ReactorConfig::default()
    };
    // Returns once the worker has served its one connection, left, and hung up.
    run_primary(&mut primary, &config).unwrap();
    assert!(!primary.has_workers());
    assert!(primary.listeners().is_empty());

    worker.join().unwrap().unwrap();
    let response = client.join().unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("GET /through\n"), "{response}");
}
