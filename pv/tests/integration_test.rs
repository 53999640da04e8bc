//! Integration tests for pipevisor
//!
//! These tests drive the real components over real FIFOs, TCP sockets, and
//! shared-memory segments, with one side of each pair played in-process.

use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::LocalSet;

use pipevisor::channel::{ChannelReader, ChannelWriter, conduit_paths, create_conduits};
use pipevisor::config::Config;
use pipevisor::dispatcher::Dispatcher;
use pipevisor::probe::{LivenessOutcome, LivenessStrategy, SocketProbe};
use pipevisor::process::{PidFile, ProcessRecord, Role};
use pipevisor::segment::SharedSegment;
use pipevisor::worker::Worker;

const OPEN: Duration = Duration::from_secs(5);

static NEXT_PORT: AtomicU16 = AtomicU16::new(21300);
static SEGMENT_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Config pointing every path and port at test-local resources
fn test_config(dir: &Path) -> Config {
    let base_port = NEXT_PORT.fetch_add(10, Ordering::SeqCst);
    let mut config = Config::default();
    config.channel.dir = Some(dir.to_path_buf());
    config.channel.reply_timeout_ms = 500;
    config.channel.poll_interval_ms = 200;
    config.listen.client_port = base_port;
    config.listen.worker_health_port = base_port + 1;
    config.listen.dispatcher_health_port = base_port + 2;
    config.segment.name = format!(
        "pv-itest-{}-{}",
        std::process::id(),
        SEGMENT_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    config
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn send_and_read(stream: &mut TcpStream, line: &str) -> String {
    stream.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    let (read_half, _) = stream.split();
    let mut lines = BufReader::new(read_half).lines();
    tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("no reply within 5s")
        .unwrap()
        .expect("connection closed without reply")
}

// =============================================================================
// Worker tests
// =============================================================================

/// Dispatcher-side fixture: conduits and segment created, endpoints open
async fn start_worker(
    config: &Config,
) -> (SharedSegment, ChannelWriter, ChannelReader, tokio::task::JoinHandle<eyre::Result<()>>) {
    let dir = config.runtime_dir();
    create_conduits(&dir).unwrap();
    let segment = SharedSegment::create(&config.segment.name, config.segment.size).unwrap();

    let worker = Worker::new(config.clone());
    let handle = tokio::task::spawn_local(worker.run());

    let paths = conduit_paths(&dir);
    let (writer, reader) = tokio::join!(
        ChannelWriter::open(&paths.task_in, OPEN),
        ChannelReader::open(&paths.task_out, OPEN)
    );
    (segment, writer.unwrap(), reader.unwrap(), handle)
}

#[tokio::test]
async fn test_worker_replies_pong_in_order() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = test_config(temp_dir.path());

    LocalSet::new()
        .run_until(async {
            let (mut segment, mut writer, mut reader, handle) = start_worker(&config).await;

            for _ in 0..5 {
                writer.send("ping").await.unwrap();
                assert_eq!(reader.recv(Duration::from_secs(2)).await.unwrap(), "pong");
            }

            writer.send("STOP").await.unwrap();
            let result = tokio::time::timeout(Duration::from_secs(3), handle).await;
            result.expect("worker did not stop within bound").unwrap().unwrap();

            segment.destroy().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_worker_stop_removes_pid_record() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let dir = config.runtime_dir();

    LocalSet::new()
        .run_until(async {
            let (mut segment, mut writer, _reader, handle) = start_worker(&config).await;

            let pid_file = PidFile::for_role(&dir, Role::Worker);
            assert_eq!(pid_file.read(), Some(std::process::id()));

            writer.send("STOP").await.unwrap();
            tokio::time::timeout(Duration::from_secs(3), handle)
                .await
                .expect("worker did not stop within bound")
                .unwrap()
                .unwrap();

            assert_eq!(pid_file.read(), None, "pid record must be removed on stop");
            segment.destroy().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_worker_ignores_unknown_lines() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = test_config(temp_dir.path());

    LocalSet::new()
        .run_until(async {
            let (mut segment, mut writer, mut reader, handle) = start_worker(&config).await;

            // No reply for the unknown line; the next ping gets the next pong
            writer.send("hello").await.unwrap();
            writer.send("ping").await.unwrap();
            assert_eq!(reader.recv(Duration::from_secs(2)).await.unwrap(), "pong");
            assert!(reader.recv(Duration::from_millis(300)).await.is_err());

            writer.send("STOP").await.unwrap();
            tokio::time::timeout(Duration::from_secs(3), handle)
                .await
                .expect("worker did not stop within bound")
                .unwrap()
                .unwrap();
            segment.destroy().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_worker_health_probe_while_serving_then_refused() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = test_config(temp_dir.path());

    LocalSet::new()
        .run_until(async {
            let (mut segment, mut writer, _reader, handle) = start_worker(&config).await;

            let mut probe = SocketProbe::new(config.listen.clone(), Duration::from_secs(2));
            let record = ProcessRecord::new(Role::Worker, std::process::id());
            assert_eq!(probe.probe(&record).await.outcome, LivenessOutcome::Alive);

            writer.send("STOP").await.unwrap();
            tokio::time::timeout(Duration::from_secs(3), handle)
                .await
                .expect("worker did not stop within bound")
                .unwrap()
                .unwrap();

            // After termination the health port refuses connections
            assert_eq!(probe.probe(&record).await.outcome, LivenessOutcome::Unreachable);
            segment.destroy().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_worker_without_segment_fails_and_unregisters() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let dir = config.runtime_dir();

    LocalSet::new()
        .run_until(async {
            // No segment created: startup must fail
            let worker = Worker::new(config.clone());
            let result = worker.run().await;
            assert!(result.is_err());
            assert_eq!(PidFile::for_role(&dir, Role::Worker).read(), None);
        })
        .await;
}

// =============================================================================
// Dispatcher tests
// =============================================================================

/// Worker-side fixture answering ping until the channel goes away
async fn simulate_worker(dir: &Path) -> tokio::task::JoinHandle<()> {
    let paths = conduit_paths(dir);
    let (reader, writer) = tokio::join!(
        ChannelReader::open(&paths.task_in, OPEN),
        ChannelWriter::open(&paths.task_out, OPEN)
    );
    let (mut reader, mut writer) = (reader.unwrap(), writer.unwrap());

    tokio::task::spawn_local(async move {
        loop {
            match reader.recv(Duration::from_secs(10)).await {
                Ok(line) => match line.as_str() {
                    "ping" => {
                        let _ = writer.send("pong").await;
                    }
                    "STOP" => break,
                    _ => {}
                },
                Err(_) => break,
            }
        }
    })
}

#[tokio::test]
async fn test_dispatcher_end_to_end_session() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let dir = config.runtime_dir();
    let addr = config.listen.client_addr();
    let segment_name = config.segment.name.clone();

    LocalSet::new()
        .run_until(async {
            let dispatcher = Dispatcher::new(config.clone(), None);
            let handle = tokio::task::spawn_local(dispatcher.run());

            let paths = conduit_paths(&dir);
            wait_until("conduits", || paths.task_in.exists() && paths.task_out.exists()).await;
            let sim = simulate_worker(&dir).await;

            let mut client = TcpStream::connect(&addr).await.unwrap();

            // Served request
            assert_eq!(send_and_read(&mut client, "ping").await, "pong");

            // Unrecognized command: the worker stays silent, the dispatcher
            // answers with an error line instead of leaving us hanging
            let reply = send_and_read(&mut client, "hello").await;
            assert!(reply.starts_with("ERROR:"), "got: {}", reply);

            // Still relaying after the failed exchange
            assert_eq!(send_and_read(&mut client, "ping").await, "pong");

            // Quit: farewell, then the whole pipeline drains
            assert_eq!(send_and_read(&mut client, "QUIT").await, "BYE");

            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("dispatcher did not drain within bound")
                .unwrap()
                .unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(3), sim).await;

            // Every resource the dispatcher created is gone
            assert!(!paths.task_in.exists());
            assert!(!paths.task_out.exists());
            assert!(SharedSegment::attach(&segment_name).is_err());
            assert_eq!(PidFile::for_role(&dir, Role::Dispatcher).read(), None);
            assert!(TcpStream::connect(&addr).await.is_err());
        })
        .await;
}

#[tokio::test]
async fn test_dispatcher_accepts_clients_sequentially() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let dir = config.runtime_dir();
    let addr = config.listen.client_addr();

    LocalSet::new()
        .run_until(async {
            let dispatcher = Dispatcher::new(config.clone(), None);
            let handle = tokio::task::spawn_local(dispatcher.run());

            let paths = conduit_paths(&dir);
            wait_until("conduits", || paths.task_in.exists() && paths.task_out.exists()).await;
            let sim = simulate_worker(&dir).await;

            // First client disconnects without QUIT
            let mut first = TcpStream::connect(&addr).await.unwrap();
            assert_eq!(send_and_read(&mut first, "ping").await, "pong");
            drop(first);

            // Second client is served after the first goes away
            let mut second = TcpStream::connect(&addr).await.unwrap();
            assert_eq!(send_and_read(&mut second, "ping").await, "pong");
            assert_eq!(send_and_read(&mut second, "QUIT").await, "BYE");

            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("dispatcher did not drain within bound")
                .unwrap()
                .unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(3), sim).await;
        })
        .await;
}

// =============================================================================
// End-to-end pipeline (real worker + real dispatcher in one process)
// =============================================================================

#[tokio::test]
async fn test_full_pipeline_ping_then_quit() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let addr = config.listen.client_addr();
    let segment_name = config.segment.name.clone();

    LocalSet::new()
        .run_until(async {
            let dispatcher = Dispatcher::new(config.clone(), None);
            let dispatcher_handle = tokio::task::spawn_local(dispatcher.run());

            // The dispatcher publishes the segment before the task channel
            // opens; start the real worker once it is attachable
            wait_until("segment", || {
                SharedSegment::attach(&segment_name).map(|mut s| s.detach().unwrap()).is_ok()
            })
            .await;
            let worker = Worker::new(config.clone());
            let worker_handle = tokio::task::spawn_local(worker.run());

            let mut client = TcpStream::connect(&addr).await.unwrap();
            assert_eq!(send_and_read(&mut client, "ping").await, "pong");
            assert_eq!(send_and_read(&mut client, "ping").await, "pong");
            assert_eq!(send_and_read(&mut client, "QUIT").await, "BYE");

            tokio::time::timeout(Duration::from_secs(10), dispatcher_handle)
                .await
                .expect("dispatcher did not drain within bound")
                .unwrap()
                .unwrap();
            tokio::time::timeout(Duration::from_secs(10), worker_handle)
                .await
                .expect("worker did not stop within bound")
                .unwrap()
                .unwrap();

            assert!(SharedSegment::attach(&segment_name).is_err());
        })
        .await;
}
