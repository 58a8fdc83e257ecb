//! End-to-end tests: a full sentinel over a memory backend, observed through
//! a real loopback TCP client.

use drift_common::{Event, SentinelConfig, SettingRef, Value};
use driftd::{BroadcastServer, ClientSet, EventBus, MemoryBackend, Sentinel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Running {
    addr: SocketAddr,
    clients: ClientSet,
    publisher: EventBus,
    cancel: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn start(toml: &str, backend: Arc<MemoryBackend>) -> Self {
        let config = SentinelConfig::from_toml_str(toml).unwrap();
        config.validate().unwrap();

        let server = BroadcastServer::bind("127.0.0.1:0", config.server.write_timeout(), config.server.client_queue)
            .await
            .unwrap();
        let addr = server.local_addr();
        let clients = server.clients();

        let sentinel = Sentinel::new(config, backend);
        let publisher = sentinel.publisher();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sentinel.serve(server, cancel.clone()));

        Self {
            addr,
            clients,
            publisher,
            cancel,
            task,
        }
    }

    async fn connect(&self) -> Lines<BufReader<TcpStream>> {
        let expected = self.clients.len() + 1;
        let stream = TcpStream::connect(self.addr).await.unwrap();
        wait_until(|| self.clients.len() == expected).await;
        BufReader::new(stream).lines()
    }

    async fn stop(self) {
        self.cancel.cancel();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("sentinel did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn next_event(lines: &mut Lines<BufReader<TcpStream>>) -> Event {
    let line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("no event within 5s")
        .unwrap()
        .expect("stream closed");
    Event::from_json_line(&line).unwrap()
}

fn setting(raw: &str) -> SettingRef {
    raw.parse().unwrap()
}

#[tokio::test]
async fn test_lock_violation_is_streamed_and_restored() {
    let defer = setting("WindowsUpdate\\DeferDays");
    let backend = Arc::new(MemoryBackend::with_values([(defer.clone(), Value::from("72h"))]));
    let running = Running::start(
        r#"
[enforcer]
poll_interval_secs = 1

[[lock]]
setting = "WindowsUpdate\\DeferDays"
expected = "72h"
restore = true
"#,
        backend.clone(),
    )
    .await;

    let mut lines = running.connect().await;
    backend.set(&defer, "24h");

    match next_event(&mut lines).await {
        Event::LockViolation {
            setting,
            expected,
            actual,
            restored,
            ..
        } => {
            assert_eq!(setting, defer);
            assert_eq!(expected, Value::from("72h"));
            assert_eq!(actual, Value::from("24h"));
            assert!(restored);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(backend.get(&defer), Some(Value::from("72h")));

    running.stop().await;
}

#[tokio::test]
async fn test_mutation_is_streamed_once() {
    let x = setting("ns\\X");
    let backend = Arc::new(MemoryBackend::with_values([(x.clone(), Value::from("1"))]));
    let running = Running::start(
        r#"
[snapshot]
poll_interval_secs = 1
settings = ["ns\\X"]
"#,
        backend.clone(),
    )
    .await;

    let mut lines = running.connect().await;
    backend.set(&x, "2");

    match next_event(&mut lines).await {
        Event::Mutation { setting, old, new, .. } => {
            assert_eq!(setting, x);
            assert_eq!(old, Value::Integer(1));
            assert_eq!(new, Value::Integer(2));
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Value is steady now; nothing else should arrive
    assert!(timeout(Duration::from_millis(1500), lines.next_line()).await.is_err());

    running.stop().await;
}

#[tokio::test]
async fn test_flip_flop_is_streamed() {
    let f = setting("ns\\F");
    let backend = Arc::new(MemoryBackend::with_values([(f.clone(), Value::from("A"))]));
    let running = Running::start(
        r#"
[drift]
poll_interval_ms = 50
window_secs = 10
settings = ["ns\\F"]
"#,
        backend.clone(),
    )
    .await;

    let mut lines = running.connect().await;
    let toggler = {
        let (backend, f) = (backend.clone(), f.clone());
        tokio::spawn(async move {
            for v in ["B", "A", "B", "A", "B"] {
                tokio::time::sleep(Duration::from_millis(120)).await;
                backend.set(&f, v);
            }
        })
    };

    match next_event(&mut lines).await {
        Event::FlipFlop { setting, flip_count, .. } => {
            assert_eq!(setting, f);
            assert!(flip_count >= 3);
        }
        other => panic!("unexpected event {:?}", other),
    }

    toggler.await.unwrap();
    running.stop().await;
}

#[tokio::test]
async fn test_late_client_gets_no_replay() {
    let running = Running::start("", Arc::new(MemoryBackend::new())).await;
    let mut early = running.connect().await;

    assert!(running.publisher.publish(Event::connection("curl", 100, "10.0.0.1:443")));
    match next_event(&mut early).await {
        Event::ConnectionObserved { pid, .. } => assert_eq!(pid, 100),
        other => panic!("unexpected event {:?}", other),
    }

    let mut late = running.connect().await;
    assert!(running.publisher.publish(Event::connection("curl", 200, "10.0.0.1:443")));

    match next_event(&mut late).await {
        Event::ConnectionObserved { pid, .. } => assert_eq!(pid, 200),
        other => panic!("unexpected event {:?}", other),
    }
    match next_event(&mut early).await {
        Event::ConnectionObserved { pid, .. } => assert_eq!(pid, 200),
        other => panic!("unexpected event {:?}", other),
    }

    running.stop().await;
}

#[tokio::test]
async fn test_disconnected_client_does_not_affect_others() {
    let running = Running::start("", Arc::new(MemoryBackend::new())).await;
    let gone = running.connect().await;
    let mut kept = running.connect().await;

    drop(gone);
    wait_until(|| running.clients.len() == 1).await;

    running.publisher.publish(Event::connection("sshd", 7, "192.168.1.2:22"));
    assert_eq!(next_event(&mut kept).await.kind(), "connection");

    running.stop().await;
}

#[tokio::test]
async fn test_cancel_closes_client_streams() {
    let running = Running::start("", Arc::new(MemoryBackend::new())).await;
    let stream = TcpStream::connect(running.addr).await.unwrap();
    wait_until(|| running.clients.len() == 1).await;

    let clients = running.clients.clone();
    running.stop().await;

    let mut stream = stream;
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(clients.is_empty());
}
