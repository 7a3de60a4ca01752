//! Full stack over TCP: server, protocol, pipeline, tools and cache.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use hostgate::config::Settings;
use hostgate::error::ToolError;
use hostgate::middleware::BoxFuture;
use hostgate::protocol::Response;
use hostgate::server::Server;
use hostgate::tools::ToolService;
use hostgate::upstream::{Method, Upstream, UpstreamRequest};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("hostgate=debug"))
        .with_test_writer()
        .try_init();
}

/// Serves reservations from memory; the first read of each path fails with 503.
#[derive(Default)]
struct FlakyBookingApi {
    calls: AtomicU32,
}

impl Upstream for FlakyBookingApi {
    fn send(&self, request: UpstreamRequest) -> BoxFuture<Result<Value, ToolError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if call == 0 {
                return Err(ToolError::upstream(503, "warming up"));
            }
            match request.method {
                Method::Get => Ok(json!({ "path": request.path, "status": "pending" })),
                _ => Ok(json!({ "path": request.path, "patched": request.body })),
            }
        })
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn call(&mut self, frame: Value) -> Response {
        let mut line = serde_json::to_vec(&frame).unwrap();
        line.push(b'\n');
        self.write.write_all(&line).await.unwrap();
        let reply = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }
}

async fn start(settings: &str, api: Arc<FlakyBookingApi>) -> (SocketAddr, Arc<ToolService>) {
    let settings = Settings::from_toml_str(settings).unwrap();
    let service = Arc::new(ToolService::from_settings(&settings, api, || async {
        Ok(true)
    }));
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.serve(Arc::clone(&service)));
    (addr, service)
}

#[tokio::test]
async fn reads_retry_cache_and_invalidate_over_the_wire() {
    init_tracing();
    let api = Arc::new(FlakyBookingApi::default());
    let (addr, service) = start("[retry]\nbase_delay_ms = 5\n", Arc::clone(&api)).await;
    let mut client = Client::connect(addr).await;

    let first = client
        .call(json!({ "id": 1, "method": "get_reservation", "params": { "id": "12" } }))
        .await;
    assert_eq!(first.id, json!(1));
    assert_eq!(first.result.unwrap()["path"], "/reservations/12");
    assert_eq!(api.calls.load(Ordering::SeqCst), 2);

    let cached = client
        .call(json!({ "id": 2, "method": "get_reservation", "params": { "id": 12 } }))
        .await;
    assert!(cached.is_success());
    assert_eq!(api.calls.load(Ordering::SeqCst), 2);

    let updated = client
        .call(json!({
            "id": 3,
            "method": "update_reservation",
            "params": { "id": 12, "status": "confirmed" }
        }))
        .await;
    assert_eq!(updated.result.unwrap()["patched"], json!({ "status": "confirmed" }));

    client
        .call(json!({ "id": 4, "method": "get_reservation", "params": { "id": 12 } }))
        .await;
    assert_eq!(api.calls.load(Ordering::SeqCst), 4);

    let snap = service.metrics().snapshot();
    assert_eq!(snap.counter_total("retry_success_total"), 3);
    assert_eq!(
        snap.counter("cache_hits_total", &[("cache", "responses")]),
        Some(1)
    );
}

#[tokio::test]
async fn rate_limited_clients_get_retry_after_on_the_wire() {
    init_tracing();
    let api = Arc::new(FlakyBookingApi::default());
    let (addr, _) = start("[rate_limit]\nrequests_per_window = 2\n", api).await;
    let mut client = Client::connect(addr).await;

    for id in 0..2 {
        let resp = client
            .call(json!({ "id": id, "method": "ping", "client_id": "X" }))
            .await;
        assert!(resp.is_success());
    }

    let limited = client
        .call(json!({ "id": 9, "method": "ping", "client_id": "X" }))
        .await;
    let error = limited.error.unwrap();
    assert_eq!(error.kind, "RateLimitExceeded");
    let retry_after = error.retry_after_ms.unwrap();
    assert!(retry_after > 0 && retry_after <= 60_000);

    let other = client
        .call(json!({ "id": 10, "method": "ping", "client_id": "Y" }))
        .await;
    assert!(other.is_success());
}

#[tokio::test]
async fn clients_without_an_id_are_limited_by_peer_address() {
    init_tracing();
    let api = Arc::new(FlakyBookingApi::default());
    let (addr, _) = start("[rate_limit]\nrequests_per_window = 1\n", api).await;

    let mut first = Client::connect(addr).await;
    assert!(first.call(json!({ "id": 1, "method": "ping" })).await.is_success());

    let mut second = Client::connect(addr).await;
    let resp = second.call(json!({ "id": 2, "method": "ping" })).await;
    assert_eq!(resp.error.unwrap().kind, "RateLimitExceeded");
}
