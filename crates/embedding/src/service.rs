//! Supervised embedding service client.
//!
//! Owns the out-of-process model server: spawns it, health-checks it,
//! restarts it with backoff when it crashes or leaks, and serialises every
//! request through a single dispatcher so the server never sees concurrent
//! batches. Callers only ever talk to the [`Embedder`] trait.
//!
//! State machine:
//!
//! ```text
//! Uninitialised → Spawning → Ready ↔ Embedding
//!                              │
//!                              ▼
//!                   (Error | Draining) → Exited
//! ```

use crate::http::HttpEmbedder;
use crate::lane::{self, LaneSender};
use crate::retry::{RetryConfig, is_retryable};
use crate::{EmbedKind, Embedder, EmbeddingError};
use async_trait::async_trait;
use semadex_core::{EmbeddingConfig, Pooling};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Embed-call failures tolerated before the health loop forces a restart.
const EMBED_ERROR_RESTART_THRESHOLD: u32 = 3;

/// Lifecycle state of one server instance. Transitions are monotonic within
/// a lifetime except for the Ready ↔ Embedding pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
  Uninitialised,
  Spawning,
  Ready,
  Embedding,
  Draining,
  Error,
  Exited,
}

/// Configuration for the supervised service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
  /// Loopback endpoint of the server
  pub endpoint: String,
  /// Command used to launch the server; empty means externally managed
  pub server_command: Vec<String>,
  pub dimensions: usize,
  pub normalize: bool,
  pub pooling: Pooling,
  /// Overall startup timeout (spawn + first healthy response)
  pub startup_timeout: Duration,
  /// Per-request timeout for document batches
  pub batch_timeout: Duration,
  /// Per-request timeout for query embeddings
  pub query_timeout: Duration,
  pub retry: RetryConfig,
  /// Idle health-check interval
  pub health_interval: Duration,
  /// Restart cap within the window before going to the error state
  pub max_restarts: u32,
  pub restart_window: Duration,
  /// RSS ceiling for the child in bytes; 0 disables the memory restart
  pub rss_ceiling_bytes: u64,
}

impl ServiceConfig {
  pub fn from_config(config: &EmbeddingConfig) -> Self {
    Self {
      endpoint: config.endpoint.clone(),
      server_command: config.server_command.clone(),
      dimensions: config.dimensions,
      normalize: config.normalize,
      pooling: config.pooling,
      startup_timeout: Duration::from_millis(config.startup_timeout_ms),
      batch_timeout: Duration::from_millis(config.batch_timeout_ms),
      query_timeout: Duration::from_millis(config.query_timeout_ms),
      retry: RetryConfig {
        max_retries: config.max_retries,
        base_delay: Duration::from_millis(config.retry_base_delay_ms),
        ..RetryConfig::default()
      },
      health_interval: Duration::from_millis(config.health_interval_ms),
      max_restarts: config.max_restarts,
      restart_window: Duration::from_millis(config.restart_window_ms),
      rss_ceiling_bytes: config.rss_ceiling_mb * 1024 * 1024,
    }
  }
}

/// Handle to the supervised embedding service.
pub struct EmbedService {
  inner: Arc<ServiceInner>,
  lane: LaneSender,
}

struct ServiceInner {
  config: ServiceConfig,
  http: HttpEmbedder,
  state_tx: watch::Sender<ServiceState>,
  child: Mutex<Option<Child>>,
  restarts: Mutex<VecDeque<Instant>>,
  consecutive_errors: AtomicU32,
  cancel: CancellationToken,
}

impl EmbedService {
  /// Launch the server (unless one already answers on the endpoint), wait
  /// for it to become healthy, and start the dispatcher and health loops.
  pub async fn start(config: ServiceConfig) -> Result<Self, EmbeddingError> {
    let http = HttpEmbedder::new(&config.endpoint, config.dimensions, config.normalize, config.pooling);
    let (state_tx, _) = watch::channel(ServiceState::Uninitialised);

    let inner = Arc::new(ServiceInner {
      config,
      http,
      state_tx,
      child: Mutex::new(None),
      restarts: Mutex::new(VecDeque::new()),
      consecutive_errors: AtomicU32::new(0),
      cancel: CancellationToken::new(),
    });

    inner.set_state(ServiceState::Spawning);
    if !inner.config.server_command.is_empty() {
      inner.spawn_child().await?;
    }
    inner.wait_ready(inner.config.startup_timeout).await?;
    inner.set_state(ServiceState::Ready);
    info!(endpoint = %inner.config.endpoint, dim = inner.config.dimensions, "Embedding service ready");

    let (lane_tx, lane_rx) = lane::lane(32);
    tokio::spawn(dispatch_loop(inner.clone(), lane_rx));
    tokio::spawn(health_loop(inner.clone()));

    Ok(Self { inner, lane: lane_tx })
  }

  pub fn state(&self) -> ServiceState {
    self.inner.state()
  }

  pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
    self.inner.state_tx.subscribe()
  }
}

#[async_trait]
impl Embedder for EmbedService {
  fn dimensions(&self) -> usize {
    self.inner.config.dimensions
  }

  async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    self.lane.submit(texts.to_vec(), EmbedKind::Document).await
  }

  async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let vectors = self.lane.submit(vec![text.to_string()], EmbedKind::Query).await?;
    vectors
      .into_iter()
      .next()
      .ok_or_else(|| EmbeddingError::Protocol("empty vector response".to_string()))
  }

  async fn health(&self) -> bool {
    matches!(self.inner.state(), ServiceState::Ready | ServiceState::Embedding)
  }

  async fn shutdown(&self) {
    self.inner.set_state(ServiceState::Draining);
    self.inner.cancel.cancel();
    self.inner.kill_child(Duration::from_secs(5)).await;
    self.inner.set_state(ServiceState::Exited);
    info!("Embedding service stopped");
  }
}

impl ServiceInner {
  fn state(&self) -> ServiceState {
    *self.state_tx.borrow()
  }

  fn set_state(&self, state: ServiceState) {
    let _ = self.state_tx.send_replace(state);
  }

  /// Spawn the configured server command. A server already answering on the
  /// endpoint is reused, which makes repeated starts idempotent.
  async fn spawn_child(&self) -> Result<(), EmbeddingError> {
    if self.http.health().await {
      info!("Embedding server already running on endpoint, reusing");
      return Ok(());
    }

    let argv = &self.config.server_command;
    let mut command = Command::new(&argv[0]);
    command
      .args(&argv[1..])
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(true);

    let child = command.spawn().map_err(EmbeddingError::Spawn)?;
    info!(pid = child.id().unwrap_or(0), "Spawned embedding server");
    *self.child.lock().await = Some(child);
    Ok(())
  }

  async fn wait_ready(&self, timeout: Duration) -> Result<(), EmbeddingError> {
    let deadline = Instant::now() + timeout;
    loop {
      if self.http.health().await {
        return Ok(());
      }
      if Instant::now() >= deadline {
        warn!(timeout_ms = timeout.as_millis() as u64, "Embedding server never became healthy");
        self.set_state(ServiceState::Error);
        return Err(EmbeddingError::ServiceUnavailable);
      }
      tokio::time::sleep(Duration::from_millis(500)).await;
    }
  }

  async fn child_exited(&self) -> bool {
    let mut guard = self.child.lock().await;
    match guard.as_mut() {
      Some(child) => matches!(child.try_wait(), Ok(Some(_))),
      None => false,
    }
  }

  async fn kill_child(&self, grace: Duration) {
    let mut guard = self.child.lock().await;
    if let Some(mut child) = guard.take() {
      #[cfg(unix)]
      if let Some(pid) = child.id() {
        unsafe {
          libc::kill(pid as i32, libc::SIGTERM);
        }
      }
      #[cfg(not(unix))]
      let _ = child.start_kill();

      match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("Embedding server exited"),
        Err(_) => {
          warn!("Embedding server did not exit in time, killing");
          let _ = child.kill().await;
        }
      }
    }
  }

  async fn child_rss(&self) -> Option<u64> {
    let guard = self.child.lock().await;
    let pid = guard.as_ref()?.id()?;
    read_rss_bytes(pid)
  }

  /// Restart the child with backoff, bounded by the restart window cap.
  async fn restart(&self) -> Result<(), EmbeddingError> {
    if self.config.server_command.is_empty() {
      // Externally managed server: nothing to spawn, but probe for recovery
      if self.http.health().await {
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.set_state(ServiceState::Ready);
        return Ok(());
      }
      self.set_state(ServiceState::Error);
      return Err(EmbeddingError::ServiceUnavailable);
    }

    let attempt = {
      let mut restarts = self.restarts.lock().await;
      let now = Instant::now();
      while restarts
        .front()
        .is_some_and(|t| now.duration_since(*t) > self.config.restart_window)
      {
        restarts.pop_front();
      }
      if restarts.len() >= self.config.max_restarts as usize {
        warn!(
          cap = self.config.max_restarts,
          "Restart cap reached within window, embedding service unavailable"
        );
        self.set_state(ServiceState::Error);
        return Err(EmbeddingError::ServiceUnavailable);
      }
      restarts.push_back(now);
      restarts.len() as u32
    };

    self.set_state(ServiceState::Spawning);
    self.kill_child(Duration::from_secs(5)).await;

    if attempt > 1 {
      let backoff = self.config.retry.delay_for(attempt - 2);
      debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Backing off before restart");
      tokio::time::sleep(backoff).await;
    }

    self.spawn_child().await?;
    self.wait_ready(self.config.startup_timeout).await?;
    self.consecutive_errors.store(0, Ordering::Relaxed);
    self.set_state(ServiceState::Ready);
    info!(attempt, "Embedding server restarted");
    Ok(())
  }

  /// Attempt recovery from the error state. Succeeds once enough cool-down
  /// has elapsed for the restart window to drain.
  async fn try_recover(&self) -> bool {
    self.restart().await.is_ok()
  }

  /// Run one embed request with timeout, split-on-rejection and retry.
  async fn execute(&self, texts: &[String], kind: EmbedKind) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let timeout = match kind {
      EmbedKind::Query => self.config.query_timeout,
      EmbedKind::Document => self.config.batch_timeout,
    };

    let mut attempt: u32 = 0;
    loop {
      let result = match tokio::time::timeout(timeout, self.http.embed(texts)).await {
        Ok(result) => result,
        Err(_) => Err(EmbeddingError::Timeout),
      };

      let err = match result {
        Ok(vectors) => {
          self.consecutive_errors.store(0, Ordering::Relaxed);
          return Ok(vectors);
        }
        Err(err) => err,
      };

      // Oversized or opaque server rejection on a multi-text batch: halve
      // once before anything else.
      let should_split = matches!(err, EmbeddingError::OversizedBatch)
        || matches!(err, EmbeddingError::Server { status, .. } if status >= 500);
      if should_split && texts.len() > 1 {
        match self.split_once(texts, timeout).await {
          Ok(vectors) => {
            self.consecutive_errors.store(0, Ordering::Relaxed);
            return Ok(vectors);
          }
          Err(split_err) => debug!(error = %split_err, "Batch split retry failed"),
        }
      }
      if matches!(err, EmbeddingError::OversizedBatch) {
        // Splitting was the only recourse
        return Err(err);
      }

      if !is_retryable(&err) {
        return Err(err);
      }

      self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
      if attempt >= self.config.retry.max_retries {
        return Err(err);
      }
      attempt += 1;

      if self.child_exited().await {
        // A retry after a process death only proceeds once restart succeeds
        warn!("Embedding server died mid-request, restarting before retry");
        self.restart().await?;
      } else {
        let backoff = self.config.retry.delay_for(attempt - 1);
        debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "Retrying embed request");
        tokio::time::sleep(backoff).await;
      }
    }
  }

  /// Split the batch in halves and embed each half once.
  async fn split_once(&self, texts: &[String], timeout: Duration) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mid = texts.len() / 2;
    debug!(total = texts.len(), "Splitting rejected batch in halves");

    let mut vectors = Vec::with_capacity(texts.len());
    for half in [&texts[..mid], &texts[mid..]] {
      let result = tokio::time::timeout(timeout, self.http.embed(half))
        .await
        .map_err(|_| EmbeddingError::Timeout)??;
      vectors.extend(result);
    }
    Ok(vectors)
  }
}

/// Single-consumer dispatcher: at most one request in flight per instance.
async fn dispatch_loop(inner: Arc<ServiceInner>, mut lane: lane::LaneReceiver) {
  loop {
    let request = tokio::select! {
      biased;

      _ = inner.cancel.cancelled() => break,
      req = lane.next() => match req {
        Some(req) => req,
        None => break,
      },
    };

    if inner.state() == ServiceState::Error && !inner.try_recover().await {
      let _ = request.respond.send(Err(EmbeddingError::ServiceUnavailable));
      continue;
    }

    inner.set_state(ServiceState::Embedding);
    let result = inner.execute(&request.texts, request.kind).await;
    if inner.state() == ServiceState::Embedding {
      inner.set_state(ServiceState::Ready);
    }
    let _ = request.respond.send(result);
  }
  debug!("Embed dispatcher stopped");
}

/// Background health loop: pings the server while idle, restarts it after
/// two consecutive failures or a run of embed errors, and recycles it over
/// the memory ceiling.
async fn health_loop(inner: Arc<ServiceInner>) {
  let mut failures = 0u32;
  let mut interval = tokio::time::interval(inner.config.health_interval);
  interval.tick().await;

  loop {
    tokio::select! {
      biased;

      _ = inner.cancel.cancelled() => break,
      _ = interval.tick() => {}
    }

    if inner.state() != ServiceState::Ready {
      continue;
    }

    if inner.http.health().await {
      failures = 0;
    } else {
      failures += 1;
      warn!(failures, "Embedding server health check failed");
    }

    let embed_errors = inner.consecutive_errors.load(Ordering::Relaxed);
    if failures >= 2 || embed_errors >= EMBED_ERROR_RESTART_THRESHOLD {
      info!(failures, embed_errors, "Restarting unhealthy embedding server");
      failures = 0;
      if inner.restart().await.is_err() {
        warn!("Embedding server restart failed");
      }
      continue;
    }

    if inner.config.rss_ceiling_bytes > 0
      && let Some(rss) = inner.child_rss().await
      && rss > inner.config.rss_ceiling_bytes
    {
      info!(
        rss,
        ceiling = inner.config.rss_ceiling_bytes,
        "Embedding server over memory ceiling, recycling"
      );
      let _ = inner.restart().await;
    }
  }
  debug!("Embed health loop stopped");
}

#[cfg(target_os = "linux")]
fn read_rss_bytes(pid: u32) -> Option<u64> {
  let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
  let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
  Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes(_pid: u32) -> Option<u64> {
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;
  use std::sync::Mutex as StdMutex;
  use std::sync::atomic::AtomicUsize;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};

  const DIM: usize = 4;

  /// Scripted embedding server on a loopback socket. `/health` always
  /// answers ok; each `/embed` request pops the next status from the
  /// script. A 200 returns one vector per input whose first component is
  /// the text's length, so tests can check per-text routing and order.
  struct StubServer {
    endpoint: String,
    embed_requests: Arc<AtomicUsize>,
  }

  impl StubServer {
    fn requests(&self) -> usize {
      self.embed_requests.load(Ordering::SeqCst)
    }
  }

  async fn spawn_stub(script: Vec<u16>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    let script = Arc::new(StdMutex::new(VecDeque::from(script)));
    let embed_requests = Arc::new(AtomicUsize::new(0));

    let counter = embed_requests.clone();
    tokio::spawn(async move {
      loop {
        let Ok((mut socket, _)) = listener.accept().await else {
          return;
        };
        let Some((head, body)) = read_request(&mut socket).await else {
          continue;
        };

        let response = if head.starts_with("GET /health") {
          http_response(200, r#"{"status":"ok"}"#)
        } else {
          counter.fetch_add(1, Ordering::SeqCst);
          let status = script.lock().unwrap().pop_front().unwrap_or(200);
          if status == 200 {
            let vectors: Vec<Vec<f32>> = parse_texts(&body)
              .iter()
              .map(|text| {
                let mut vector = vec![0.0f32; DIM];
                vector[0] = text.len() as f32;
                vector
              })
              .collect();
            http_response(200, &serde_json::json!({ "vectors": vectors }).to_string())
          } else {
            http_response(status, r#"{"error":"stub rejection"}"#)
          }
        };

        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
      }
    });

    StubServer {
      endpoint,
      embed_requests,
    }
  }

  async fn read_request(socket: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
      let n = socket.read(&mut chunk).await.ok()?;
      if n == 0 {
        return None;
      }
      buf.extend_from_slice(&chunk[..n]);
      if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        break pos + 4;
      }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
      .lines()
      .find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") {
          value.trim().parse::<usize>().ok()
        } else {
          None
        }
      })
      .unwrap_or(0);

    while buf.len() < header_end + content_length {
      let n = socket.read(&mut chunk).await.ok()?;
      if n == 0 {
        break;
      }
      buf.extend_from_slice(&chunk[..n]);
    }

    Some((head, buf[header_end..].to_vec()))
  }

  fn parse_texts(body: &[u8]) -> Vec<String> {
    serde_json::from_slice::<serde_json::Value>(body)
      .ok()
      .and_then(|v| v.get("texts").cloned())
      .and_then(|t| serde_json::from_value(t).ok())
      .unwrap_or_default()
  }

  fn http_response(status: u16, body: &str) -> String {
    let reason = match status {
      200 => "OK",
      413 => "Payload Too Large",
      500 => "Internal Server Error",
      503 => "Service Unavailable",
      _ => "Error",
    };
    format!(
      "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
      body.len()
    )
  }

  fn stub_config(endpoint: &str, max_retries: u32) -> ServiceConfig {
    ServiceConfig {
      endpoint: endpoint.to_string(),
      server_command: Vec::new(),
      dimensions: DIM,
      normalize: true,
      pooling: Pooling::Mean,
      startup_timeout: Duration::from_secs(5),
      batch_timeout: Duration::from_secs(2),
      query_timeout: Duration::from_secs(2),
      retry: RetryConfig {
        max_retries,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: false,
      },
      // Long enough to stay quiet while a scripted test runs
      health_interval: Duration::from_secs(60),
      max_restarts: 2,
      restart_window: Duration::from_secs(60),
      rss_ceiling_bytes: 0,
    }
  }

  async fn start_against(stub: &StubServer, max_retries: u32) -> EmbedService {
    EmbedService::start(stub_config(&stub.endpoint, max_retries)).await.unwrap()
  }

  fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn test_from_config_mapping() {
    let config = EmbeddingConfig::default();
    let service_config = ServiceConfig::from_config(&config);
    assert_eq!(service_config.batch_timeout, Duration::from_secs(30));
    assert_eq!(service_config.query_timeout, Duration::from_secs(10));
    assert_eq!(service_config.retry.max_retries, 2);
    assert_eq!(service_config.rss_ceiling_bytes, 0);
  }

  #[tokio::test]
  async fn test_start_fails_when_server_unreachable() {
    let mut config = stub_config("http://127.0.0.1:1", 2);
    config.startup_timeout = Duration::from_millis(200);
    let result = EmbedService::start(config).await;
    assert!(matches!(result, Err(EmbeddingError::ServiceUnavailable)));
  }

  #[tokio::test]
  async fn test_documents_embed_in_order() {
    let stub = spawn_stub(vec![200]).await;
    let service = start_against(&stub, 2).await;

    let vectors = service.embed_documents(&texts(&["aa", "bbbb"])).await.unwrap();

    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0][0], 2.0);
    assert_eq!(vectors[1][0], 4.0);
    assert_eq!(stub.requests(), 1);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn test_query_roundtrip() {
    let stub = spawn_stub(vec![200]).await;
    let service = start_against(&stub, 2).await;

    let vector = service.embed_query("abc").await.unwrap();
    assert_eq!(vector[0], 3.0);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn test_oversized_batch_embeds_in_halves() {
    // Full batch rejected as oversized, both halves accepted
    let stub = spawn_stub(vec![413, 200, 200]).await;
    let service = start_against(&stub, 2).await;

    let vectors = service.embed_documents(&texts(&["aa", "bbbb"])).await.unwrap();

    // One vector per input, original order preserved across the halves
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0][0], 2.0);
    assert_eq!(vectors[1][0], 4.0);
    assert_eq!(stub.requests(), 3);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn test_oversized_batch_surfaces_after_single_split() {
    // Halves get one try; the first half failing surfaces the error with
    // no second half and no generic retry (oversized cannot improve)
    let stub = spawn_stub(vec![413, 413, 200]).await;
    let service = start_against(&stub, 2).await;

    let err = service.embed_documents(&texts(&["aa", "bbbb"])).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::OversizedBatch));
    assert_eq!(stub.requests(), 2);

    // The service stays usable afterwards
    let vectors = service.embed_documents(&texts(&["zz"])).await.unwrap();
    assert_eq!(vectors[0][0], 2.0);
    assert_eq!(stub.requests(), 3);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn test_oversized_single_text_is_not_split() {
    let stub = spawn_stub(vec![413]).await;
    let service = start_against(&stub, 2).await;

    let err = service.embed_documents(&texts(&["aa"])).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::OversizedBatch));
    assert_eq!(stub.requests(), 1);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn test_server_error_survives_split_then_retries_whole_batch() {
    // A 5xx gets exactly one split attempt; when the split also fails the
    // full batch re-enters the retry loop and succeeds
    let stub = spawn_stub(vec![500, 500, 200]).await;
    let service = start_against(&stub, 2).await;

    let vectors = service.embed_documents(&texts(&["aa", "bbbb"])).await.unwrap();

    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0][0], 2.0);
    assert_eq!(vectors[1][0], 4.0);
    // full (500) + first half (500) + full again (200)
    assert_eq!(stub.requests(), 3);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn test_server_error_exhausts_retries() {
    let stub = spawn_stub(vec![503, 503, 503, 503]).await;
    let service = start_against(&stub, 1).await;

    let err = service.embed_documents(&texts(&["aa", "bbbb"])).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::Server { status: 503, .. }));
    // Two rounds of full batch + failed half split
    assert_eq!(stub.requests(), 4);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn test_single_text_server_error_retries_without_split() {
    let stub = spawn_stub(vec![500, 200]).await;
    let service = start_against(&stub, 2).await;

    let vector = service.embed_query("abc").await.unwrap();
    assert_eq!(vector[0], 3.0);
    assert_eq!(stub.requests(), 2);
    service.shutdown().await;
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn test_read_rss_for_current_process() {
    let rss = read_rss_bytes(std::process::id()).unwrap();
    assert!(rss > 0);
  }
}
