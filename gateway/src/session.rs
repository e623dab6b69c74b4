//! Stream sessions – one per `/mjpeg` request.
//!
//! A session resolves the payload type (cache, else detector), builds the
//! pipeline, spawns it and relays its stdout into the response body. All of
//! that up to the spawn happens before the handler returns, so any failure
//! there still becomes a proper HTTP error. Once the body is handed to the
//! client, teardown runs from a single task that owns the process.

use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::process::ChildStdout;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use mcast_mjpeg_common::cache::PayloadCache;
use mcast_mjpeg_common::config::Config;
use mcast_mjpeg_common::detector::{DetectError, PayloadDetector};
use mcast_mjpeg_common::endpoint::{StreamEndpoint, StreamRequest};
use mcast_mjpeg_common::pipeline::{
    Boundary, PipelineBuilder, PipelineError, PipelineSpec, PipelineTable,
};

use crate::process::{self, PipelineOutput, PipelineProcess};

/// Bytes read from the pipeline per relay iteration.
const RELAY_CHUNK: usize = 4096;

/// In-memory pipe between the relay task and the response body.
const CLIENT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("payload type detection failed for {endpoint}: {source}")]
    Detection {
        endpoint: StreamEndpoint,
        #[source]
        source: DetectError,
    },
    #[error("unsupported payload type {payload_type} for {endpoint} after re-detection")]
    Unsupported {
        endpoint: StreamEndpoint,
        payload_type: u8,
    },
    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("detection task failed: {0}")]
    DetectorTask(#[from] tokio::task::JoinError),
}

/// Why the relay loop stopped.
#[derive(Debug)]
pub enum RelayOutcome {
    /// The pipeline closed its stdout.
    EndOfStream,
    /// The HTTP client went away.
    ClientDisconnected,
    /// The server is shutting down.
    Cancelled,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

/// Summary of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub endpoint: StreamEndpoint,
    pub outcome: RelayOutcome,
    pub bytes_relayed: u64,
    pub exit: Option<ExitStatus>,
}

impl SessionReport {
    fn log(&self) {
        let ep = &self.endpoint;
        let bytes = self.bytes_relayed;
        match &self.outcome {
            RelayOutcome::EndOfStream => {
                info!("Session {ep} ended: pipeline finished ({bytes} bytes, exit={:?})", self.exit)
            }
            RelayOutcome::ClientDisconnected => {
                info!("Session {ep} ended: client disconnected ({bytes} bytes)")
            }
            RelayOutcome::Cancelled => info!("Session {ep} cancelled ({bytes} bytes)"),
            RelayOutcome::ReadFailed(e) => error!("Session {ep}: pipeline read failed: {e}"),
            RelayOutcome::WriteFailed(e) => error!("Session {ep}: client write failed: {e}"),
        }
    }
}

/// A spawned session: the response body plus the task that owns the process.
pub struct StartedSession {
    pub body: Body,
    pub task: JoinHandle<SessionReport>,
}

/// Shared state behind every session: cache, detector, pipeline builder.
pub struct Gateway {
    cache: Arc<PayloadCache>,
    detector: Arc<dyn PayloadDetector>,
    builder: PipelineBuilder,
    detect_timeout: Duration,
    terminate_grace: Duration,
    child_env: Vec<(String, String)>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
}

impl Gateway {
    pub fn new(
        config: &Config,
        detector: Arc<dyn PayloadDetector>,
        table: PipelineTable,
        boundary: Boundary,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache: Arc::new(PayloadCache::new(&config.cache_file)),
            detector,
            builder: PipelineBuilder::new(config, table, boundary),
            detect_timeout: config.socket_timeout,
            terminate_grace: config.terminate_grace,
            child_env: process::diagnostic_env(config),
            shutdown,
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn boundary(&self) -> &Boundary {
        self.builder.boundary()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn cache(&self) -> &PayloadCache {
        &self.cache
    }

    /// Wait for every session task to finish its cleanup.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Resolve, build and spawn; the returned body streams the pipeline.
    pub async fn open(&self, request: &StreamRequest) -> Result<StartedSession, SessionError> {
        let spec = self.prepare(request).await?;
        self.launch(request.endpoint, &spec)
    }

    /// Payload type → pipeline, re-detecting once if the type is unsupported.
    pub async fn prepare(&self, request: &StreamRequest) -> Result<PipelineSpec, SessionError> {
        let endpoint = request.endpoint;
        let pt = self.resolve_payload_type(endpoint, request.force_detect).await?;
        info!("Building pipeline for payload type {pt} ({endpoint})");

        match self.builder.build(pt, &endpoint) {
            Ok(spec) => Ok(spec),
            Err(PipelineError::UnsupportedPayloadType(stale)) => {
                warn!("Payload type {stale} not supported for {endpoint}; invalidating cache and re-detecting");
                let cache = Arc::clone(&self.cache);
                tokio::task::spawn_blocking(move || cache.invalidate(&endpoint)).await?;
                let pt = self.resolve_payload_type(endpoint, true).await?;
                info!("Re-detected payload type {pt} for {endpoint}");
                self.builder
                    .build(pt, &endpoint)
                    .map_err(|PipelineError::UnsupportedPayloadType(payload_type)| {
                        SessionError::Unsupported {
                            endpoint,
                            payload_type,
                        }
                    })
            }
        }
    }

    /// Cache lookup, detection and cache write all block, so the whole
    /// step runs on the blocking pool.
    async fn resolve_payload_type(
        &self,
        endpoint: StreamEndpoint,
        force_detect: bool,
    ) -> Result<u8, SessionError> {
        let cache = Arc::clone(&self.cache);
        let detector = Arc::clone(&self.detector);
        let timeout = self.detect_timeout;

        tokio::task::spawn_blocking(move || -> Result<u8, DetectError> {
            if let Some(pt) = cache.lookup(&endpoint, force_detect) {
                return Ok(pt);
            }
            info!("Detecting payload type for {endpoint}...");
            let pt = detector.detect(&endpoint, timeout)?;
            cache.store(&endpoint, pt);
            Ok(pt)
        })
        .await?
        .map_err(|source| SessionError::Detection { endpoint, source })
    }

    /// Spawn `spec` and start relaying its stdout.
    pub fn launch(
        &self,
        endpoint: StreamEndpoint,
        spec: &PipelineSpec,
    ) -> Result<StartedSession, SessionError> {
        info!("Executing pipeline for {endpoint}: {}", spec.command_line());
        let (process, PipelineOutput { stdout, stderr }) =
            PipelineProcess::spawn(spec, &self.child_env).map_err(|source| SessionError::Spawn {
                program: spec.program().to_string(),
                source,
            })?;

        let cancel = self.shutdown.child_token();
        let client_gone = CancellationToken::new();
        let (writer, reader) = tokio::io::duplex(CLIENT_PIPE_CAPACITY);
        let reader = ClientReader {
            inner: reader,
            _gone: client_gone.clone().drop_guard(),
        };

        let diagnostics = self
            .tracker
            .spawn(process::watch_diagnostics(stderr, cancel.clone()));

        let active = ActiveSession::enter(&self.active);
        let grace = self.terminate_grace;
        let task = self.tracker.spawn(async move {
            let _active = active;
            let (outcome, bytes_relayed) =
                relay(stdout, writer, &cancel, &client_gone).await;

            // Single teardown path for every way the relay can stop.
            cancel.cancel();
            let exit = process.shutdown(grace).await;
            if let Err(e) = diagnostics.await {
                debug!("Diagnostics task for {endpoint} ended abnormally: {e}");
            }

            let report = SessionReport {
                endpoint,
                outcome,
                bytes_relayed,
                exit,
            };
            report.log();
            report
        });

        Ok(StartedSession {
            body: Body::from_stream(ReaderStream::new(reader)),
            task,
        })
    }
}

/// Copy pipeline output to the client pipe until EOF, disconnect or cancel.
async fn relay(
    mut stdout: ChildStdout,
    mut client: DuplexStream,
    cancel: &CancellationToken,
    client_gone: &CancellationToken,
) -> (RelayOutcome, u64) {
    let mut buf = vec![0u8; RELAY_CHUNK];
    let mut relayed = 0u64;

    let outcome = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break RelayOutcome::Cancelled,
            _ = client_gone.cancelled() => break RelayOutcome::ClientDisconnected,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break RelayOutcome::EndOfStream,
                Ok(n) => n,
                Err(e) => break RelayOutcome::ReadFailed(e),
            },
        };

        let write = async {
            client.write_all(&buf[..n]).await?;
            client.flush().await
        };
        tokio::select! {
            _ = cancel.cancelled() => break RelayOutcome::Cancelled,
            _ = client_gone.cancelled() => break RelayOutcome::ClientDisconnected,
            written = write => match written {
                Ok(()) => relayed += n as u64,
                Err(e) if is_disconnect(&e) => break RelayOutcome::ClientDisconnected,
                Err(e) => break RelayOutcome::WriteFailed(e),
            },
        }
    };

    let _ = client.shutdown().await;
    (outcome, relayed)
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Read half handed to the response body. Dropping it (hyper does so when
/// the client disconnects) fires the session's `client_gone` token.
struct ClientReader {
    inner: DuplexStream,
    _gone: DropGuard,
}

impl AsyncRead for ClientReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Counts a session as active until dropped.
struct ActiveSession(Arc<AtomicUsize>);

impl ActiveSession {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    /// Detector that replays scripted results and counts calls.
    pub(crate) struct ScriptedDetector {
        results: Mutex<VecDeque<Result<u8, DetectError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedDetector {
        pub(crate) fn new(results: Vec<Result<u8, DetectError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PayloadDetector for ScriptedDetector {
        fn detect(&self, _: &StreamEndpoint, _: Duration) -> Result<u8, DetectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(DetectError::MalformedPacket { len: 0 }))
        }
    }

    pub(crate) fn test_config(name: &str) -> Config {
        let dir = std::env::temp_dir().join("mcast_mjpeg_test");
        std::fs::create_dir_all(&dir).unwrap();
        let cache_file = dir.join(format!("session-{name}-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&cache_file);
        Config {
            cache_file,
            gst_log_file: dir.join("gst_debug.log"),
            terminate_grace: Duration::from_millis(500),
            socket_timeout: Duration::from_millis(100),
            ..Config::default()
        }
    }

    pub(crate) fn gateway(config: &Config, detector: Arc<ScriptedDetector>) -> Gateway {
        Gateway::new(
            config,
            detector,
            PipelineTable::default(),
            Boundary::from("spionisto"),
            CancellationToken::new(),
        )
    }

    fn request(force_detect: bool) -> StreamRequest {
        StreamRequest {
            endpoint: StreamEndpoint::new(Ipv4Addr::new(239, 1, 1, 1), 5000).unwrap(),
            force_detect,
        }
    }

    fn sh(script: &str) -> PipelineSpec {
        PipelineSpec::new(vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    fn caps_for(spec: &PipelineSpec) -> String {
        spec.args()
            .iter()
            .find(|a| a.starts_with("caps="))
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_cache_miss_detects_once_then_hits() {
        let config = test_config("miss_then_hit");
        let detector = ScriptedDetector::new(vec![Ok(96)]);
        let gw = gateway(&config, detector.clone());
        let req = request(false);

        let spec = gw.prepare(&req).await.unwrap();
        assert!(caps_for(&spec).contains("encoding-name=MP2P,payload=96"));
        assert_eq!(detector.calls(), 1);
        assert_eq!(gw.cache().entry(&req.endpoint).unwrap().payload_type, 96);

        let again = gw.prepare(&req).await.unwrap();
        assert_eq!(again, spec);
        assert_eq!(detector.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_detect_overwrites_entry() {
        let config = test_config("force");
        let detector = ScriptedDetector::new(vec![Ok(103)]);
        let gw = gateway(&config, detector.clone());
        let req = request(true);
        gw.cache().store(&req.endpoint, 96);

        let spec = gw.prepare(&req).await.unwrap();
        assert!(caps_for(&spec).contains("encoding-name=MP2T,payload=103"));
        assert_eq!(detector.calls(), 1);
        assert_eq!(gw.cache().entry(&req.endpoint).unwrap().payload_type, 103);
    }

    #[tokio::test]
    async fn test_stale_entry_is_redetected_once() {
        let config = test_config("stale_ok");
        let detector = ScriptedDetector::new(vec![Ok(33)]);
        let gw = gateway(&config, detector.clone());
        let req = request(false);
        gw.cache().store(&req.endpoint, 8);

        let spec = gw.prepare(&req).await.unwrap();
        assert!(caps_for(&spec).contains("payload=33"));
        assert_eq!(detector.calls(), 1);
        assert_eq!(gw.cache().entry(&req.endpoint).unwrap().payload_type, 33);
    }

    #[tokio::test]
    async fn test_stale_entry_retry_is_bounded() {
        let config = test_config("stale_fail");
        let detector = ScriptedDetector::new(vec![Ok(8), Ok(96)]);
        let gw = gateway(&config, detector.clone());
        let req = request(false);
        gw.cache().store(&req.endpoint, 8);

        let err = gw.prepare(&req).await.unwrap_err();
        assert!(matches!(err, SessionError::Unsupported { payload_type: 8, .. }));
        assert_eq!(detector.calls(), 1);
    }

    #[tokio::test]
    async fn test_detection_failure_is_not_cached() {
        let config = test_config("detect_fail");
        let endpoint = request(false).endpoint;
        let detector = ScriptedDetector::new(vec![Err(DetectError::Timeout {
            endpoint,
            timeout: Duration::ZERO,
        })]);
        let gw = gateway(&config, detector.clone());

        let err = gw.prepare(&request(false)).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Detection {
                source: DetectError::Timeout { .. },
                ..
            }
        ));
        assert_eq!(detector.calls(), 1);
        assert!(gw.cache().entry(&endpoint).is_none());
    }

    /// Remembers which thread ran the detection.
    struct ThreadRecordingDetector(Mutex<Option<std::thread::ThreadId>>);

    impl PayloadDetector for ThreadRecordingDetector {
        fn detect(&self, _: &StreamEndpoint, _: Duration) -> Result<u8, DetectError> {
            *self.0.lock().unwrap() = Some(std::thread::current().id());
            Ok(96)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_resolution_runs_on_blocking_pool() {
        let config = test_config("blocking_pool");
        let detector = Arc::new(ThreadRecordingDetector(Mutex::new(None)));
        let gw = Gateway::new(
            &config,
            detector.clone(),
            PipelineTable::default(),
            Boundary::from("spionisto"),
            CancellationToken::new(),
        );
        let req = request(false);

        gw.prepare(&req).await.unwrap();
        let detected_on = detector.0.lock().unwrap().unwrap();
        assert_ne!(detected_on, std::thread::current().id());
        assert_eq!(gw.cache().entry(&req.endpoint).unwrap().payload_type, 96);
    }

    #[tokio::test]
    async fn test_corrupt_cache_behaves_as_empty() {
        let config = test_config("corrupt");
        std::fs::write(&config.cache_file, "\u{0}\u{1}garbage").unwrap();
        let detector = ScriptedDetector::new(vec![Ok(96)]);
        let gw = gateway(&config, detector.clone());

        gw.prepare(&request(false)).await.unwrap();
        assert_eq!(detector.calls(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = test_config("spawn_fail");
        let gw = gateway(&config, ScriptedDetector::new(vec![]));
        let spec = PipelineSpec::new(vec!["/nonexistent/gst-launch-1.0".into()]);
        let err = gw.launch(request(false).endpoint, &spec).err().unwrap();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert_eq!(gw.active_sessions(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relay_until_end_of_stream() {
        let config = test_config("relay_eos");
        let gw = gateway(&config, ScriptedDetector::new(vec![]));
        let started = gw
            .launch(request(false).endpoint, &sh("printf '%s\\r\\n%s' --spionisto frame"))
            .unwrap();

        let body = axum::body::to_bytes(started.body, usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"--spionisto\r\nframe");

        let report = started.task.await.unwrap();
        assert!(matches!(report.outcome, RelayOutcome::EndOfStream));
        assert_eq!(report.bytes_relayed, body.len() as u64);
        assert!(report.exit.is_some_and(|s| s.success()));
        assert_eq!(gw.active_sessions(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_disconnect_terminates_pipeline() {
        let config = test_config("disconnect");
        let gw = gateway(&config, ScriptedDetector::new(vec![]));
        let started = gw
            .launch(
                request(false).endpoint,
                &sh("while true; do printf frame; sleep 0.05; done"),
            )
            .unwrap();
        assert_eq!(gw.active_sessions(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(started.body);

        let report = tokio::time::timeout(Duration::from_secs(5), started.task)
            .await
            .expect("session did not close")
            .unwrap();
        assert!(matches!(report.outcome, RelayOutcome::ClientDisconnected));
        assert!(report.exit.is_some());
        assert_eq!(gw.active_sessions(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_cancels_sessions() {
        let config = test_config("shutdown");
        let shutdown = CancellationToken::new();
        let gw = Gateway::new(
            &config,
            ScriptedDetector::new(vec![]),
            PipelineTable::default(),
            Boundary::from("spionisto"),
            shutdown.clone(),
        );
        let started = gw
            .launch(request(false).endpoint, &sh("exec sleep 30"))
            .unwrap();

        shutdown.cancel();
        gw.drain().await;

        let report = started.task.await.unwrap();
        assert!(matches!(report.outcome, RelayOutcome::Cancelled));
        assert!(report.exit.is_some_and(|s| !s.success()));
    }
}
