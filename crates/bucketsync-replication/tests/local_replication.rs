//! End-to-end runs over `file://` endpoints: configuration resolution,
//! client factory and engine together.

use bucketsync_core::{ConfigSources, ReplicationConfig};
use bucketsync_replication::{RecordingObserver, ReplicationEngine, ReplicationEvent, TransferStrategy};
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

fn sources(source_root: &Path, destination_root: &Path, access_key: &str) -> ConfigSources {
    ConfigSources::new()
        .without_process_env()
        .with_override("SOURCE_AWS_ACCESS_KEY_ID", "local")
        .with_override("SOURCE_AWS_SECRET_ACCESS_KEY", "local-secret")
        .with_override("SOURCE_AWS_REGION", "local")
        .with_override("SOURCE_BUCKET", "photos")
        .with_override(
            "SOURCE_ENDPOINT_URL",
            format!("file://{}", source_root.display()),
        )
        .with_override("DESTINATION_AWS_ACCESS_KEY_ID", access_key)
        .with_override("DESTINATION_AWS_SECRET_ACCESS_KEY", "local-secret")
        .with_override("DESTINATION_AWS_REGION", "local")
        .with_override("DESTINATION_BUCKET", "backup")
        .with_override(
            "DESTINATION_ENDPOINT_URL",
            format!("file://{}", destination_root.display()),
        )
        .with_override("DESTINATION_PREFIX", "2024/")
}

fn seed(root: &Path) {
    let bucket = root.join("photos");
    std::fs::create_dir_all(bucket.join("cats")).unwrap();
    std::fs::write(bucket.join("cats/tom.jpg"), b"tom").unwrap();
    std::fs::write(bucket.join("readme.txt"), b"hello world").unwrap();
}

fn strategies(recorder: &RecordingObserver) -> Vec<TransferStrategy> {
    recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ReplicationEvent::ObjectStarted { plan } => Some(plan.strategy),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_streams_between_separate_roots() {
    let source_root = tempfile::tempdir().unwrap();
    let destination_root = tempfile::tempdir().unwrap();
    seed(source_root.path());

    let config =
        ReplicationConfig::resolve(&sources(source_root.path(), destination_root.path(), "other"))
            .unwrap();
    let recorder = Arc::new(RecordingObserver::new());
    let engine = ReplicationEngine::connect(&config, recorder.clone())
        .await
        .unwrap();

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.bytes_transferred, 14);
    assert!(strategies(&recorder)
        .iter()
        .all(|s| *s == TransferStrategy::Streamed));

    let backup = destination_root.path().join("backup");
    assert_eq!(std::fs::read(backup.join("2024/cats/tom.jpg")).unwrap(), b"tom");
    assert_eq!(std::fs::read(backup.join("2024/readme.txt")).unwrap(), b"hello world");
}

#[tokio::test]
async fn test_same_root_uses_server_side_copy() {
    let root = tempfile::tempdir().unwrap();
    seed(root.path());

    let config = ReplicationConfig::resolve(&sources(root.path(), root.path(), "local")).unwrap();
    let recorder = Arc::new(RecordingObserver::new());
    let engine = ReplicationEngine::connect(&config, recorder.clone())
        .await
        .unwrap();

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert!(strategies(&recorder)
        .iter()
        .all(|s| *s == TransferStrategy::ServerSideCopy));
    assert_eq!(
        std::fs::read(root.path().join("backup/2024/cats/tom.jpg")).unwrap(),
        b"tom"
    );
}

#[tokio::test]
async fn test_missing_local_bucket_is_fatal() {
    let source_root = tempfile::tempdir().unwrap();
    let destination_root = tempfile::tempdir().unwrap();

    let config =
        ReplicationConfig::resolve(&sources(source_root.path(), destination_root.path(), "other"))
            .unwrap();
    let engine = ReplicationEngine::connect(&config, Arc::new(RecordingObserver::new()))
        .await
        .unwrap();

    let err = engine.run().await.unwrap_err();
    assert_eq!(err.partial_summary().map(|s| s.total), Some(0));
    assert!(std::fs::read_dir(destination_root.path()).unwrap().next().is_none());
}

/// Log sink for asserting on emitted lines.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn test_insecure_endpoint_warns_once() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let root = tempfile::tempdir().unwrap();
    let sources = sources(root.path(), root.path(), "other")
        .with_override("SOURCE_ENDPOINT_URL", "https://minio.local:9000")
        .with_override("SOURCE_VERIFY_TLS", "false");
    let config = ReplicationConfig::resolve(&sources).unwrap();
    assert!(!config.source.verify_tls);

    ReplicationEngine::connect(&config, Arc::new(RecordingObserver::new()))
        .await
        .unwrap();

    assert_eq!(
        logs.contents()
            .matches("TLS certificate verification disabled")
            .count(),
        1
    );
}
