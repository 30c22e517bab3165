use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::committer::Committer;
use crate::model::{MediaKind, MediaReference};
use crate::retry::RetryPolicy;
use crate::transport::MediaSource;

/// Deterministic location of an attachment:
/// `<root>/<channel>/<message_id>_<sequence>.<ext>`.
pub fn media_path(
    root: &Path,
    channel_id: &str,
    message_id: i64,
    sequence: u32,
    kind: MediaKind,
) -> PathBuf {
    let channel_dir: String = channel_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    root.join(channel_dir)
        .join(format!("{}_{}.{}", message_id, sequence, kind.extension()))
}

/// Downloads attachment payloads to the media directory.
pub struct MediaFetcher {
    source: Arc<dyn MediaSource>,
    root: PathBuf,
    retry: RetryPolicy,
}

impl MediaFetcher {
    pub fn new(source: Arc<dyn MediaSource>, root: PathBuf, retry: RetryPolicy) -> Self {
        Self {
            source,
            root,
            retry,
        }
    }

    /// Download one attachment. Never fails: exhausted retries come back
    /// as a `failed` reference.
    pub async fn fetch(&self, media: MediaReference) -> MediaReference {
        let path = media_path(
            &self.root,
            &media.channel_id,
            media.message_id,
            media.sequence,
            media.kind,
        );
        let partial = path.with_extension(format!("{}.part", media.kind.extension()));

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(
                    channel_id = %media.channel_id,
                    message_id = media.message_id,
                    sequence = media.sequence,
                    error = %e,
                    "cannot create media directory {}",
                    parent.display()
                );
                return media.failed();
            }
        }

        let source = &self.source;
        let remote_id = media.remote_id.as_str();
        let (partial_ref, path_ref) = (&partial, &path);
        let result = self
            .retry
            .run("download", move || async move {
                let bytes = source.download(remote_id, partial_ref).await?;
                tokio::fs::rename(partial_ref, path_ref).await?;
                Ok(bytes)
            })
            .await;

        match result {
            Ok(bytes) => {
                info!(
                    channel_id = %media.channel_id,
                    message_id = media.message_id,
                    sequence = media.sequence,
                    kind = %media.kind,
                    bytes,
                    "media saved to {}",
                    path.display()
                );
                media.fetched(path)
            }
            Err(err) => {
                // Leftovers from an interrupted attempt
                let _ = tokio::fs::remove_file(&partial).await;
                warn!(
                    channel_id = %media.channel_id,
                    message_id = media.message_id,
                    sequence = media.sequence,
                    remote_id = %media.remote_id,
                    error = %err,
                    "media download failed, marking as failed"
                );
                media.failed()
            }
        }
    }
}

/// Producer side of the download queue. Enqueueing never blocks.
#[derive(Clone)]
pub struct MediaQueue {
    tx: mpsc::UnboundedSender<MediaReference>,
}

impl MediaQueue {
    pub fn enqueue(&self, media: MediaReference) {
        if let Err(mpsc::error::SendError(media)) = self.tx.send(media) {
            warn!(
                channel_id = %media.channel_id,
                message_id = media.message_id,
                sequence = media.sequence,
                "media queue closed, download left pending for next startup"
            );
        }
    }
}

/// Start the download pool. At most `workers` downloads run at once.
///
/// The pool ends when every [`MediaQueue`] is dropped (after in-flight
/// downloads finish) or when `cancel` fires (in-flight downloads are
/// abandoned and stay `pending` in storage).
pub fn spawn_media_pool(
    fetcher: Arc<MediaFetcher>,
    committer: Arc<Committer>,
    workers: usize,
    cancel: CancellationToken,
) -> (MediaQueue, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_pool(fetcher, committer, rx, workers.max(1), cancel));
    (MediaQueue { tx }, handle)
}

async fn run_pool(
    fetcher: Arc<MediaFetcher>,
    committer: Arc<Committer>,
    mut jobs: mpsc::UnboundedReceiver<MediaReference>,
    workers: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    info!(workers, "media pool started");

    loop {
        let media = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(media) => media,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        debug!(
            channel_id = %media.channel_id,
            message_id = media.message_id,
            sequence = media.sequence,
            "starting media download"
        );

        let fetcher = Arc::clone(&fetcher);
        let committer = Arc::clone(&committer);
        tasks.spawn(async move {
            let _permit = permit;
            let outcome = fetcher.fetch(media).await;
            // Failures are logged by the committer.
            let _ = committer.apply_media(&outcome).await;
        });

        while tasks.try_join_next().is_some() {}
    }

    if cancel.is_cancelled() {
        let abandoned = tasks.len();
        tasks.abort_all();
        info!(abandoned, "media pool stopped, unfinished downloads stay pending");
    } else {
        while tasks.join_next().await.is_some() {}
        info!("media pool drained");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::model::{MediaStatus, MessageRecord, PostDetails};
    use crate::store::MessageStore;
    use crate::transport::testing::FakeMediaSource;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn photo(message_id: i64, sequence: u32, remote: &str) -> MediaReference {
        MediaReference::pending("NewQuark", message_id, sequence, MediaKind::Photo, remote)
    }

    #[test]
    fn test_media_path_is_deterministic() {
        let root = Path::new("/data/media");
        assert_eq!(
            media_path(root, "NewQuark", 101, 0, MediaKind::Photo),
            PathBuf::from("/data/media/NewQuark/101_0.jpg")
        );
        assert_eq!(
            media_path(root, "-100123", 5, 2, MediaKind::Document),
            PathBuf::from("/data/media/-100123/5_2.bin")
        );
        assert_eq!(
            media_path(root, "../etc", 1, 0, MediaKind::Video),
            PathBuf::from("/data/media/___etc/1_0.mp4")
        );
    }

    #[tokio::test]
    async fn test_fetch_success_populates_path() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MediaFetcher::new(
            Arc::new(FakeMediaSource::default()),
            dir.path().to_path_buf(),
            policy(3),
        );

        let fetched = fetcher.fetch(photo(101, 0, "file-a")).await;
        assert_eq!(fetched.status, MediaStatus::Fetched);
        let path = fetched.local_path.unwrap();
        assert_eq!(path, dir.path().join("NewQuark").join("101_0.jpg"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "payload:file-a");
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeMediaSource::failing("file-b", 2));
        let fetcher = MediaFetcher::new(source.clone(), dir.path().to_path_buf(), policy(3));

        let fetched = fetcher.fetch(photo(102, 0, "file-b")).await;
        assert_eq!(fetched.status, MediaStatus::Fetched);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_waits_out_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeMediaSource::throttled(
            "file-r",
            Duration::from_millis(100),
        ));
        let fetcher = MediaFetcher::new(source.clone(), dir.path().to_path_buf(), policy(3));

        let started = std::time::Instant::now();
        let fetched = fetcher.fetch(photo(110, 0, "file-r")).await;

        assert_eq!(fetched.status, MediaStatus::Fetched);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_fetch_exhausted_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeMediaSource::failing("file-c", 10));
        let fetcher = MediaFetcher::new(source.clone(), dir.path().to_path_buf(), policy(3));

        let fetched = fetcher.fetch(photo(103, 0, "file-c")).await;
        assert_eq!(fetched.status, MediaStatus::Failed);
        assert_eq!(fetched.local_path, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(!dir.path().join("NewQuark").join("103_0.jpg.part").exists());
    }

    #[tokio::test]
    async fn test_pool_resolves_every_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open_in_memory().unwrap();
        let committer = Arc::new(Committer::new(Arc::new(store.clone()), policy(3)));

        let refs = vec![photo(7, 0, "ok-0"), photo(7, 1, "bad-1"), photo(7, 2, "ok-2")];
        let record = MessageRecord {
            channel_id: "NewQuark".to_string(),
            message_id: 7,
            text: "album".to_string(),
            media_refs: refs.clone(),
            received_at: Utc::now(),
            sent_at: Utc::now(),
            details: PostDetails::default(),
        };
        committer.commit(&record).await.unwrap();

        let fetcher = Arc::new(MediaFetcher::new(
            Arc::new(FakeMediaSource::failing("bad-1", 100)),
            dir.path().to_path_buf(),
            policy(2),
        ));
        let (queue, handle) =
            spawn_media_pool(fetcher, committer, 2, CancellationToken::new());
        for media in refs {
            queue.enqueue(media);
        }
        drop(queue);
        handle.await.unwrap();

        let stored = store.load_media_for("NewQuark", 7).await.unwrap();
        let statuses: Vec<MediaStatus> = stored.iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![MediaStatus::Fetched, MediaStatus::Failed, MediaStatus::Fetched]
        );
        assert!(stored[0].local_path.is_some());
        assert!(stored[1].local_path.is_none());
    }

    /// Never finishes a download within a test's lifetime.
    struct StalledSource;

    #[async_trait::async_trait]
    impl MediaSource for StalledSource {
        async fn download(&self, _remote_id: &str, _dest: &Path) -> crate::error::Result<u64> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_download_and_keeps_row_pending() {
        let store = MessageStore::open_in_memory().unwrap();
        let committer = Arc::new(Committer::new(Arc::new(store.clone()), policy(3)));
        let record = MessageRecord {
            channel_id: "NewQuark".to_string(),
            message_id: 9,
            text: "slow".to_string(),
            media_refs: vec![photo(9, 0, "stalled")],
            received_at: Utc::now(),
            sent_at: Utc::now(),
            details: PostDetails::default(),
        };
        committer.commit(&record).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MediaFetcher::new(
            Arc::new(StalledSource),
            dir.path().to_path_buf(),
            policy(3),
        ));
        let cancel = CancellationToken::new();
        let (queue, handle) = spawn_media_pool(fetcher, committer, 1, cancel.clone());
        queue.enqueue(photo(9, 0, "stalled"));

        // Let the worker pick the job up before shutting down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pool did not stop promptly")
            .unwrap();

        let stored = store.load_media_for("NewQuark", 9).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, MediaStatus::Pending);
        assert_eq!(stored[0].local_path, None);

        let pending = store.load_pending_media().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].remote_id, "stalled");
    }
}
