use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::listener::{EventListener, ListenerExit};
use crate::retry::RetryPolicy;
use crate::transport::{Connector, Credentials, Session};

/// Lifecycle of the provider connection, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Owns the authenticated session: opens it, keeps it alive through the
/// listener, and re-establishes it after drops.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    proxy: ProxyConfig,
    channel: String,
    retry: RetryPolicy,
    state: ConnectionState,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Credentials,
        proxy: ProxyConfig,
        channel: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connector,
            credentials,
            proxy,
            channel,
            retry,
            state: ConnectionState::Idle,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(
                channel = %self.channel,
                from = %self.state,
                to = %next,
                "connection state changed"
            );
            self.state = next;
        }
    }

    /// Open an authenticated session subscribed to the channel.
    ///
    /// The proxy is validated first; an enabled but incomplete proxy fails
    /// with `IngestError::Config` without touching the network. Transport
    /// failures are retried with backoff, auth failures are not.
    pub async fn connect(&self) -> Result<Box<dyn Session>> {
        let proxy = self.proxy.validate()?;
        if let Some(proxy) = &proxy {
            info!(proxy = %proxy.url(), "connecting through proxy");
        }

        let connector = &self.connector;
        let credentials = &self.credentials;
        let channel = self.channel.as_str();
        let proxy = proxy.as_ref();
        self.retry
            .run("connect", move || async move {
                connector.connect(credentials, proxy, channel).await
            })
            .await
    }

    /// Keep a session alive until `cancel` fires or an unrecoverable error
    /// occurs. Dropped sessions are reopened and handed back to `listener`.
    pub async fn maintain(
        &mut self,
        listener: &mut EventListener,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut drops: u32 = 0;

        loop {
            if drops == 0 {
                self.transition(ConnectionState::Connecting);
            } else {
                self.transition(ConnectionState::Reconnecting);
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => None,
                session = self.connect() => Some(session),
            };

            let mut session = match connected {
                None => break,
                Some(Ok(session)) => session,
                Some(Err(err)) => {
                    error!(channel = %self.channel, error = %err, "unable to connect, giving up");
                    self.transition(ConnectionState::Stopped);
                    return Err(err);
                }
            };

            self.transition(ConnectionState::Connected);
            let exit = listener.run(session.as_mut(), cancel).await;
            session.disconnect().await;

            match exit {
                ListenerExit::Shutdown => break,
                ListenerExit::Disconnected(err) if err.is_fatal() => {
                    error!(channel = %self.channel, error = %err, "session failed permanently");
                    self.transition(ConnectionState::Stopped);
                    return Err(err);
                }
                ListenerExit::Disconnected(err) => {
                    // A session that delivered anything counts as recovered.
                    if listener.delivered() > 0 {
                        drops = 0;
                    }
                    let backoff = self.retry.backoff(drops.min(4));
                    let delay = err.retry_after().map_or(backoff, |wait| wait.max(backoff));
                    warn!(
                        channel = %self.channel,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "session dropped, reconnecting"
                    );
                    drops = drops.saturating_add(1);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.transition(ConnectionState::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::committer::Committer;
    use crate::error::IngestError;
    use crate::media::{spawn_media_pool, MediaFetcher};
    use crate::pipeline::Pipeline;
    use crate::store::MessageStore;
    use crate::transport::testing::{event, ConnectOutcome, FakeMediaSource, ScriptedConnector, Step};
    use crate::transport::RawEvent;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn manager(connector: Arc<ScriptedConnector>, proxy: ProxyConfig) -> ConnectionManager {
        manager_with(connector, proxy, policy(3))
    }

    fn manager_with(
        connector: Arc<ScriptedConnector>,
        proxy: ProxyConfig,
        retry: RetryPolicy,
    ) -> ConnectionManager {
        ConnectionManager::new(
            connector,
            Credentials {
                bot_token: "123:abc".to_string(),
            },
            proxy,
            "@NewQuark".to_string(),
            retry,
        )
    }

    fn listener() -> (EventListener, mpsc::Receiver<RawEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            EventListener::new("@NewQuark", tx, Duration::from_secs(60)),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<RawEvent>) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            ids.push(raw.message_id.unwrap());
        }
        ids
    }

    /// Runs the manager until `rx` has seen `count` events or nothing
    /// arrives for two seconds, then cancels it.
    async fn run_until(
        manager: &mut ConnectionManager,
        listener: &mut EventListener,
        rx: &mut mpsc::Receiver<RawEvent>,
        count: usize,
    ) -> (Result<()>, Vec<i64>) {
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();

        let collector = async move {
            let mut ids = Vec::new();
            while ids.len() < count {
                match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                    Ok(Some(raw)) => ids.push(raw.message_id.unwrap()),
                    _ => break,
                }
            }
            stopper.cancel();
            ids
        };

        tokio::join!(manager.maintain(listener, &cancel), collector)
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            ConnectOutcome::Session(vec![
                Step::Event(event("NewQuark", 1, "a")),
                Step::Drop,
            ]),
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 2, "b"))]),
        ]));
        let mut manager = manager(connector.clone(), ProxyConfig::default());
        let (mut listener, mut rx) = listener();

        let (result, ids) = run_until(&mut manager, &mut listener, &mut rx, 2).await;

        assert!(result.is_ok());
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_transient_connect_failures_are_retried() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            ConnectOutcome::Fail(|| IngestError::transport("network unreachable")),
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 9, "ok"))]),
        ]));
        let mut manager = manager(connector.clone(), ProxyConfig::default());
        let (mut listener, mut rx) = listener();

        let (result, ids) = run_until(&mut manager, &mut listener, &mut rx, 1).await;

        assert!(result.is_ok());
        assert_eq!(ids, vec![9]);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal_and_not_retried() {
        let connector = Arc::new(ScriptedConnector::new(vec![ConnectOutcome::Fail(|| {
            IngestError::Auth("401 Unauthorized".to_string())
        })]));
        let mut manager = manager(connector.clone(), ProxyConfig::default());
        let (mut listener, _rx) = listener();

        let result = manager
            .maintain(&mut listener, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(IngestError::Auth(_))));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_exhausted_connect_retries_surface_transport_error() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            ConnectOutcome::Fail(|| IngestError::transport("refused")),
            ConnectOutcome::Fail(|| IngestError::transport("refused")),
            ConnectOutcome::Fail(|| IngestError::transport("refused")),
        ]));
        let manager = manager(connector.clone(), ProxyConfig::default());

        let result = manager.connect().await;
        assert!(matches!(result, Err(IngestError::Transport(_))));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_incomplete_proxy_fails_before_connecting() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let proxy = ProxyConfig {
            enabled: true,
            kind: Some("socks5".to_string()),
            address: Some("127.0.0.1".to_string()),
            port: None,
        };
        let manager = manager(connector.clone(), proxy);

        let result = manager.connect().await;
        assert!(matches!(result, Err(IngestError::Config(_))));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_session_auth_failure_stops_manager() {
        let connector = Arc::new(ScriptedConnector::new(vec![ConnectOutcome::Session(
            vec![
                Step::Event(event("NewQuark", 1, "a")),
                Step::Fail(|| IngestError::Auth("token revoked".to_string())),
            ],
        )]));
        let mut manager = manager(connector.clone(), ProxyConfig::default());
        let (mut listener, mut rx) = listener();

        let result = manager
            .maintain(&mut listener, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(IngestError::Auth(_))));
        assert_eq!(drain(&mut rx), vec![1]);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_productive_sessions_reset_backoff() {
        // Without a reset the fourth reconnect alone would wait 1.6 s.
        let connector = Arc::new(ScriptedConnector::new(vec![
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 1, "a")), Step::Drop]),
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 2, "b")), Step::Drop]),
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 3, "c")), Step::Drop]),
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 4, "d")), Step::Drop]),
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 5, "e"))]),
        ]));
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            attempt_timeout: Some(Duration::from_secs(5)),
        };
        let mut manager = manager_with(connector.clone(), ProxyConfig::default(), retry);
        let (mut listener, mut rx) = listener();

        let started = std::time::Instant::now();
        let (result, ids) = run_until(&mut manager, &mut listener, &mut rx, 5).await;

        assert!(result.is_ok());
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() < Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn test_rate_limited_session_waits_before_reconnecting() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            ConnectOutcome::Session(vec![
                Step::Event(event("NewQuark", 1, "a")),
                Step::Fail(|| IngestError::RateLimited {
                    retry_after: Duration::from_millis(150),
                }),
            ]),
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 2, "b"))]),
        ]));
        let mut manager = manager(connector.clone(), ProxyConfig::default());
        let (mut listener, mut rx) = listener();

        let started = std::time::Instant::now();
        let (result, ids) = run_until(&mut manager, &mut listener, &mut rx, 2).await;

        assert!(result.is_ok());
        assert_eq!(ids, vec![1, 2]);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_redelivery_after_reconnect_stores_one_row() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 5, "first")), Step::Drop]),
            ConnectOutcome::Session(vec![Step::Event(event("NewQuark", 5, "first"))]),
        ]));
        let mut manager = manager(connector.clone(), ProxyConfig::default());
        let (mut listener, mut rx) = listener();

        let store = MessageStore::open_in_memory().unwrap();
        let committer = Arc::new(Committer::new(Arc::new(store.clone()), policy(3)));
        let media_dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MediaFetcher::new(
            Arc::new(FakeMediaSource::default()),
            media_dir.path().to_path_buf(),
            policy(3),
        ));
        let (queue, pool) =
            spawn_media_pool(fetcher, Arc::clone(&committer), 1, CancellationToken::new());
        let (pipe_tx, pipe_rx) = mpsc::channel(16);
        let pipeline = tokio::spawn(Pipeline::new(committer, queue).run(pipe_rx));

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let relay = async move {
            for _ in 0..2 {
                let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                pipe_tx.send(raw).await.unwrap();
            }
            stopper.cancel();
        };
        let (result, ()) = tokio::join!(manager.maintain(&mut listener, &cancel), relay);
        pipeline.await.unwrap();
        pool.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(store.load_stats().await.unwrap().messages, 1);
        assert!(store.message_exists("NewQuark", 5).await.unwrap());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
