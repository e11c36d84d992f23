//! One JSON-RPC tunnel per admitted WebSocket connection.
//!
//! All outbound frames go through a single sink behind an async mutex, so
//! concurrent senders never interleave partial frames. Closing is idempotent:
//! whichever path wins the close flag releases the sink and runs the close
//! hooks, every other caller returns immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use mexec_protocol::{ChannelEvent, Notification, Response};
use mexec_topics::{HELLO_TEXT, METHOD_CONNECTED};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const SINK_CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub(crate) enum TunnelError {
    #[error("tunnel closed")]
    Closed,
    #[error("tunnel attributes are sealed")]
    Sealed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Outbound half of the connection.
#[async_trait]
pub(crate) trait FrameSink: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), TunnelError>;
    async fn close(&mut self);
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<(), TunnelError> {
        self.send(Message::Text(text.into()))
            .await
            .map_err(|err| TunnelError::Transport(err.to_string()))
    }

    async fn close(&mut self) {
        if let Err(err) = SinkExt::close(self).await {
            trace!(%err, "websocket close handshake failed");
        }
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

pub(crate) struct Tunnel {
    id: String,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    attributes: RwLock<HashMap<String, String>>,
    sealed: AtomicBool,
    closed: AtomicBool,
    close_token: CancellationToken,
    greeted: CancellationToken,
    close_hooks: SyncMutex<Vec<CloseHook>>,
}

impl Tunnel {
    /// Wrap an upgraded connection's outbound half.
    pub fn establish(sink: Box<dyn FrameSink>) -> Arc<Self> {
        let id = format!("tunnel-{}", uuid::Uuid::new_v4().simple());
        debug!(tunnel = %id, "tunnel established");
        Arc::new(Self {
            id,
            sink: Mutex::new(Some(sink)),
            attributes: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            greeted: CancellationToken::new(),
            close_hooks: SyncMutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store a per-connection attribute. Rejected once the tunnel is sealed.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), TunnelError> {
        // hold the write lock across the check so seal() cannot slip in between
        let mut attributes = self.attributes.write();
        if self.sealed.load(Ordering::Acquire) {
            return Err(TunnelError::Sealed);
        }
        attributes.insert(key.into(), value.into());
        Ok(())
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.read().get(key).cloned()
    }

    /// Freeze attributes before handing the tunnel to request handlers.
    pub fn seal(&self) {
        let _attributes = self.attributes.write();
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the tunnel has been closed from any path.
    pub async fn closed(&self) {
        self.close_token.cancelled().await
    }

    /// Resolves once the handshake has been written or the tunnel is closed.
    pub async fn greeted(&self) {
        tokio::select! {
            _ = self.greeted.cancelled() => {}
            _ = self.close_token.cancelled() => {}
        }
    }

    /// Run `hook` exactly once when the tunnel closes; immediately if already closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.close_hooks.lock();
            if !self.is_closed() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), TunnelError> {
        self.send_json(&Notification::new(method, params)).await
    }

    pub async fn send_response(&self, response: &Response) -> Result<(), TunnelError> {
        self.send_json(response).await
    }

    /// Handshake notification announcing the tunnel is ready.
    pub async fn say_hello(&self) -> Result<(), TunnelError> {
        let hello = ChannelEvent {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            channel: self.id.clone(),
            text: HELLO_TEXT.into(),
        };
        self.send_notification(METHOD_CONNECTED, serde_json::to_value(hello)?)
            .await?;
        self.greeted.cancel();
        Ok(())
    }

    async fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), TunnelError> {
        let text = serde_json::to_string(frame)?;
        self.send_text(text).await
    }

    async fn send_text(&self, text: String) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let write = async {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send_text(text).await,
                None => Err(TunnelError::Closed),
            }
        };
        // a stalled peer must not keep the sink from close()
        let result = tokio::select! {
            biased;
            _ = self.close_token.cancelled() => Err(TunnelError::Closed),
            result = write => result,
        };
        if let Err(err) = &result {
            if !matches!(err, TunnelError::Closed) {
                debug!(tunnel = %self.id, %err, "write failed; closing tunnel");
                self.close().await;
            }
        }
        result
    }

    /// Release the connection. Safe to call any number of times from any task.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.close_token.cancel();
        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            hook();
        }
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if tokio::time::timeout(SINK_CLOSE_GRACE, sink.close()).await.is_err() {
                debug!(tunnel = %self.id, "sink close timed out");
            }
        }
        debug!(tunnel = %self.id, "tunnel closed");
    }
}

/// Live tunnels, keyed by id. Entries drop out when their tunnel closes.
#[derive(Default)]
pub(crate) struct TunnelRegistry {
    tunnels: SyncMutex<HashMap<String, Weak<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn register(self: &Arc<Self>, tunnel: &Arc<Tunnel>) {
        self.tunnels
            .lock()
            .insert(tunnel.id().to_string(), Arc::downgrade(tunnel));
        let registry = Arc::downgrade(self);
        let id = tunnel.id().to_string();
        tunnel.on_close(move || {
            if let Some(registry) = registry.upgrade() {
                registry.tunnels.lock().remove(&id);
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub async fn close_all(&self) {
        let live: Vec<Arc<Tunnel>> = self
            .tunnels
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for tunnel in live {
            tunnel.close().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{channel_tunnel, ChannelSink};
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn attributes_are_frozen_after_seal() {
        let (tunnel, _rx, _) = channel_tunnel();
        tunnel.set_attribute("bearerToken", "t0k").unwrap();
        tunnel.seal();
        assert!(matches!(
            tunnel.set_attribute("bearerToken", "other"),
            Err(TunnelError::Sealed)
        ));
        assert_eq!(tunnel.attribute("bearerToken").as_deref(), Some("t0k"));
    }

    #[tokio::test]
    async fn hello_is_a_connected_notification() {
        let (tunnel, mut rx, _) = channel_tunnel();
        tunnel.say_hello().await.unwrap();
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["method"], "connected");
        assert_eq!(frame["params"]["channel"], json!(tunnel.id()));
        assert!(frame.get("id").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_produce_whole_frames() {
        let (tunnel, mut rx, _) = channel_tunnel();
        let mut joins = Vec::new();
        for task in 0..8 {
            let tunnel = tunnel.clone();
            joins.push(tokio::spawn(async move {
                for n in 0..25 {
                    tunnel
                        .send_notification("onExecExit", json!({"task": task, "n": n}))
                        .await
                        .unwrap();
                }
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        let mut per_task = HashMap::new();
        for _ in 0..200 {
            let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            let task = frame["params"]["task"].as_i64().unwrap();
            let n = frame["params"]["n"].as_i64().unwrap();
            let prev = per_task.insert(task, n);
            assert_eq!(prev.map_or(0, |p| p + 1), n);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_close_releases_once() {
        let (tunnel, _rx, closes) = channel_tunnel();
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let counter = hook_runs.clone();
        tunnel.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let a = tokio::spawn({
            let tunnel = tunnel.clone();
            async move { tunnel.close().await }
        });
        let b = tokio::spawn({
            let tunnel = tunnel.clone();
            async move { tunnel.close().await }
        });
        a.await.unwrap();
        b.await.unwrap();
        tunnel.close().await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
        assert!(matches!(
            tunnel.send_notification("x", Value::Null).await,
            Err(TunnelError::Closed)
        ));
    }

    #[tokio::test]
    async fn failed_write_closes_tunnel() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let tunnel = Tunnel::establish(Box::new(ChannelSink {
            tx,
            closes: closes.clone(),
            fail_writes: true,
        }));
        assert!(tunnel.say_hello().await.is_err());
        assert!(tunnel.is_closed());
        tunnel.closed().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hook_registered_after_close_runs_immediately() {
        let (tunnel, _rx, _) = channel_tunnel();
        tunnel.close().await;
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tunnel.on_close(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn registry_forgets_closed_tunnels() {
        let registry = Arc::new(TunnelRegistry::default());
        let (tunnel, _rx, _) = channel_tunnel();
        registry.register(&tunnel);
        assert_eq!(registry.len(), 1);
        registry.close_all().await;
        assert_eq!(registry.len(), 0);
        assert!(tunnel.is_closed());
    }

    struct StalledSink {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send_text(&mut self, _text: String) -> Result<(), TunnelError> {
            std::future::pending().await
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_does_not_wait_for_a_stalled_write() {
        let closes = Arc::new(AtomicUsize::new(0));
        let tunnel = Tunnel::establish(Box::new(StalledSink {
            closes: closes.clone(),
        }));
        let writer = tokio::spawn({
            let tunnel = tunnel.clone();
            async move { tunnel.send_notification("onExecExit", json!({})).await }
        });
        // let the writer take the sink lock
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        tokio::time::timeout(std::time::Duration::from_secs(2), tunnel.close())
            .await
            .expect("close completes while a write is stalled");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let sent = tokio::time::timeout(std::time::Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sent, Err(TunnelError::Closed)));
    }

    #[tokio::test]
    async fn greeted_resolves_after_hello_or_close() {
        let (tunnel, _rx, _) = channel_tunnel();
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), tunnel.greeted())
            .await
            .is_err());
        tunnel.say_hello().await.unwrap();
        tunnel.greeted().await;

        let (other, _rx, _) = channel_tunnel();
        other.close().await;
        other.greeted().await;
    }
}
