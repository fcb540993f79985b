use std::collections::HashMap;
use std::hash::Hash;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A socket the selector can wait on for read readiness.
#[async_trait]
pub trait ReadinessSource: Send + Sync + 'static {
    async fn readable(&self) -> io::Result<()>;
}

#[async_trait]
impl ReadinessSource for UdpSocket {
    async fn readable(&self) -> io::Result<()> {
        UdpSocket::readable(self).await
    }
}

/// Registration change sent to the task that owns the selector.
pub enum SelectorCommand<K, S> {
    Register(K, Arc<S>),
    Deregister(K),
}

/// Cloneable sender side used by tasks that do not own the selector.
pub struct SelectorHandle<K, S> {
    commands: mpsc::UnboundedSender<SelectorCommand<K, S>>,
}

impl<K, S> Clone for SelectorHandle<K, S> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<K, S> SelectorHandle<K, S> {
    /// Ask the selector to watch `source` under `key`, replacing any previous source.
    pub fn register(&self, key: K, source: Arc<S>) {
        if self.commands.send(SelectorCommand::Register(key, source)).is_err() {
            tracing::trace!("selector closed, registration ignored");
        }
    }

    pub fn deregister(&self, key: K) {
        let _ = self.commands.send(SelectorCommand::Deregister(key));
    }
}

/// Outcome of one [`Selector::select`] call.
pub enum Selected<K, S> {
    Ready {
        key: K,
        source: Arc<S>,
        result: io::Result<()>,
    },
    Timeout,
}

struct Registration<S> {
    id: u64,
    source: Arc<S>,
    cancel: CancellationToken,
}

type Readiness<K> = BoxFuture<'static, (K, u64, Option<io::Result<()>>)>;

/// Readiness multiplexer owned by a single task.
///
/// Other tasks change the interest set by sending [`SelectorCommand`]s; the
/// owner applies them between waits. A readiness event is reported once per
/// registration and must be re-armed with [`Selector::rearm`] after the source
/// has been drained.
pub struct Selector<K, S> {
    commands: mpsc::UnboundedReceiver<SelectorCommand<K, S>>,
    commands_open: bool,
    registered: HashMap<K, Registration<S>>,
    pending: FuturesUnordered<Readiness<K>>,
    next_id: u64,
}

enum Wake<K, S> {
    Command(Option<SelectorCommand<K, S>>),
    Ready(K, u64, Option<io::Result<()>>),
    Timeout,
}

/// Create a selector and a handle feeding it.
pub fn channel<K, S>() -> (SelectorHandle<K, S>, Selector<K, S>)
where
    K: Clone + Eq + Hash + Send + 'static,
    S: ReadinessSource,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let selector = Selector {
        commands: rx,
        commands_open: true,
        registered: HashMap::new(),
        pending: FuturesUnordered::new(),
        next_id: 0,
    };
    (SelectorHandle { commands: tx }, selector)
}

impl<K, S> Selector<K, S>
where
    K: Clone + Eq + Hash + Send + 'static,
    S: ReadinessSource,
{
    /// Wait up to `timeout` for one registered source to become readable.
    pub async fn select(&mut self, timeout: Duration) -> Selected<K, S> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        loop {
            let wake = tokio::select! {
                biased;
                cmd = self.commands.recv(), if self.commands_open => Wake::Command(cmd),
                Some((key, id, result)) = self.pending.next(), if !self.pending.is_empty() => {
                    Wake::Ready(key, id, result)
                }
                _ = &mut sleep => Wake::Timeout,
            };

            match wake {
                Wake::Command(Some(cmd)) => self.apply(cmd),
                Wake::Command(None) => self.commands_open = false,
                // cancelled registration
                Wake::Ready(_, _, None) => {}
                Wake::Ready(key, id, Some(result)) => {
                    if let Some(reg) = self.registered.get(&key) {
                        if reg.id == id {
                            return Selected::Ready {
                                key,
                                source: Arc::clone(&reg.source),
                                result,
                            };
                        }
                    }
                }
                Wake::Timeout => return Selected::Timeout,
            }
        }
    }

    /// Watch `key` again after its readiness was reported.
    pub fn rearm(&mut self, key: &K) {
        if let Some(reg) = self.registered.get(key) {
            let future = readiness(key.clone(), reg.id, Arc::clone(&reg.source), reg.cancel.clone());
            self.pending.push(future);
        }
    }

    pub fn register(&mut self, key: K, source: Arc<S>) {
        self.apply(SelectorCommand::Register(key, source));
    }

    pub fn deregister(&mut self, key: &K) -> Option<Arc<S>> {
        let reg = self.registered.remove(key)?;
        reg.cancel.cancel();
        Some(reg.source)
    }

    pub fn is_registered(&self, key: &K) -> bool {
        self.registered.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Drop every registration and pending wait.
    pub fn close(&mut self) {
        for (_, reg) in self.registered.drain() {
            reg.cancel.cancel();
        }
        self.pending = FuturesUnordered::new();
        self.commands.close();
        self.commands_open = false;
    }

    fn apply(&mut self, cmd: SelectorCommand<K, S>) {
        match cmd {
            SelectorCommand::Register(key, source) => {
                self.next_id = self.next_id.wrapping_add(1);
                let id = self.next_id;
                let cancel = CancellationToken::new();
                self.pending
                    .push(readiness(key.clone(), id, Arc::clone(&source), cancel.clone()));
                if let Some(old) = self.registered.insert(key, Registration { id, source, cancel }) {
                    old.cancel.cancel();
                }
            }
            SelectorCommand::Deregister(key) => {
                self.deregister(&key);
            }
        }
    }
}

fn readiness<K, S>(key: K, id: u64, source: Arc<S>, cancel: CancellationToken) -> Readiness<K>
where
    K: Send + 'static,
    S: ReadinessSource,
{
    Box::pin(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            r = source.readable() => Some(r),
        };
        (key, id, result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn udp_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (Arc::new(a), b)
    }

    #[tokio::test]
    async fn test_reports_readable_source() {
        let (handle, mut selector) = channel::<u32, UdpSocket>();
        let (watched, peer) = udp_pair().await;

        handle.register(7, Arc::clone(&watched));
        peer.send(b"ping").await.unwrap();

        match selector.select(Duration::from_secs(2)).await {
            Selected::Ready { key, source, result } => {
                assert_eq!(key, 7);
                assert!(result.is_ok());
                assert!(Arc::ptr_eq(&source, &watched));
            }
            Selected::Timeout => panic!("expected readiness"),
        }
    }

    #[tokio::test]
    async fn test_deregistered_source_is_silent() {
        let (handle, mut selector) = channel::<u32, UdpSocket>();
        let (watched, peer) = udp_pair().await;

        handle.register(1, Arc::clone(&watched));
        handle.deregister(1);
        peer.send(b"ping").await.unwrap();

        assert!(matches!(
            selector.select(Duration::from_millis(100)).await,
            Selected::Timeout
        ));
        assert!(selector.is_empty());
    }

    #[tokio::test]
    async fn test_rearm_after_drain() {
        let (_handle, mut selector) = channel::<u32, UdpSocket>();
        let (watched, peer) = udp_pair().await;
        selector.register(3, Arc::clone(&watched));

        peer.send(b"one").await.unwrap();
        assert!(matches!(
            selector.select(Duration::from_secs(2)).await,
            Selected::Ready { key: 3, .. }
        ));

        let mut buf = [0u8; 16];
        while watched.try_recv(&mut buf).is_ok() {}

        // not re-armed yet: new data is not reported
        peer.send(b"two").await.unwrap();
        assert!(matches!(
            selector.select(Duration::from_millis(50)).await,
            Selected::Timeout
        ));

        selector.rearm(&3);
        assert!(matches!(
            selector.select(Duration::from_secs(2)).await,
            Selected::Ready { key: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_reregister_replaces_source() {
        let (_handle, mut selector) = channel::<u32, UdpSocket>();
        let (first, first_peer) = udp_pair().await;
        let (second, second_peer) = udp_pair().await;

        selector.register(9, Arc::clone(&first));
        selector.register(9, Arc::clone(&second));
        assert_eq!(selector.len(), 1);
        assert!(selector.is_registered(&9));

        first_peer.send(b"stale").await.unwrap();
        second_peer.send(b"fresh").await.unwrap();

        match selector.select(Duration::from_secs(2)).await {
            Selected::Ready { source, .. } => assert!(Arc::ptr_eq(&source, &second)),
            Selected::Timeout => panic!("expected readiness"),
        }

        selector.close();
        assert!(selector.is_empty());
        assert_eq!(Arc::strong_count(&first), 1);
    }
}
