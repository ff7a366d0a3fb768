//! Supervised inbound listeners.
//!
//! Each enabled transport gets its own loop:
//!
//! ```text
//! init ──ok──> accept ──> exchange (master) ──> accept ...
//!   │             │
//!   err           err
//!   └── 1s ──> init <┘
//! ```
//!
//! A failing listener is reported once and then retried silently until it
//! comes back, which is reported once as well.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use super::exchange::Exchanger;
use crate::error::Result;
use crate::transport::{Acceptor, TransportListener};

/// Delay between attempts to re-establish a failed listener.
pub const LISTENER_RETRY_INTERVAL: Duration = Duration::from_secs(1);

struct ListenerEntry {
    stop_tx: watch::Sender<bool>,
    healthy: Arc<AtomicBool>,
}

/// Owns the supervising loops of all enabled listeners
pub struct ListenerHub {
    exchanger: Exchanger,
    listeners: Mutex<HashMap<String, ListenerEntry>>,
}

impl ListenerHub {
    /// Hand accepted connections to `exchanger`
    pub fn new(exchanger: Exchanger) -> Self {
        Self {
            exchanger,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Start listening on `transport`. Returns false if a listener with the
    /// same name is already enabled.
    pub async fn enable(&self, transport: Arc<dyn TransportListener>) -> bool {
        let mut listeners = self.listeners.lock().await;
        let name = transport.name().to_string();
        if listeners.contains_key(&name) {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let healthy = Arc::new(AtomicBool::new(false));
        tokio::spawn(supervise(
            transport,
            self.exchanger.clone(),
            healthy.clone(),
            stop_rx,
        ));

        tracing::info!("Listening for incoming traffic on {}...", name);
        listeners.insert(name, ListenerEntry { stop_tx, healthy });
        true
    }

    /// Stop the listener `name`. Returns false if it was not enabled.
    ///
    /// An exchange already in progress is not interrupted.
    pub async fn disable(&self, name: &str) -> bool {
        match self.listeners.lock().await.remove(name) {
            Some(entry) => {
                let _ = entry.stop_tx.send(true);
                true
            },
            None => false,
        }
    }

    /// Stop every listener
    pub async fn close(&self) {
        for (_, entry) in self.listeners.lock().await.drain() {
            let _ = entry.stop_tx.send(true);
        }
    }

    /// Names of the listeners currently accepting connections, sorted
    pub async fn active(&self) -> Vec<String> {
        let listeners = self.listeners.lock().await;
        let mut names: Vec<String> = listeners
            .iter()
            .filter(|(_, entry)| entry.healthy.load(Ordering::SeqCst))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

async fn supervise(
    transport: Arc<dyn TransportListener>,
    exchanger: Exchanger,
    healthy: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let name = transport.name();
    let mut silenced = false;

    loop {
        let init = tokio::select! {
            result = transport.init() => result,
            _ = stop_rx.changed() => break,
        };

        let mut acceptor = match init {
            Ok(acceptor) => acceptor,
            Err(e) => {
                healthy.store(false, Ordering::SeqCst);
                if !silenced {
                    tracing::warn!("Listener {} failed: {}", name, e);
                    tracing::info!("Will try to re-establish listener in the background...");
                    silenced = true;
                }
                tokio::select! {
                    _ = tokio::time::sleep(LISTENER_RETRY_INTERVAL) => continue,
                    _ = stop_rx.changed() => break,
                }
            },
        };

        healthy.store(true, Ordering::SeqCst);
        if silenced {
            tracing::info!("Listener {} re-established", name);
            silenced = false;
        }

        match accept_loop(name, acceptor.as_mut(), &exchanger, &mut stop_rx).await {
            Ok(()) => break,
            Err(e) => {
                healthy.store(false, Ordering::SeqCst);
                tracing::warn!("Accept {} failed: {}", name, e);
            },
        }
    }

    healthy.store(false, Ordering::SeqCst);
    tracing::debug!("Listener {} stopped", name);
}

/// Accept until stopped (`Ok`) or the acceptor fails.
async fn accept_loop(
    name: &str,
    acceptor: &mut dyn Acceptor,
    exchanger: &Exchanger,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let stream = tokio::select! {
            result = acceptor.accept() => result?,
            _ = stop_rx.changed() => return Ok(()),
        };

        let remote = stream
            .remote_call()
            .filter(|call| !call.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| stream.remote_addr());
        tracing::info!("Got connect ({}:{})", name, remote);

        match exchanger.exchange(stream, &remote, true).await {
            Ok(_) => tracing::info!("Disconnected."),
            Err(e) => tracing::warn!("Exchange failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::exchange::ExchangeWorker;
    use crate::error::B2FError;
    use crate::protocol::Session;
    use crate::transport::{BoxFuture, TelnetListener};
    use std::sync::atomic::AtomicUsize;

    fn exchanger() -> Exchanger {
        ExchangeWorker::spawn(Arc::new(|target: &str, master: bool| {
            Session::new("LA5NTA", target, "").with_master(master)
        }))
    }

    struct Flaky {
        attempts: Arc<AtomicUsize>,
    }

    impl TransportListener for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn listen_addr(&self) -> String {
            "nowhere".to_string()
        }

        fn init(&self) -> BoxFuture<'_, Result<Box<dyn Acceptor>>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(B2FError::Network("no modem".to_string())) })
        }
    }

    #[tokio::test]
    async fn test_enable_disable() {
        let hub = ListenerHub::new(exchanger());
        let telnet: Arc<dyn TransportListener> = Arc::new(TelnetListener::new("127.0.0.1:0"));

        assert!(hub.enable(telnet.clone()).await);
        assert!(!hub.enable(telnet).await);

        for _ in 0..50 {
            if !hub.active().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.active().await, vec!["telnet".to_string()]);

        assert!(hub.disable("telnet").await);
        assert!(!hub.disable("telnet").await);
        assert!(hub.active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_listener_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let hub = ListenerHub::new(exchanger());
        hub.enable(Arc::new(Flaky {
            attempts: attempts.clone(),
        }))
        .await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert!(hub.active().await.is_empty());

        hub.close().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let after_close = attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), after_close);
    }
}
