//! Exchange scheduler.
//!
//! All exchanges, outbound and inbound, funnel through one worker task so
//! that at most one B2F session runs at a time. Callers hand over a stream
//! through a single-slot queue and wait for the result.
//!
//! ```text
//!  connect ──┐
//!            ├──> mpsc(1) ──> [worker] ──> Session::exchange
//!  listener ─┘        ^            │
//!                     └─ oneshot <─┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{B2FError, Result};
use crate::protocol::{Session, TrafficStats};
use crate::transport::BoxStream;

/// Builds the session for one exchange from the target callsign and the
/// master flag.
pub type SessionFactory = Arc<dyn Fn(&str, bool) -> Session + Send + Sync>;

struct ExchangeRequest {
    stream: BoxStream,
    target: String,
    master: bool,
    reply: oneshot::Sender<Result<TrafficStats>>,
}

/// Handle for submitting exchanges to the worker
#[derive(Clone)]
pub struct Exchanger {
    tx: mpsc::Sender<ExchangeRequest>,
    abort_tx: Arc<watch::Sender<u64>>,
}

impl Exchanger {
    /// Run an exchange over `stream` and wait for it to finish.
    ///
    /// Waits for any exchange already in progress.
    pub async fn exchange(&self, stream: BoxStream, target: &str, master: bool) -> Result<TrafficStats> {
        let (reply, rx) = oneshot::channel();
        // Only the first word of a target is a callsign.
        let target = target.split(' ').next().unwrap_or(target).to_string();

        self.tx
            .send(ExchangeRequest {
                stream,
                target,
                master,
                reply,
            })
            .await
            .map_err(|_| B2FError::Aborted)?;
        rx.await.map_err(|_| B2FError::Aborted)?
    }

    /// Cancel the exchange in progress, closing its stream.
    pub fn abort(&self) {
        self.abort_tx.send_modify(|n| *n += 1);
    }
}

/// The single exchange worker
pub struct ExchangeWorker;

impl ExchangeWorker {
    /// Start the worker. It stops when every [`Exchanger`] is dropped.
    pub fn spawn(factory: SessionFactory) -> Exchanger {
        let (tx, rx) = mpsc::channel(1);
        let (abort_tx, abort_rx) = watch::channel(0u64);
        tokio::spawn(Self::run(factory, rx, abort_rx));
        Exchanger {
            tx,
            abort_tx: Arc::new(abort_tx),
        }
    }

    async fn run(
        factory: SessionFactory,
        mut rx: mpsc::Receiver<ExchangeRequest>,
        mut abort_rx: watch::Receiver<u64>,
    ) {
        while let Some(req) = rx.recv().await {
            // Aborts issued while idle don't apply to the next exchange.
            abort_rx.borrow_and_update();

            let mut session = factory(&req.target, req.master);
            let remote_addr = req.stream.remote_addr();
            let local_addr = req.stream.local_addr();
            tracing::info!("Connected to {} ({})", req.target, remote_addr);

            let start = Instant::now();
            let result = tokio::select! {
                result = session.exchange(req.stream) => result,
                Ok(()) = abort_rx.changed() => {
                    tracing::info!("Exchange with {} aborted", req.target);
                    Err(B2FError::Aborted)
                },
            };
            let stats = session.stats();

            if let Err(e) = &result {
                if e.is_login_failure() {
                    tracing::warn!(
                        "Secure login failed. Passwords created before 2018-01-31 must be entered in ALL-UPPERCASE letters."
                    );
                }
            }

            tracing::info!(
                target: "exchange",
                mycall = session.mycall(),
                targetcall = session.targetcall(),
                remote_fw = ?session.remote_forwarders().iter().map(ToString::to_string).collect::<Vec<_>>(),
                remote_sid = %session.remote_sid(),
                master = req.master,
                remote_addr = %remote_addr,
                local_addr = %local_addr,
                sent = ?stats.sent,
                received = ?stats.received,
                duration_ms = start.elapsed().as_millis() as u64,
                success = result.is_ok(),
                error = %result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
                "exchange"
            );

            let _ = req.reply.send(result);
        }
        tracing::debug!("Exchange worker stopped");
    }
}
