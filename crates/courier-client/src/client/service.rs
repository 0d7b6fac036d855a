// Public service façade owning the queue, the session slots, and the
// configuration.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_transport::{ClientIdentity, Endpoint, Endpoints, TlsTransport, TransportConfig};
use courier_wire::{DeviceToken, GatewayResponse, encode_notification};
use rustls::RootCertStore;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::dispatch::{DispatchCommand, Notification, run_dispatch_worker};
use crate::client::feedback::run_feedback_drain;
use crate::config::ClientOptions;

/// Invoked off the dispatch worker for every decoded gateway error frame.
pub type ResponseObserver = Arc<dyn Fn(GatewayResponse) + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum EnqueueError {
    /// The dispatch queue cannot accept another frame right now (or the
    /// client has been stopped).
    #[error("dispatch queue is full")]
    QueueFull,
    #[error(transparent)]
    Invalid(#[from] courier_wire::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("feedback service is already being polled")]
    AlreadyPolling,
    #[error(transparent)]
    Transport(#[from] courier_transport::Error),
}

pub(crate) struct GatewayConfig {
    pub(crate) transport: Arc<TlsTransport>,
    pub(crate) endpoints: Endpoints,
}

/// State shared between the façade, the dispatch worker, and feedback
/// drain tasks.
pub(crate) struct Shared {
    pub(crate) config: Mutex<GatewayConfig>,
    /// Bumped on every `configure`; the worker closes a session opened
    /// under an older generation at the next safe point.
    pub(crate) generation: AtomicU64,
    pub(crate) response_observer: Mutex<Option<ResponseObserver>>,
    pub(crate) accepting: AtomicBool,
    pub(crate) polling: AtomicBool,
    pub(crate) feedback_cancel: Mutex<Option<Arc<Notify>>>,
    pub(crate) idle_timeout: Duration,
}

impl Shared {
    /// Transport, gateway endpoint, and generation as one consistent view.
    pub(crate) fn gateway_snapshot(&self) -> (Arc<TlsTransport>, Endpoint, u64) {
        let config = self.config.lock().expect("config lock poisoned");
        (
            Arc::clone(&config.transport),
            config.endpoints.gateway.clone(),
            self.generation.load(Ordering::SeqCst),
        )
    }

    /// Hand a decoded error frame to the response observer, off the
    /// worker, so a slow or panicking observer cannot stall dispatch.
    pub(crate) fn deliver_response(&self, response: GatewayResponse) {
        let observer = self
            .response_observer
            .lock()
            .expect("observer lock poisoned")
            .clone();
        if let Some(observer) = observer {
            tokio::spawn(async move { observer(response) });
        }
    }

    pub(crate) fn finish_feedback(&self) {
        self.feedback_cancel
            .lock()
            .expect("feedback cancel lock poisoned")
            .take();
        self.polling.store(false, Ordering::Release);
    }
}

/// Queueing client for the push gateway and its feedback service.
///
/// Instances are independent values; all mutable state lives behind the
/// instance's own synchronization. Construction validates the TLS identity
/// but opens no connection: the dispatch worker connects lazily when the
/// first frame arrives and disconnects again after
/// [`ClientOptions::idle_timeout`] without traffic.
pub struct Client {
    shared: Arc<Shared>,
    tx: mpsc::Sender<DispatchCommand>,
    // The receiver waits here until `start` hands it to the worker task.
    worker_rx: Mutex<Option<mpsc::Receiver<DispatchCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    max_payload_size: usize,
    identifier_supplier: Arc<dyn Fn() -> u32 + Send + Sync>,
    transport_config: TransportConfig,
}

impl Client {
    pub fn new(
        identity: ClientIdentity,
        trust: RootCertStore,
        endpoints: Endpoints,
        options: ClientOptions,
    ) -> Result<Self, courier_transport::Error> {
        let transport = Arc::new(TlsTransport::new(
            identity,
            trust,
            options.transport.clone(),
        )?);
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        Ok(Self {
            shared: Arc::new(Shared {
                config: Mutex::new(GatewayConfig {
                    transport,
                    endpoints,
                }),
                generation: AtomicU64::new(0),
                response_observer: Mutex::new(None),
                accepting: AtomicBool::new(true),
                polling: AtomicBool::new(false),
                feedback_cancel: Mutex::new(None),
                idle_timeout: options.idle_timeout,
            }),
            tx,
            worker_rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            max_payload_size: options.max_payload_size,
            identifier_supplier: options.identifier_supplier,
            transport_config: options.transport,
        })
    }

    /// Spawn the dispatch worker. Must run inside a tokio runtime. Calling
    /// `start` on a running client is a logged no-op, as is calling it
    /// after `stop`.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("worker lock poisoned");
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("tried to start an already running dispatch worker");
            return;
        }
        let Some(rx) = self
            .worker_rx
            .lock()
            .expect("queue lock poisoned")
            .take()
        else {
            warn!("client was stopped; the dispatch worker cannot be restarted");
            return;
        };
        *worker = Some(tokio::spawn(run_dispatch_worker(self.shared.clone(), rx)));
    }

    /// Graceful shutdown: new `enqueue` calls are refused, the worker
    /// flushes already-accepted frames on a best-effort basis, both
    /// sessions are closed, and `stop` returns once the worker has exited.
    pub async fn stop(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.cancel_feedback();
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        let Some(handle) = handle else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(DispatchCommand::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        if let Err(err) = handle.await {
            warn!(error = %err, "dispatch worker terminated abnormally");
        }
    }

    /// Validate, encode, and queue one notification. Never blocks: a full
    /// queue surfaces as [`EnqueueError::QueueFull`], not a wait. Returns
    /// the identifier assigned to the frame, the only correlation handle
    /// for any later error response.
    ///
    /// `expiry` is truncated to whole unix seconds (and clamped to the
    /// u32 wire field).
    pub fn enqueue(
        &self,
        token: &DeviceToken,
        payload: &[u8],
        expiry: SystemTime,
    ) -> Result<u32, EnqueueError> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(EnqueueError::QueueFull);
        }
        let identifier = (self.identifier_supplier)();
        let frame = encode_notification(
            token,
            payload,
            unix_seconds(expiry),
            identifier,
            self.max_payload_size,
        )?;
        self.tx
            .try_send(DispatchCommand::Frame(Notification { identifier, frame }))
            .map_err(|_| EnqueueError::QueueFull)?;
        debug!(identifier, token = %token, "notification queued");
        Ok(identifier)
    }

    /// Drain the feedback service once. The connect happens synchronously
    /// (transport failures surface to the caller); the drain itself runs
    /// on its own task and hands `observer` the collected token→timestamp
    /// map exactly once, keyed to the earliest observation per token.
    pub async fn fetch_unreachable<F>(&self, observer: F) -> Result<(), FetchError>
    where
        F: FnOnce(HashMap<DeviceToken, u32>) + Send + 'static,
    {
        if self.shared.polling.swap(true, Ordering::AcqRel) {
            return Err(FetchError::AlreadyPolling);
        }
        let (transport, endpoint) = {
            let config = self.shared.config.lock().expect("config lock poisoned");
            (
                Arc::clone(&config.transport),
                config.endpoints.feedback.clone(),
            )
        };
        let session = match transport.connect(&endpoint).await {
            Ok(session) => session,
            Err(err) => {
                self.shared.polling.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        let cancel = Arc::new(Notify::new());
        *self
            .shared
            .feedback_cancel
            .lock()
            .expect("feedback cancel lock poisoned") = Some(cancel.clone());
        tokio::spawn(run_feedback_drain(
            self.shared.clone(),
            session,
            cancel,
            Box::new(observer),
        ));
        Ok(())
    }

    /// Atomically replace identity, trust, and endpoints. Both cached
    /// sessions are invalidated: the worker closes its session at the next
    /// safe point (never mid-write) and reconnects under the new
    /// configuration; an in-flight feedback drain is aborted. Frames
    /// already queued but unsent go out under the new configuration.
    pub fn configure(
        &self,
        identity: ClientIdentity,
        trust: RootCertStore,
        endpoints: Endpoints,
    ) -> Result<(), courier_transport::Error> {
        let transport = Arc::new(TlsTransport::new(
            identity,
            trust,
            self.transport_config.clone(),
        )?);
        {
            let mut config = self.shared.config.lock().expect("config lock poisoned");
            *config = GatewayConfig {
                transport,
                endpoints,
            };
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.cancel_feedback();
        debug!("configuration replaced; cached sessions invalidated");
        Ok(())
    }

    /// Install the response observer, dropping any previous one.
    pub fn set_response_observer(
        &self,
        observer: impl Fn(GatewayResponse) + Send + Sync + 'static,
    ) {
        *self
            .shared
            .response_observer
            .lock()
            .expect("observer lock poisoned") = Some(Arc::new(observer));
    }

    pub fn clear_response_observer(&self) {
        self.shared
            .response_observer
            .lock()
            .expect("observer lock poisoned")
            .take();
    }

    fn cancel_feedback(&self) {
        let cancel = self
            .shared
            .feedback_cancel
            .lock()
            .expect("feedback cancel lock poisoned")
            .take();
        if let Some(cancel) = cancel {
            cancel.notify_one();
        }
    }
}

fn unix_seconds(time: SystemTime) -> u32 {
    // The wire field is a u32 of whole seconds; out-of-range values clamp.
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_seconds_truncates_and_clamps() {
        assert_eq!(unix_seconds(UNIX_EPOCH), 0);
        assert_eq!(
            unix_seconds(UNIX_EPOCH + Duration::from_millis(2_000_000_000_750)),
            2_000_000_000
        );
        // Pre-epoch and post-2106 times clamp to the field's range.
        assert_eq!(unix_seconds(UNIX_EPOCH - Duration::from_secs(5)), 0);
        assert_eq!(
            unix_seconds(UNIX_EPOCH + Duration::from_secs(u64::from(u32::MAX) + 10)),
            u32::MAX
        );
    }
}
