// Dispatch queue worker: the single writer on the gateway session.
//
// The worker consumes the bounded queue, opens the gateway session lazily
// when a frame arrives, keeps it warm while traffic keeps coming, and
// closes it after the idle timeout. Frames that fail to send land on the
// requeue list, which is always consumed ahead of the channel.
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use courier_transport::TlsSession;
use courier_wire::{RESPONSE_LEN, decode_response};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::service::Shared;
use crate::config::{RECONNECT_DELAY, RESIDUAL_READ_TIMEOUT};

pub(crate) struct Notification {
    pub(crate) identifier: u32,
    pub(crate) frame: Bytes,
}

pub(crate) enum DispatchCommand {
    Frame(Notification),
    Shutdown { done: oneshot::Sender<()> },
}

/// Gateway session tagged with the configuration generation it was opened
/// under; a stale tag means `configure` replaced the transport since.
struct GatewaySession {
    session: TlsSession,
    generation: u64,
}

enum Next {
    Frame(Notification),
    Idle,
    Shutdown(Option<oneshot::Sender<()>>),
}

enum SendFailure {
    Connect,
    Write,
}

pub(crate) async fn run_dispatch_worker(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<DispatchCommand>,
) {
    info!("dispatch worker started");
    let mut requeue: VecDeque<Notification> = VecDeque::new();
    let mut session: Option<GatewaySession> = None;

    'outer: loop {
        // Block until a frame arrives; requeued frames go first.
        let mut frame = match next(&mut requeue, &mut rx, None).await {
            Next::Frame(frame) => frame,
            Next::Idle => continue 'outer,
            Next::Shutdown(done) => {
                flush_and_close(&shared, &mut session, &mut requeue, &mut rx).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
                break 'outer;
            }
        };

        // Dispatch burst: send over one session until idle or failure.
        let mut pace_reconnect = false;
        loop {
            match send_frame(&shared, &mut session, &frame).await {
                Ok(()) => {
                    debug!(identifier = frame.identifier, "notification sent");
                    match next(&mut requeue, &mut rx, Some(shared.idle_timeout)).await {
                        Next::Frame(next_frame) => frame = next_frame,
                        Next::Idle => {
                            debug!("idle timeout reached; closing gateway session");
                            break;
                        }
                        Next::Shutdown(done) => {
                            flush_and_close(&shared, &mut session, &mut requeue, &mut rx)
                                .await;
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                            break 'outer;
                        }
                    }
                }
                Err(failure) => {
                    // Failed frames retry ahead of everything newer.
                    requeue.push_front(frame);
                    pace_reconnect = matches!(failure, SendFailure::Connect);
                    break;
                }
            }
        }
        close_session(&shared, &mut session).await;
        if pace_reconnect {
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
    info!("dispatch worker stopped");
}

async fn next(
    requeue: &mut VecDeque<Notification>,
    rx: &mut mpsc::Receiver<DispatchCommand>,
    idle: Option<Duration>,
) -> Next {
    if let Some(frame) = requeue.pop_front() {
        return Next::Frame(frame);
    }
    let received = match idle {
        Some(idle) => match timeout(idle, rx.recv()).await {
            Ok(received) => received,
            Err(_) => return Next::Idle,
        },
        None => rx.recv().await,
    };
    match received {
        Some(DispatchCommand::Frame(frame)) => Next::Frame(frame),
        Some(DispatchCommand::Shutdown { done }) => Next::Shutdown(Some(done)),
        // All senders gone: the client value was dropped.
        None => Next::Shutdown(None),
    }
}

/// Ensure a fresh session and write one frame. Failures are logged here;
/// the caller owns requeueing.
async fn send_frame(
    shared: &Shared,
    session: &mut Option<GatewaySession>,
    frame: &Notification,
) -> Result<(), SendFailure> {
    if let Some(open) = session.as_ref()
        && open.generation != shared.generation.load(Ordering::SeqCst)
    {
        debug!("configuration changed; closing stale gateway session");
        close_session(shared, session).await;
    }
    if session.is_none() {
        let (transport, endpoint, generation) = shared.gateway_snapshot();
        match transport.connect(&endpoint).await {
            Ok(tls) => {
                info!(endpoint = %endpoint, "connected to gateway");
                *session = Some(GatewaySession {
                    session: tls,
                    generation,
                });
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "gateway connect failed");
                return Err(SendFailure::Connect);
            }
        }
    }
    let open = session.as_mut().expect("session ensured above");
    if let Err(err) = open.session.write_all(&frame.frame).await {
        warn!(
            identifier = frame.identifier,
            error = %err,
            "notification send failed; requeueing"
        );
        return Err(SendFailure::Write);
    }
    Ok(())
}

/// Tear the session down, first picking any residual error frame out of
/// the socket. The gateway sends at most one 6-byte response and then
/// closes, so close time is the one place to look for it.
async fn close_session(shared: &Shared, session: &mut Option<GatewaySession>) {
    let Some(mut open) = session.take() else {
        return;
    };
    drain_response(shared, &mut open.session).await;
    open.session.close().await;
    info!("disconnected from gateway");
}

async fn drain_response(shared: &Shared, session: &mut TlsSession) {
    let mut buf = [0u8; RESPONSE_LEN];
    let mut filled = 0;
    while filled < RESPONSE_LEN {
        match timeout(RESIDUAL_READ_TIMEOUT, session.read(&mut buf[filled..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(read)) => filled += read,
            Ok(Err(err)) => {
                debug!(error = %err, "gateway read failed during close");
                break;
            }
        }
    }
    if filled == 0 {
        // Peer closed (or stayed silent) without an error frame.
        return;
    }
    if filled < RESPONSE_LEN {
        warn!(bytes = filled, "discarding short gateway response");
        return;
    }
    match decode_response(&buf) {
        Ok(response) => {
            info!(
                status = ?response.status,
                identifier = response.identifier,
                "gateway rejected notification"
            );
            shared.deliver_response(response);
        }
        Err(err) => warn!(error = %err, "discarding unrecognized gateway response"),
    }
}

/// Best-effort delivery of every frame already accepted into the queue
/// before the session goes away for good. Frames that cannot be delivered
/// are counted, never dropped silently.
async fn flush_and_close(
    shared: &Shared,
    session: &mut Option<GatewaySession>,
    requeue: &mut VecDeque<Notification>,
    rx: &mut mpsc::Receiver<DispatchCommand>,
) {
    while let Ok(command) = rx.try_recv() {
        if let DispatchCommand::Frame(frame) = command {
            requeue.push_back(frame);
        }
    }
    let mut undelivered = 0usize;
    while let Some(frame) = requeue.pop_front() {
        if send_frame(shared, session, &frame).await.is_err() {
            undelivered = requeue.len() + 1;
            requeue.clear();
            break;
        }
        debug!(identifier = frame.identifier, "notification sent during shutdown flush");
    }
    if undelivered > 0 {
        warn!(undelivered, "shutdown flush abandoned undeliverable notifications");
    }
    close_session(shared, session).await;
}
