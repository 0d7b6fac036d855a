// One-shot drain of the feedback service's record stream.
use std::collections::HashMap;
use std::sync::Arc;

use courier_transport::TlsSession;
use courier_wire::{DeviceToken, FeedbackParser};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::client::service::Shared;

pub(crate) type UnreachableObserver = Box<dyn FnOnce(HashMap<DeviceToken, u32>) + Send>;

/// Read the feedback stream until the peer closes it (or the drain is
/// cancelled), then hand the observer the collected map exactly once.
/// Runs on its own task, so the observer never executes on the caller or
/// on the dispatch worker.
pub(crate) async fn run_feedback_drain(
    shared: Arc<Shared>,
    mut session: TlsSession,
    cancel: Arc<Notify>,
    observer: UnreachableObserver,
) {
    debug!(endpoint = %session.endpoint(), "feedback drain started");
    let mut parser = FeedbackParser::new();
    let mut devices: HashMap<DeviceToken, u32> = HashMap::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = tokio::select! {
            _ = cancel.notified() => {
                debug!("feedback drain aborted");
                break;
            }
            read = session.read(&mut buf) => read,
        };
        match read {
            // The peer finished dumping its queue.
            Ok(0) => break,
            Ok(read) => match parser.feed(&buf[..read]) {
                Ok(records) => {
                    for record in records {
                        info!(
                            token = %record.token,
                            timestamp = record.timestamp,
                            "device reported unreachable"
                        );
                        let entry = devices.entry(record.token).or_insert(record.timestamp);
                        // The earliest observation wins on duplicates.
                        if record.timestamp < *entry {
                            *entry = record.timestamp;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "malformed feedback stream; stopping drain");
                    break;
                }
            },
            Err(err) => {
                warn!(error = %err, "feedback read failed");
                break;
            }
        }
    }
    if parser.pending() > 0 {
        warn!(bytes = parser.pending(), "not all feedback bytes were consumed");
    }
    session.close().await;
    shared.finish_feedback();
    debug!(devices = devices.len(), "feedback drain complete");
    observer(devices);
}
