//! The status monitor: a single actor owning the canonical `Status`.
//! Every mutation and read goes through its channels, so no lock guards
//! the tracker. Idle waiters are only released inside the loop body,
//! where `idle()` has just been evaluated against the current tracker,
//! which is what rules out missed wakeups.

use crate::error::ProcError;
use crate::mq;
use crate::request::Request;
use crate::status::Status;
use broker::{Connection, MessageHandler};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    changer: MessageHandler,
    loader: MessageHandler,
    waiter: MessageHandler,
}

/// Starts the monitor against the broker at `uri` and returns its
/// shutdown handle.
pub fn start(uri: &str) -> Result<MonitorHandle, ProcError> {
    let conn = Connection::open(uri)?;
    let (status_tx, status_rx) = mpsc::channel(8);
    let (request_tx, request_rx) = mpsc::channel(64);
    let (idle_tx, idle_rx) = mpsc::channel(8);
    let changer = mq::new_changer(&conn, request_tx)?;
    let loader = mq::new_loader(&conn, status_tx)?;
    let waiter = mq::new_waiter(&conn, idle_tx)?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(status_rx, request_rx, idle_rx, stop_rx));
    Ok(MonitorHandle {
        stop_tx,
        task,
        changer,
        loader,
        waiter,
    })
}

async fn run(
    mut status_rx: mpsc::Receiver<oneshot::Sender<Status>>,
    mut request_rx: mpsc::Receiver<Request>,
    mut idle_rx: mpsc::Receiver<oneshot::Sender<()>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut status = Status::new();
    let mut waiting: Vec<oneshot::Sender<()>> = Vec::new();
    loop {
        if !waiting.is_empty() && status.idle() {
            for release in waiting.drain(..) {
                let _ = release.send(());
            }
        }
        tokio::select! {
            _ = stop_rx.changed() => break,
            Some(reply) = status_rx.recv() => {
                let _ = reply.send(status.clone());
            }
            Some(r) = request_rx.recv() => {
                // Domain errors here mean duplicate delivery; tolerated.
                if let Err(e) = status.update(&r) {
                    log::warn!("status update rejected: {}", e);
                }
            }
            Some(release) = idle_rx.recv() => waiting.push(release),
            else => break,
        }
    }
}

impl MonitorHandle {
    /// Stops the monitor loop, then the changer, loader and waiter
    /// handlers in that order, propagating the first error.
    pub async fn shutdown(self) -> Result<(), ProcError> {
        let _ = self.stop_tx.send(true);
        // Ending the loop drops the channel receivers, which unblocks any
        // consumer mid-registration before its handler is stopped.
        let _ = self.task.await;
        self.changer.shutdown().await?;
        self.loader.shutdown().await?;
        self.waiter.shutdown().await?;
        Ok(())
    }
}
