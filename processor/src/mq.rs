//! Processor-side transport wiring: the queue/exchange topology, the
//! consumers that feed the server and monitor, and the public helpers
//! submitters use to drive the pipeline.

use crate::error::ProcError;
use crate::request::Request;
use crate::status::Status;
use async_trait::async_trait;
use broker::{
    Channel, Connection, Consume, Delivery, ExchangeKind, HandlerArgs, MessageHandler, Producer,
    bind, new_producer, new_receive_producer,
};
use db::{Oid, Store};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub const SUBMISSION_EXCHANGE: &str = "submission_exchange";
pub const CHANGE_EXCHANGE: &str = "change_exchange";
pub const STATUS_EXCHANGE: &str = "status_exchange";

pub const SUBMISSION_KEY: &str = "submission_key";
pub const SUBMISSION_QUEUE: &str = "submission_queue";
pub const REDO_KEY: &str = "redo_key";
pub const REDO_QUEUE: &str = "redo_queue";
pub const CHANGE_KEY: &str = "change_key";
pub const CHANGE_QUEUE: &str = "change_queue";
pub const STATUS_REQUEST_KEY: &str = "status_request_key";
pub const STATUS_RESPONSE_KEY: &str = "status_response_key";
pub const STATUS_QUEUE: &str = "status_queue";
pub const WAIT_REQUEST_KEY: &str = "wait_request_key";
pub const WAIT_RESPONSE_KEY: &str = "wait_response_key";
pub const WAIT_QUEUE: &str = "wait_queue";

pub fn file_key(sub_id: &Oid) -> String {
    format!("file_key_{}", sub_id.hex())
}

pub fn file_queue(sub_id: &Oid) -> String {
    format!("file_queue_{}", sub_id.hex())
}

/// Forwards decoded, validated requests from the shared submission queue
/// into the server's request channel. Malformed messages error out here
/// and are acknowledged and dropped by the handler loop.
pub(crate) struct Submitter {
    request_tx: mpsc::Sender<Request>,
}

#[async_trait]
impl Consume for Submitter {
    type Error = ProcError;

    async fn consume(&mut self, d: &Delivery, _chan: &Channel) -> Result<(), ProcError> {
        let r = Request::decode(d.body())?;
        r.valid()?;
        self.request_tx
            .send(r)
            .await
            .map_err(|_| ProcError::ChannelClosed)
    }
}

/// Per-submission consumer on `file_queue_<sid>`; same forwarding
/// behavior as the submitter, scoped to one submission's events.
pub(crate) struct Filer {
    request_tx: mpsc::Sender<Request>,
}

#[async_trait]
impl Consume for Filer {
    type Error = ProcError;

    async fn consume(&mut self, d: &Delivery, _chan: &Channel) -> Result<(), ProcError> {
        let r = Request::decode(d.body())?;
        r.valid()?;
        self.request_tx
            .send(r)
            .await
            .map_err(|_| ProcError::ChannelClosed)
    }
}

/// Feeds replayed requests from the redo queue into the server.
pub(crate) struct Redoer {
    request_tx: mpsc::Sender<Request>,
}

#[async_trait]
impl Consume for Redoer {
    type Error = ProcError;

    async fn consume(&mut self, d: &Delivery, _chan: &Channel) -> Result<(), ProcError> {
        let r = Request::decode(d.body())?;
        r.valid()?;
        self.request_tx
            .send(r)
            .await
            .map_err(|_| ProcError::ChannelClosed)
    }
}

/// Applies status-change requests to the monitor.
pub(crate) struct Changer {
    request_tx: mpsc::Sender<Request>,
}

#[async_trait]
impl Consume for Changer {
    type Error = ProcError;

    async fn consume(&mut self, d: &Delivery, _chan: &Channel) -> Result<(), ProcError> {
        let r = Request::decode(d.body())?;
        r.valid()?;
        self.request_tx
            .send(r)
            .await
            .map_err(|_| ProcError::ChannelClosed)
    }
}

/// Answers status queries with a snapshot from the monitor.
pub(crate) struct Loader {
    status_tx: mpsc::Sender<oneshot::Sender<Status>>,
}

#[async_trait]
impl Consume for Loader {
    type Error = ProcError;

    async fn consume(&mut self, d: &Delivery, chan: &Channel) -> Result<(), ProcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.status_tx
            .send(reply_tx)
            .await
            .map_err(|_| ProcError::ChannelClosed)?;
        let status = reply_rx.await.map_err(|_| ProcError::ChannelClosed)?;
        chan.reply(d, &serde_json::to_vec(&status)?)?;
        Ok(())
    }
}

/// Registers idle waiters with the monitor and replies only once the
/// monitor releases them. Handles one delivery at a time, so concurrent
/// wait requests queue on the broker until this one is released.
pub(crate) struct Waiter {
    idle_tx: mpsc::Sender<oneshot::Sender<()>>,
}

#[async_trait]
impl Consume for Waiter {
    type Error = ProcError;

    async fn consume(&mut self, d: &Delivery, chan: &Channel) -> Result<(), ProcError> {
        let (release_tx, release_rx) = oneshot::channel();
        self.idle_tx
            .send(release_tx)
            .await
            .map_err(|_| ProcError::ChannelClosed)?;
        release_rx.await.map_err(|_| ProcError::ChannelClosed)?;
        chan.reply(d, &[])?;
        Ok(())
    }
}

pub(crate) fn new_submitter(
    conn: &Connection,
    request_tx: mpsc::Sender<Request>,
) -> Result<MessageHandler, ProcError> {
    Ok(bind(
        conn,
        HandlerArgs::new(SUBMISSION_EXCHANGE, SUBMISSION_QUEUE, SUBMISSION_KEY),
        Submitter { request_tx },
    )?)
}

pub(crate) fn new_redoer(
    conn: &Connection,
    request_tx: mpsc::Sender<Request>,
) -> Result<MessageHandler, ProcError> {
    Ok(bind(
        conn,
        HandlerArgs::new(SUBMISSION_EXCHANGE, REDO_QUEUE, REDO_KEY),
        Redoer { request_tx },
    )?)
}

pub(crate) fn new_filer(
    conn: &Connection,
    request_tx: mpsc::Sender<Request>,
    sub_id: &Oid,
) -> Result<MessageHandler, ProcError> {
    let mut args = HandlerArgs::new(SUBMISSION_EXCHANGE, &file_queue(sub_id), &file_key(sub_id));
    args.auto_delete = true;
    Ok(bind(conn, args, Filer { request_tx })?)
}

pub(crate) fn new_changer(
    conn: &Connection,
    request_tx: mpsc::Sender<Request>,
) -> Result<MessageHandler, ProcError> {
    let mut args = HandlerArgs::new(CHANGE_EXCHANGE, CHANGE_QUEUE, CHANGE_KEY);
    args.kind = ExchangeKind::Fanout;
    Ok(bind(conn, args, Changer { request_tx })?)
}

pub(crate) fn new_loader(
    conn: &Connection,
    status_tx: mpsc::Sender<oneshot::Sender<Status>>,
) -> Result<MessageHandler, ProcError> {
    Ok(bind(
        conn,
        HandlerArgs::new(STATUS_EXCHANGE, STATUS_QUEUE, STATUS_REQUEST_KEY),
        Loader { status_tx },
    )?)
}

pub(crate) fn new_waiter(
    conn: &Connection,
    idle_tx: mpsc::Sender<oneshot::Sender<()>>,
) -> Result<MessageHandler, ProcError> {
    Ok(bind(
        conn,
        HandlerArgs::new(STATUS_EXCHANGE, WAIT_QUEUE, WAIT_REQUEST_KEY),
        Waiter { idle_tx },
    )?)
}

fn status_changer(uri: &str) -> Result<Arc<Producer>, ProcError> {
    Ok(new_producer(
        "status_changer",
        uri,
        CHANGE_EXCHANGE,
        ExchangeKind::Fanout,
        CHANGE_QUEUE,
        CHANGE_KEY,
        false,
    )?)
}

fn submission_producer(uri: &str) -> Result<Arc<Producer>, ProcError> {
    Ok(new_producer(
        "submission_producer",
        uri,
        SUBMISSION_EXCHANGE,
        ExchangeKind::Direct,
        SUBMISSION_QUEUE,
        SUBMISSION_KEY,
        false,
    )?)
}

fn redo_producer(uri: &str) -> Result<Arc<Producer>, ProcError> {
    Ok(new_producer(
        "redo_producer",
        uri,
        SUBMISSION_EXCHANGE,
        ExchangeKind::Direct,
        REDO_QUEUE,
        REDO_KEY,
        false,
    )?)
}

fn file_producer(uri: &str, sub_id: &Oid) -> Result<Arc<Producer>, ProcError> {
    Ok(new_producer(
        &format!("file_producer_{}", sub_id.hex()),
        uri,
        SUBMISSION_EXCHANGE,
        ExchangeKind::Direct,
        &file_queue(sub_id),
        &file_key(sub_id),
        true,
    )?)
}

/// Reports a processing status change to the monitor.
pub fn change_status(uri: &str, r: &Request) -> Result<(), ProcError> {
    r.valid()?;
    status_changer(uri)?.produce(&r.encode()?)?;
    Ok(())
}

/// Announces that a submission will start receiving files.
pub fn start_submission(uri: &str, sub_id: &Oid) -> Result<(), ProcError> {
    let r = Request::start_submission(*sub_id);
    submission_producer(uri)?.produce(&r.encode()?)?;
    Ok(())
}

/// Routes a stored file into its submission's queue. Files the pipeline
/// does not process (launch records) are silently skipped.
pub fn add_file(uri: &str, file: &db::File) -> Result<(), ProcError> {
    if !file.can_process() {
        return Ok(());
    }
    let r = Request::add_file(file.sub_id, file.id);
    file_producer(uri, &file.sub_id)?.produce(&r.encode()?)?;
    Ok(())
}

/// Signals that a submission will receive no more files. Travels on the
/// submission's own queue so it is ordered after its file events.
pub fn end_submission(uri: &str, sub_id: &Oid) -> Result<(), ProcError> {
    let r = Request::stop_submission(*sub_id);
    file_producer(uri, sub_id)?.produce(&r.encode()?)?;
    Ok(())
}

/// Replays every stored file of a submission through the pipeline.
/// Results already recorded under a tool's name are skipped by the
/// worker, so a redo only does the missing work.
pub async fn redo_submission(uri: &str, store: &dyn Store, sub_id: &Oid) -> Result<(), ProcError> {
    let files = store.files(sub_id).await?;
    let producer = redo_producer(uri)?;
    producer.produce(&Request::start_submission(*sub_id).encode()?)?;
    for f in files.iter().filter(|f| f.can_process()) {
        producer.produce(&Request::add_file(f.sub_id, f.id).encode()?)?;
    }
    producer.produce(&Request::stop_submission(*sub_id).encode()?)?;
    Ok(())
}

/// Fetches a snapshot of the global processing status.
pub async fn get_status(uri: &str) -> Result<Status, ProcError> {
    let retriever = new_receive_producer(
        "status_retriever",
        uri,
        STATUS_EXCHANGE,
        STATUS_QUEUE,
        STATUS_REQUEST_KEY,
        STATUS_RESPONSE_KEY,
    )?;
    let reply = retriever.receive_produce(&[]).await?;
    Ok(serde_json::from_slice(&reply)?)
}

/// Blocks until the monitor observes a globally idle pipeline.
pub async fn wait_idle(uri: &str) -> Result<(), ProcError> {
    let waiter = new_receive_producer(
        "status_waiter",
        uri,
        STATUS_EXCHANGE,
        WAIT_QUEUE,
        WAIT_REQUEST_KEY,
        WAIT_RESPONSE_KEY,
    )?;
    waiter.receive_produce(&[]).await?;
    Ok(())
}

/// Tears down every cached producer.
pub fn stop_producers() -> Result<(), ProcError> {
    broker::stop_producers()?;
    Ok(())
}
