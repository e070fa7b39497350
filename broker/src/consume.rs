use crate::bus::{Channel, Connection, Delivery, ExchangeKind, QueueOptions};
use crate::error::BrokerError;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Message consumer logic. A failing `consume` drops the message: the
/// handler logs the error and acknowledges anyway, so malformed payloads
/// never loop back through the queue.
#[async_trait]
pub trait Consume: Send + 'static {
    type Error: std::fmt::Display + Send;

    async fn consume(&mut self, delivery: &Delivery, chan: &Channel) -> Result<(), Self::Error>;
}

/// Declarative topology for `bind`: exchange, queue and the keys the
/// queue is bound under.
#[derive(Debug, Clone)]
pub struct HandlerArgs {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: String,
    pub keys: Vec<String>,
    pub durable: bool,
    pub auto_delete: bool,
}

impl HandlerArgs {
    pub fn new(exchange: &str, queue: &str, key: &str) -> Self {
        HandlerArgs {
            exchange: exchange.to_string(),
            kind: ExchangeKind::Direct,
            queue: queue.to_string(),
            keys: vec![key.to_string()],
            durable: true,
            auto_delete: false,
        }
    }
}

/// A running consumer loop with a handle for cooperative shutdown.
pub struct MessageHandler {
    queue: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MessageHandler {
    /// Spawns the consume loop for `consumer` on `queue`.
    pub fn start<C: Consume>(chan: Channel, queue: String, consumer: C) -> MessageHandler {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let tag = Uuid::new_v4().to_string();
        let loop_queue = queue.clone();
        let mut consumer = consumer;
        let task = tokio::spawn(async move {
            let src = match chan.consume(&loop_queue, &tag) {
                Ok(src) => src,
                Err(e) => {
                    log::error!("cannot consume from {}: {}", loop_queue, e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    delivery = src.next() => match delivery {
                        Some(d) => {
                            if let Err(e) = consumer.consume(&d, &chan).await {
                                log::warn!("message on {} dropped: {}", loop_queue, e);
                            }
                            d.ack();
                        }
                        None => {
                            log::warn!("queue {} closed, consumer exiting", loop_queue);
                            break;
                        }
                    }
                }
            }
        });
        MessageHandler {
            queue,
            stop_tx,
            task,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Signals the loop to stop and waits for it to finish.
    pub async fn shutdown(self) -> Result<(), BrokerError> {
        let _ = self.stop_tx.send(true);
        self.task.await.map_err(|_| BrokerError::Canceled)
    }
}

/// Declares the topology in `args` and starts a handler on its queue.
pub fn bind<C: Consume>(
    conn: &Connection,
    args: HandlerArgs,
    consumer: C,
) -> Result<MessageHandler, BrokerError> {
    let chan = conn.channel();
    chan.exchange_declare(&args.exchange, args.kind)?;
    let queue = chan.queue_declare(
        &args.queue,
        QueueOptions {
            durable: args.durable,
            auto_delete: args.auto_delete,
            exclusive: false,
        },
    )?;
    for key in &args.keys {
        chan.queue_bind(&queue, key, &args.exchange)?;
    }
    Ok(MessageHandler::start(chan, queue, consumer))
}
