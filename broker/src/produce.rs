use crate::bus::{Channel, Connection, ExchangeKind, Publishing, QueueOptions};
use crate::error::BrokerError;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

static PRODUCERS: Lazy<Mutex<HashMap<String, Arc<Producer>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static RECEIVERS: Lazy<Mutex<HashMap<String, Arc<ReceiveProducer>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn cache_key(uri: &str, name: &str) -> String {
    format!("{}#{}", uri, name)
}

/// Fire-and-forget publisher bound to one exchange and routing key.
pub struct Producer {
    chan: Channel,
    exchange: String,
    publish_key: String,
}

impl Producer {
    pub fn produce(&self, body: &[u8]) -> Result<(), BrokerError> {
        self.chan.publish(
            &self.exchange,
            &self.publish_key,
            Publishing {
                body: body.to_vec(),
                correlation_id: String::new(),
                reply_to: String::new(),
                persistent: true,
            },
        )
    }
}

/// Creates (or reuses) the producer registered under `name` for `uri`.
/// Declares the exchange, and binds `queue` to `publish_key` when a queue
/// name is given.
pub fn new_producer(
    name: &str,
    uri: &str,
    exchange: &str,
    kind: ExchangeKind,
    queue: &str,
    publish_key: &str,
    auto_delete: bool,
) -> Result<Arc<Producer>, BrokerError> {
    let key = cache_key(uri, name);
    {
        let producers = PRODUCERS.lock().expect("producer cache poisoned");
        if let Some(p) = producers.get(&key) {
            return Ok(p.clone());
        }
    }
    let conn = Connection::open(uri)?;
    let chan = conn.channel();
    chan.exchange_declare(exchange, kind)?;
    if !queue.is_empty() {
        let q = chan.queue_declare(
            queue,
            QueueOptions {
                durable: true,
                auto_delete,
                exclusive: false,
            },
        )?;
        chan.queue_bind(&q, publish_key, exchange)?;
    }
    let p = Arc::new(Producer {
        chan,
        exchange: exchange.to_string(),
        publish_key: publish_key.to_string(),
    });
    PRODUCERS
        .lock()
        .expect("producer cache poisoned")
        .insert(key, p.clone());
    Ok(p)
}

/// Request/response over the bus: publishes with a fresh correlation id
/// and an exclusive reply queue, then blocks until the matching reply
/// arrives.
pub struct ReceiveProducer {
    chan: Channel,
    exchange: String,
    publish_key: String,
    binding_key: String,
    reply_queue: String,
}

impl ReceiveProducer {
    pub async fn receive_produce(&self, body: &[u8]) -> Result<Vec<u8>, BrokerError> {
        let cid = Uuid::new_v4().to_string();
        let tag = Uuid::new_v4().to_string();
        let consumer = self.chan.consume(&self.reply_queue, &tag)?;
        self.chan.publish(
            &self.exchange,
            &self.publish_key,
            Publishing {
                body: body.to_vec(),
                correlation_id: cid.clone(),
                reply_to: self.binding_key.clone(),
                persistent: true,
            },
        )?;
        while let Some(d) = consumer.next().await {
            if d.correlation_id() == cid {
                let reply = d.body().to_vec();
                d.ack();
                return Ok(reply);
            }
            // Another caller's reply: requeue it and yield so its owner
            // gets a chance to consume.
            drop(d);
            tokio::task::yield_now().await;
        }
        Err(BrokerError::Canceled)
    }
}

/// Creates (or reuses) the receive-producer registered under `name`.
/// Declares the request queue bound to `publish_key` and an exclusive
/// auto-named reply queue bound to `binding_key`.
pub fn new_receive_producer(
    name: &str,
    uri: &str,
    exchange: &str,
    queue: &str,
    publish_key: &str,
    binding_key: &str,
) -> Result<Arc<ReceiveProducer>, BrokerError> {
    let key = cache_key(uri, name);
    {
        let receivers = RECEIVERS.lock().expect("receiver cache poisoned");
        if let Some(r) = receivers.get(&key) {
            return Ok(r.clone());
        }
    }
    let conn = Connection::open(uri)?;
    let chan = conn.channel();
    chan.exchange_declare(exchange, ExchangeKind::Direct)?;
    if !queue.is_empty() {
        let q = chan.queue_declare(queue, QueueOptions::default())?;
        chan.queue_bind(&q, publish_key, exchange)?;
    }
    // Exclusive and non-durable, but not auto-delete: the queue must
    // outlive the short-lived consumer each receive_produce registers.
    let reply_queue = chan.queue_declare(
        "",
        QueueOptions {
            durable: false,
            auto_delete: false,
            exclusive: true,
        },
    )?;
    chan.queue_bind(&reply_queue, binding_key, exchange)?;
    let r = Arc::new(ReceiveProducer {
        chan,
        exchange: exchange.to_string(),
        publish_key: publish_key.to_string(),
        binding_key: binding_key.to_string(),
        reply_queue,
    });
    RECEIVERS
        .lock()
        .expect("receiver cache poisoned")
        .insert(key, r.clone());
    Ok(r)
}

/// Tears down every cached producer and receive-producer.
pub fn stop_producers() -> Result<(), BrokerError> {
    let mut producers = PRODUCERS.lock().expect("producer cache poisoned");
    producers.clear();
    let mut receivers = RECEIVERS.lock().expect("receiver cache poisoned");
    for r in receivers.values() {
        r.chan.delete_queue(&r.reply_queue);
    }
    receivers.clear();
    Ok(())
}
