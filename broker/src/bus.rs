//! In-process bus with broker semantics: exchanges route by key, queues
//! hold messages until a consumer acknowledges them, unacknowledged
//! deliveries are requeued. One bus exists per connection URI.

use crate::error::BrokerError;
use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

/// Options for `Channel::queue_declare`. Durability is the default; the
/// exclusive auto-named form is what receive-producers use for replies.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

/// An outbound message. `persistent` mirrors the delivery mode a durable
/// broker would honour.
#[derive(Debug, Clone, Default)]
pub struct Publishing {
    pub body: Vec<u8>,
    pub correlation_id: String,
    pub reply_to: String,
    pub persistent: bool,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    correlation_id: String,
    reply_to: String,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct QueueState {
    name: String,
    auto_delete: bool,
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
    consumers: AtomicUsize,
}

impl QueueState {
    fn push(&self, m: Message) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.messages
            .lock()
            .expect("queue lock poisoned")
            .push_back(m);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct ExchangeState {
    kind: ExchangeKind,
    // (binding key, queue name)
    bindings: Mutex<Vec<(String, String)>>,
}

/// The bus itself: every queue and exchange declared against one URI.
pub struct Bus {
    exchanges: Mutex<HashMap<String, Arc<ExchangeState>>>,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
}

impl Bus {
    fn new() -> Self {
        Bus {
            exchanges: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut exchanges = self.exchanges.lock().expect("bus lock poisoned");
        if let Some(existing) = exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::ExchangeMismatch(name.to_string()));
            }
            return Ok(());
        }
        exchanges.insert(
            name.to_string(),
            Arc::new(ExchangeState {
                kind,
                bindings: Mutex::new(Vec::new()),
            }),
        );
        Ok(())
    }

    fn declare_queue(&self, name: &str, opts: QueueOptions) -> String {
        let name = if name.is_empty() {
            format!("gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let mut queues = self.queues.lock().expect("bus lock poisoned");
        queues.entry(name.clone()).or_insert_with(|| {
            Arc::new(QueueState {
                name: name.clone(),
                auto_delete: opts.auto_delete,
                messages: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                consumers: AtomicUsize::new(0),
            })
        });
        name
    }

    fn bind_queue(&self, queue: &str, key: &str, exchange: &str) -> Result<(), BrokerError> {
        {
            let queues = self.queues.lock().expect("bus lock poisoned");
            if !queues.contains_key(queue) {
                return Err(BrokerError::NoQueue(queue.to_string()));
            }
        }
        let exchanges = self.exchanges.lock().expect("bus lock poisoned");
        let ex = exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NoExchange(exchange.to_string()))?;
        let mut bindings = ex.bindings.lock().expect("bus lock poisoned");
        let entry = (key.to_string(), queue.to_string());
        if !bindings.contains(&entry) {
            bindings.push(entry);
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, key: &str, p: Publishing) -> Result<(), BrokerError> {
        let ex = {
            let exchanges = self.exchanges.lock().expect("bus lock poisoned");
            exchanges
                .get(exchange)
                .cloned()
                .ok_or_else(|| BrokerError::NoExchange(exchange.to_string()))?
        };
        let targets: Vec<String> = {
            let bindings = ex.bindings.lock().expect("bus lock poisoned");
            bindings
                .iter()
                .filter(|(k, _)| ex.kind == ExchangeKind::Fanout || k == key)
                .map(|(_, q)| q.clone())
                .collect()
        };
        if targets.is_empty() {
            log::debug!("message on {}/{} had no bound queue", exchange, key);
            return Ok(());
        }
        let queues = self.queues.lock().expect("bus lock poisoned");
        for name in targets {
            if let Some(q) = queues.get(&name) {
                q.push(Message {
                    body: p.body.clone(),
                    correlation_id: p.correlation_id.clone(),
                    reply_to: p.reply_to.clone(),
                    exchange: exchange.to_string(),
                    routing_key: key.to_string(),
                    redelivered: false,
                });
            }
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueState>, BrokerError> {
        let queues = self.queues.lock().expect("bus lock poisoned");
        queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::NoQueue(name.to_string()))
    }

    fn delete_queue(&self, name: &str) {
        let removed = {
            let mut queues = self.queues.lock().expect("bus lock poisoned");
            queues.remove(name)
        };
        if let Some(q) = removed {
            q.close();
            let exchanges = self.exchanges.lock().expect("bus lock poisoned");
            for ex in exchanges.values() {
                ex.bindings
                    .lock()
                    .expect("bus lock poisoned")
                    .retain(|(_, queue)| queue != name);
            }
        }
    }
}

static BUSES: Lazy<Mutex<HashMap<String, Arc<Bus>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Handle to the bus behind a URI. Opening the same URI twice yields the
/// same underlying bus.
#[derive(Clone)]
pub struct Connection {
    bus: Arc<Bus>,
    uri: String,
}

impl Connection {
    pub fn open(uri: &str) -> Result<Connection, BrokerError> {
        if uri.is_empty() {
            return Err(BrokerError::InvalidUri(uri.to_string()));
        }
        let mut buses = BUSES.lock().expect("bus registry poisoned");
        let bus = buses
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(Bus::new()))
            .clone();
        Ok(Connection {
            bus,
            uri: uri.to_string(),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn channel(&self) -> Channel {
        Channel {
            bus: self.bus.clone(),
        }
    }
}

/// A lightweight publishing/consuming handle, mirroring a broker channel.
#[derive(Clone)]
pub struct Channel {
    bus: Arc<Bus>,
}

impl Channel {
    pub fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.bus.declare_exchange(name, kind)
    }

    /// Declares a queue, returning its name. An empty name yields a
    /// generated one (the exclusive reply-queue pattern).
    pub fn queue_declare(&self, name: &str, opts: QueueOptions) -> Result<String, BrokerError> {
        Ok(self.bus.declare_queue(name, opts))
    }

    pub fn queue_bind(&self, queue: &str, key: &str, exchange: &str) -> Result<(), BrokerError> {
        self.bus.bind_queue(queue, key, exchange)
    }

    pub fn publish(&self, exchange: &str, key: &str, p: Publishing) -> Result<(), BrokerError> {
        self.bus.publish(exchange, key, p)
    }

    /// Registers a competing consumer on a queue.
    pub fn consume(&self, queue: &str, tag: &str) -> Result<QueueConsumer, BrokerError> {
        let state = self.bus.queue(queue)?;
        state.consumers.fetch_add(1, Ordering::AcqRel);
        Ok(QueueConsumer {
            state,
            bus: self.bus.clone(),
            tag: tag.to_string(),
        })
    }

    /// Publishes a response to a delivery's reply queue, carrying its
    /// correlation id.
    pub fn reply(&self, d: &Delivery, body: &[u8]) -> Result<(), BrokerError> {
        self.bus.publish(
            d.exchange(),
            d.reply_to(),
            Publishing {
                body: body.to_vec(),
                correlation_id: d.correlation_id().to_string(),
                reply_to: String::new(),
                persistent: true,
            },
        )
    }

    pub fn delete_queue(&self, name: &str) {
        self.bus.delete_queue(name);
    }
}

/// One registered consumer. Dropping it cancels the registration; if the
/// queue was declared auto-delete and no consumers remain, the queue is
/// removed.
pub struct QueueConsumer {
    state: Arc<QueueState>,
    bus: Arc<Bus>,
    tag: String,
}

impl QueueConsumer {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The next delivery, or `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut messages = self.state.messages.lock().expect("queue lock poisoned");
                if let Some(m) = messages.pop_front() {
                    return Some(Delivery {
                        msg: Some(m),
                        pending: Some(self.state.clone()),
                    });
                }
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        let remaining = self.state.consumers.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.state.auto_delete {
            self.bus.delete_queue(&self.state.name);
        }
    }
}

/// A message handed to a consumer. Must be acknowledged with `ack`;
/// dropping it unacknowledged requeues it (at-least-once delivery).
pub struct Delivery {
    msg: Option<Message>,
    pending: Option<Arc<QueueState>>,
}

impl Delivery {
    pub fn body(&self) -> &[u8] {
        &self.msg.as_ref().expect("delivery already consumed").body
    }

    pub fn correlation_id(&self) -> &str {
        &self
            .msg
            .as_ref()
            .expect("delivery already consumed")
            .correlation_id
    }

    pub fn reply_to(&self) -> &str {
        &self.msg.as_ref().expect("delivery already consumed").reply_to
    }

    pub fn exchange(&self) -> &str {
        &self.msg.as_ref().expect("delivery already consumed").exchange
    }

    pub fn routing_key(&self) -> &str {
        &self
            .msg
            .as_ref()
            .expect("delivery already consumed")
            .routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.msg
            .as_ref()
            .expect("delivery already consumed")
            .redelivered
    }

    pub fn ack(mut self) {
        self.pending = None;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let (Some(q), Some(mut m)) = (self.pending.take(), self.msg.take()) {
            m.redelivered = true;
            q.push(m);
        }
    }
}
