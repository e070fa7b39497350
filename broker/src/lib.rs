//! Message transport adapters.
//!
//! The adapters expose the shape a networked broker client would have:
//! named exchanges, durable queues with competing consumers and explicit
//! acknowledgment, cached fire-and-forget producers and correlation-id
//! request/response. Behind them sits an in-process bus keyed by
//! connection URI, so a real broker can replace `bus` without touching
//! any call site.

pub mod bus;
pub mod consume;
pub mod error;
pub mod produce;

pub use bus::{Channel, Connection, Delivery, ExchangeKind, Publishing, QueueConsumer, QueueOptions};
pub use consume::{Consume, HandlerArgs, MessageHandler, bind};
pub use error::BrokerError;
pub use produce::{Producer, ReceiveProducer, new_producer, new_receive_producer, stop_producers};
