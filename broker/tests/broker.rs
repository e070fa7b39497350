use broker::{
    Channel, Connection, Consume, Delivery, ExchangeKind, HandlerArgs, Publishing, QueueOptions,
    bind, new_producer, new_receive_producer,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

fn publishing(body: &[u8]) -> Publishing {
    Publishing {
        body: body.to_vec(),
        correlation_id: String::new(),
        reply_to: String::new(),
        persistent: true,
    }
}

#[tokio::test]
async fn test_direct_exchange_routes_by_key() {
    let conn = Connection::open("local://direct-routing").unwrap();
    let chan = conn.channel();
    chan.exchange_declare("ex", ExchangeKind::Direct).unwrap();
    let a = chan.queue_declare("qa", QueueOptions::default()).unwrap();
    let b = chan.queue_declare("qb", QueueOptions::default()).unwrap();
    chan.queue_bind(&a, "key_a", "ex").unwrap();
    chan.queue_bind(&b, "key_b", "ex").unwrap();

    chan.publish("ex", "key_a", publishing(b"for a")).unwrap();
    chan.publish("ex", "key_b", publishing(b"for b")).unwrap();

    let ca = chan.consume(&a, "t1").unwrap();
    let cb = chan.consume(&b, "t2").unwrap();
    let da = timeout(Duration::from_secs(1), ca.next()).await.unwrap().unwrap();
    let db = timeout(Duration::from_secs(1), cb.next()).await.unwrap().unwrap();
    assert_eq!(da.body(), b"for a");
    assert_eq!(db.body(), b"for b");
    da.ack();
    db.ack();
}

#[tokio::test]
async fn test_fanout_reaches_every_bound_queue() {
    let conn = Connection::open("local://fanout").unwrap();
    let chan = conn.channel();
    chan.exchange_declare("fan", ExchangeKind::Fanout).unwrap();
    let a = chan.queue_declare("fa", QueueOptions::default()).unwrap();
    let b = chan.queue_declare("fb", QueueOptions::default()).unwrap();
    chan.queue_bind(&a, "ignored_a", "fan").unwrap();
    chan.queue_bind(&b, "ignored_b", "fan").unwrap();

    chan.publish("fan", "anything", publishing(b"change")).unwrap();

    for q in [&a, &b] {
        let c = chan.consume(q, "t").unwrap();
        let d = timeout(Duration::from_secs(1), c.next()).await.unwrap().unwrap();
        assert_eq!(d.body(), b"change");
        d.ack();
    }
}

#[tokio::test]
async fn test_unacked_delivery_is_requeued() {
    let conn = Connection::open("local://requeue").unwrap();
    let chan = conn.channel();
    chan.exchange_declare("ex", ExchangeKind::Direct).unwrap();
    let q = chan.queue_declare("rq", QueueOptions::default()).unwrap();
    chan.queue_bind(&q, "k", "ex").unwrap();
    chan.publish("ex", "k", publishing(b"once")).unwrap();

    let c = chan.consume(&q, "t").unwrap();
    let d = timeout(Duration::from_secs(1), c.next()).await.unwrap().unwrap();
    assert!(!d.redelivered());
    drop(d); // no ack

    let d = timeout(Duration::from_secs(1), c.next()).await.unwrap().unwrap();
    assert_eq!(d.body(), b"once");
    assert!(d.redelivered());
    d.ack();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_consumers_split_the_queue() {
    let conn = Connection::open("local://competing").unwrap();
    let chan = conn.channel();
    chan.exchange_declare("ex", ExchangeKind::Direct).unwrap();
    let q = chan.queue_declare("work", QueueOptions::default()).unwrap();
    chan.queue_bind(&q, "k", "ex").unwrap();

    let total = 20;
    let seen = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let consumer = chan.consume(&q, "t").unwrap();
        let seen = Arc::clone(&seen);
        tasks.push(tokio::spawn(async move {
            while let Ok(Some(d)) = timeout(Duration::from_millis(500), consumer.next()).await {
                d.ack();
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for i in 0..total {
        chan.publish("ex", "k", publishing(format!("m{}", i).as_bytes()))
            .unwrap();
    }
    futures::future::join_all(tasks).await;
    // Every message is consumed exactly once across the pool.
    assert_eq!(seen.load(Ordering::SeqCst), total);
}

struct Echo;

#[async_trait]
impl Consume for Echo {
    type Error = broker::BrokerError;

    async fn consume(&mut self, d: &Delivery, chan: &Channel) -> Result<(), Self::Error> {
        let mut reply = d.body().to_vec();
        reply.reverse();
        chan.reply(d, &reply)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_receive_produce_pairs_by_correlation_id() {
    let uri = "local://rpc";
    let conn = Connection::open(uri).unwrap();
    let handler = bind(&conn, HandlerArgs::new("rpc_ex", "rpc_q", "req"), Echo).unwrap();

    let rp = new_receive_producer("echo_caller", uri, "rpc_ex", "rpc_q", "req", "resp").unwrap();
    let mut calls = Vec::new();
    for i in 0..8u8 {
        let rp = rp.clone();
        calls.push(tokio::spawn(async move {
            let body = vec![i, i + 1, i + 2];
            let reply = rp.receive_produce(&body).await.unwrap();
            (body, reply)
        }));
    }
    for call in calls {
        let (body, reply) = call.await.unwrap();
        let mut expect = body.clone();
        expect.reverse();
        // Each concurrent caller gets its own answer back.
        assert_eq!(reply, expect);
    }
    handler.shutdown().await.unwrap();
}

struct Forward {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl Consume for Forward {
    type Error = broker::BrokerError;

    async fn consume(&mut self, d: &Delivery, _chan: &Channel) -> Result<(), Self::Error> {
        let _ = self.tx.send(d.body().to_vec()).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_producer_cache_is_idempotent() {
    let uri = "local://producer-cache";
    let p1 = new_producer("same", uri, "ex", ExchangeKind::Direct, "pq", "k", false).unwrap();
    let p2 = new_producer("same", uri, "ex", ExchangeKind::Direct, "pq", "k", false).unwrap();
    assert!(Arc::ptr_eq(&p1, &p2));

    let conn = Connection::open(uri).unwrap();
    let (tx, mut rx) = mpsc::channel(4);
    let handler = bind(&conn, HandlerArgs::new("ex", "pq", "k"), Forward { tx }).unwrap();

    p1.produce(b"hello").unwrap();
    let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, b"hello");
    handler.shutdown().await.unwrap();
}
