//! End-to-end pipeline tests against an in-memory broker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mailpipe::queue::{Delivery, Session};
use mailpipe::{
    Backoff, Broker, BrokerError, Connector, Consumer, MailRecord, MailStore, NotificationMessage,
    Phase, PublishError, Publisher, StoreError, MAIL_QUEUE,
};

#[derive(Default)]
struct QueueState {
    reachable: bool,
    publish_attempts: usize,
    messages: VecDeque<(u64, Vec<u8>)>,
    next_tag: u64,
    acked: Vec<u64>,
    rejected: Vec<u64>,
}

/// Single durable queue shared by publisher and consumer.
#[derive(Clone, Default)]
struct MemoryBroker {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryBroker {
    fn reachable() -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().reachable = true;
        broker
    }

    fn unreachable() -> Self {
        Self::default()
    }

    fn enqueue(&self, body: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_tag += 1;
        let tag = state.next_tag;
        state.messages.push_back((tag, body.as_bytes().to_vec()));
    }

    fn queued(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish_confirmed(
        &self,
        queue: &str,
        _message_id: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        assert_eq!(queue, MAIL_QUEUE);
        let mut state = self.state.lock().unwrap();
        state.publish_attempts += 1;
        if !state.reachable {
            return Err(BrokerError::ConnectTimeout(Duration::from_secs(10)));
        }
        state.next_tag += 1;
        let tag = state.next_tag;
        state.messages.push_back((tag, payload.to_vec()));
        Ok(())
    }
}

struct MemorySession {
    state: Arc<Mutex<QueueState>>,
}

#[async_trait]
impl Session for MemorySession {
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        match self.state.lock().unwrap().messages.pop_front() {
            Some((delivery_tag, data)) => Ok(Delivery {
                delivery_tag,
                message_id: None,
                data,
            }),
            None => Err(BrokerError::ConnectionLost("queue drained".to_string())),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.state.lock().unwrap().acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.state.lock().unwrap().rejected.push(delivery_tag);
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl Connector for MemoryBroker {
    type Session = MemorySession;

    async fn connect(&self, _queue: &str) -> Result<MemorySession, BrokerError> {
        if !self.state.lock().unwrap().reachable {
            return Err(BrokerError::ConnectTimeout(Duration::from_secs(10)));
        }
        Ok(MemorySession {
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Default)]
struct MemoryStore {
    broken: bool,
    records: Mutex<Vec<MailRecord>>,
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn record_delivery(&self, record: &MailRecord) -> Result<u64, StoreError> {
        if self.broken {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut records = self.records.lock().unwrap();
        records.push(record.clone());
        Ok(records.len() as u64)
    }
}

fn consumer(
    broker: &MemoryBroker,
    store: Arc<MemoryStore>,
) -> Consumer<MemoryBroker, Arc<MemoryStore>> {
    Consumer::new(broker.clone(), store, MAIL_QUEUE, Backoff::RECONNECT)
}

#[tokio::test]
async fn test_published_mail_is_recorded() {
    let broker = MemoryBroker::reachable();
    let publisher = Publisher::new(broker.clone(), MAIL_QUEUE, Backoff::PUBLISH);
    let message = NotificationMessage::new("a@e.com", "Hi", "Test").with_client_id(1);

    publisher.publish(&message, 3).await.unwrap();
    assert_eq!(broker.state.lock().unwrap().publish_attempts, 1);
    assert_eq!(broker.queued(), 1);

    let store = Arc::new(MemoryStore::default());
    let mut consumer = consumer(&broker, Arc::clone(&store));

    // dial, subscribe, consume
    for _ in 0..3 {
        consumer.step().await;
    }

    assert_eq!(broker.state.lock().unwrap().acked, vec![1]);
    assert_eq!(
        *store.records.lock().unwrap(),
        vec![MailRecord {
            client_id: Some(1),
            to_email: "a@e.com".to_string(),
            subject: "Hi".to_string(),
            body: "Test".to_string(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_exhausts_retries() {
    let broker = MemoryBroker::unreachable();
    let publisher = Publisher::new(broker.clone(), MAIL_QUEUE, Backoff::PUBLISH);
    let message = NotificationMessage::new("a@e.com", "Hi", "Test").with_client_id(1);

    let err = publisher.publish(&message, 2).await.unwrap_err();

    assert!(matches!(
        err,
        PublishError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(broker.state.lock().unwrap().publish_attempts, 3);
    assert_eq!(broker.queued(), 0);
}

#[tokio::test]
async fn test_store_failure_rejects_and_consumer_stays_up() {
    let broker = MemoryBroker::reachable();
    broker.enqueue(r#"{"email":"bad"}"#);
    broker.enqueue(r#"{"to_email":"next@e.com","subject":"Again"}"#);

    let store = Arc::new(MemoryStore {
        broken: true,
        ..Default::default()
    });
    let mut consumer = consumer(&broker, store);

    for _ in 0..4 {
        consumer.step().await;
    }

    let state = broker.state.lock().unwrap();
    assert_eq!(state.rejected, vec![1, 2]);
    assert!(state.acked.is_empty());
    assert!(state.messages.is_empty());
    assert_eq!(consumer.phase(), Phase::Subscribed);
    assert_eq!(consumer.stats().rejected, 2);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_waits_out_broker_outage() {
    let broker = MemoryBroker::unreachable();
    broker.enqueue(r#"{"email":"late@e.com"}"#);

    let store = Arc::new(MemoryStore::default());
    let mut consumer = consumer(&broker, Arc::clone(&store));

    // two failed dials, then about to try again
    for _ in 0..5 {
        consumer.step().await;
    }
    assert_eq!(consumer.phase(), Phase::Connecting);
    assert_eq!(consumer.stats().dial_failures, 2);

    broker.state.lock().unwrap().reachable = true;
    while consumer.stats().recorded == 0 {
        consumer.step().await;
    }

    assert_eq!(store.records.lock().unwrap()[0].to_email, "late@e.com");
    assert_eq!(consumer.stats().sessions, 1);
}
