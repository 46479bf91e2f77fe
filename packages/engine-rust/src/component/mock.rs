//! `mock:` component: recording endpoints for route tests.
//!
//! Every `mock:name` URI in a context resolves to the same [`MockEndpoint`],
//! which keeps a copy of each exchange delivered to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{Body, Exchange, ExchangeError};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Component, Endpoint, EndpointUri};
use crate::engine::{AsyncProcessor, Completion, SharedProcessor};

type ReceiveHook = Arc<dyn Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum MockAssertionError {
    #[error("{endpoint}: expected {expected} messages, received {actual}")]
    CountMismatch {
        endpoint: String,
        expected: usize,
        actual: usize,
    },

    #[error("{endpoint}: expected bodies {expected:?}, received {actual:?}")]
    BodiesMismatch {
        endpoint: String,
        expected: Vec<Body>,
        actual: Vec<Body>,
    },
}

// ---------------------------------------------------------------------------
// MockComponent
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockComponent {
    endpoints: DashMap<String, MockEndpoint>,
}

impl MockComponent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint registered under `name`, created on first use.
    pub fn endpoint(&self, name: &str) -> MockEndpoint {
        self.endpoints
            .entry(name.to_string())
            .or_insert_with(|| MockEndpoint::new(format!("mock://{name}")))
            .clone()
    }

    /// Clears received exchanges and expectations on every endpoint.
    pub fn reset_all(&self) {
        for entry in &self.endpoints {
            entry.value().reset();
        }
    }
}

impl Component for MockComponent {
    fn create_endpoint(&self, uri: &EndpointUri) -> Result<Arc<dyn Endpoint>, ExchangeError> {
        if uri.path().is_empty() {
            return Err(ExchangeError::IllegalArgument(format!(
                "mock endpoint needs a name: {uri}"
            )));
        }
        Ok(Arc::new(self.endpoint(uri.path())))
    }
}

// ---------------------------------------------------------------------------
// MockEndpoint
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Expectations {
    count: Option<usize>,
    bodies: Option<Vec<Body>>,
}

struct MockInner {
    uri: String,
    received: Mutex<Vec<Exchange>>,
    expectations: Mutex<Expectations>,
    on_receive: Mutex<Option<ReceiveHook>>,
    count_tx: watch::Sender<usize>,
}

/// Handle to a recording endpoint. Clones share the same recordings.
#[derive(Clone)]
pub struct MockEndpoint {
    inner: Arc<MockInner>,
}

impl MockEndpoint {
    fn new(uri: String) -> Self {
        let (count_tx, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(MockInner {
                uri,
                received: Mutex::new(Vec::new()),
                expectations: Mutex::new(Expectations::default()),
                on_receive: Mutex::new(None),
                count_tx,
            }),
        }
    }

    pub fn expected_message_count(&self, count: usize) {
        self.inner.expectations.lock().count = Some(count);
    }

    /// Expects exactly these bodies, in arrival order.
    pub fn expected_bodies_received(&self, bodies: Vec<Body>) {
        let mut expectations = self.inner.expectations.lock();
        expectations.count = Some(bodies.len());
        expectations.bodies = Some(bodies);
    }

    /// Runs `hook` on every delivered exchange. An `Err` fails the delivery.
    pub fn when_any_exchange_received<F>(&self, hook: F)
    where
        F: Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync + 'static,
    {
        *self.inner.on_receive.lock() = Some(Arc::new(hook));
    }

    #[must_use]
    pub fn received_count(&self) -> usize {
        self.inner.received.lock().len()
    }

    #[must_use]
    pub fn received_exchanges(&self) -> Vec<Exchange> {
        self.inner.received.lock().clone()
    }

    #[must_use]
    pub fn received_bodies(&self) -> Vec<Body> {
        self.inner
            .received
            .lock()
            .iter()
            .map(|exchange| exchange.body().clone())
            .collect()
    }

    pub fn reset(&self) {
        self.inner.received.lock().clear();
        *self.inner.expectations.lock() = Expectations::default();
        *self.inner.on_receive.lock() = None;
        self.inner.count_tx.send_replace(0);
    }

    /// Waits up to `timeout` for the expected message count, then checks
    /// every expectation.
    ///
    /// # Errors
    ///
    /// Returns the first expectation that does not hold.
    pub async fn assert_satisfied(&self, timeout: Duration) -> Result<(), MockAssertionError> {
        let (count, bodies) = {
            let expectations = self.inner.expectations.lock();
            (expectations.count, expectations.bodies.clone())
        };

        if let Some(expected) = count {
            let mut rx = self.inner.count_tx.subscribe();
            // A timeout falls through to the count check below.
            let _ = tokio::time::timeout(timeout, rx.wait_for(|received| *received >= expected))
                .await;

            let actual = self.received_count();
            if actual != expected {
                return Err(MockAssertionError::CountMismatch {
                    endpoint: self.inner.uri.clone(),
                    expected,
                    actual,
                });
            }
        }

        if let Some(expected) = bodies {
            let actual = self.received_bodies();
            if actual != expected {
                return Err(MockAssertionError::BodiesMismatch {
                    endpoint: self.inner.uri.clone(),
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.inner.uri
    }

    fn create_producer(&self) -> Result<SharedProcessor, ExchangeError> {
        Ok(Arc::new(MockProducer {
            label: format!("to[{}]", self.inner.uri),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockProducer {
    label: String,
    inner: Arc<MockInner>,
}

impl AsyncProcessor for MockProducer {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let hook = self.inner.on_receive.lock().clone();
        if let Some(hook) = hook {
            if let Err(err) = hook(&mut exchange) {
                exchange.set_exception(err);
            }
        }

        let count = {
            let mut received = self.inner.received.lock();
            received.push(exchange.clone());
            received.len()
        };
        self.inner.count_tx.send_replace(count);
        Completion::Sync(exchange)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(endpoint: &MockEndpoint, body: &str) -> Exchange {
        let producer = endpoint.create_producer().unwrap();
        producer.process(Exchange::with_body(body)).into_sync().unwrap()
    }

    #[test]
    fn records_deliveries() {
        let component = MockComponent::new();
        let endpoint = component.endpoint("result");
        deliver(&endpoint, "a");
        deliver(&component.endpoint("result"), "b");

        assert_eq!(endpoint.received_count(), 2);
        assert_eq!(endpoint.received_bodies(), vec![Body::from("a"), Body::from("b")]);
        assert_eq!(endpoint.uri(), "mock://result");
    }

    #[test]
    fn hook_failure_fails_the_delivery() {
        let endpoint = MockComponent::new().endpoint("x");
        endpoint.when_any_exchange_received(|_ex| Err(ExchangeError::Processing("nope".into())));
        let exchange = deliver(&endpoint, "a");
        assert!(exchange.is_failed());
        assert_eq!(endpoint.received_count(), 1);
    }

    #[tokio::test]
    async fn assert_satisfied_waits_for_late_deliveries() {
        let endpoint = MockComponent::new().endpoint("late");
        endpoint.expected_message_count(1);

        let sender = endpoint.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            deliver(&sender, "x");
        });
        endpoint.assert_satisfied(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn assert_satisfied_reports_mismatch() {
        let endpoint = MockComponent::new().endpoint("strict");
        endpoint.expected_bodies_received(vec![Body::from("a")]);
        deliver(&endpoint, "b");

        let err = endpoint.assert_satisfied(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, MockAssertionError::BodiesMismatch { .. }));

        endpoint.reset();
        endpoint.expected_message_count(2);
        let err = endpoint.assert_satisfied(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, MockAssertionError::CountMismatch { actual: 0, .. }));
    }
}
