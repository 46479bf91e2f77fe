//! A step retried `n` times runs `n + 1` times in total.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use conduit_core::{Exchange, ExchangeError, FailureKind};
use conduit_engine::engine::processor_fn;
use conduit_engine::{
    EngineConfig, ErrorHandlerDefinition, RedeliveryPolicy, RouteDefinition, RoutingContext,
};
use proptest::prelude::*;

async fn attempts_for(
    max_redeliveries: u32,
    fail_first: u32,
) -> (u32, Result<Exchange, ExchangeError>) {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let context = RoutingContext::new(EngineConfig::default());
    context
        .add_route(
            RouteDefinition::from("direct:start")
                .error_handler(
                    ErrorHandlerDefinition::default()
                        .with_redelivery(RedeliveryPolicy::immediate(max_redeliveries)),
                )
                .process(Arc::new(processor_fn("flaky", move |_: &mut Exchange| {
                    if counter.fetch_add(1, Ordering::SeqCst) < fail_first {
                        Err(ExchangeError::Processing("flaky".into()))
                    } else {
                        Ok(())
                    }
                }))),
        )
        .await
        .unwrap();
    context.start().await.unwrap();

    let result = context.template().send_body("direct:start", "x").await;
    context.shutdown().await.unwrap();
    (attempts.load(Ordering::SeqCst), result)
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn always_failing_step_runs_once_per_attempt(max_redeliveries in 0u32..6) {
        let (attempts, result) = block_on(attempts_for(max_redeliveries, u32::MAX));
        prop_assert_eq!(attempts, max_redeliveries + 1);
        prop_assert_eq!(result.unwrap_err().kind(), FailureKind::Processing);
    }

    #[test]
    fn recovery_within_budget_succeeds(max_redeliveries in 1u32..6, seed in 0u32..6) {
        let fail_first = seed % (max_redeliveries + 1);
        let (attempts, result) = block_on(attempts_for(max_redeliveries, fail_first));
        prop_assert_eq!(attempts, fail_first + 1);
        prop_assert!(result.is_ok());
    }
}
