//! Property check for the dispatch ordering contract: whatever mix of
//! priorities is registered, handlers run grouped by priority tier and in
//! registration order within a tier.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use tokio::sync::Mutex;

use legion_bus::event::{Event, EventType};
use legion_bus::registry::{HandlerFn, HandlerPriority, HandlerRegistry};

fn priority_strategy() -> impl Strategy<Value = HandlerPriority> {
    prop_oneof![
        Just(HandlerPriority::Critical),
        Just(HandlerPriority::High),
        Just(HandlerPriority::Normal),
        Just(HandlerPriority::Low),
    ]
}

fn recording_handler(log: Arc<Mutex<Vec<usize>>>, index: usize) -> HandlerFn {
    Arc::new(move |_event| {
        let log = log.clone();
        Box::pin(async move {
            log.lock().await.push(index);
            Ok(())
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn dispatch_respects_priority_then_registration_order(
        priorities in proptest::collection::vec(priority_strategy(), 0..12)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let registry = HandlerRegistry::new();
            let log = Arc::new(Mutex::new(Vec::new()));

            for (index, priority) in priorities.iter().enumerate() {
                registry
                    .register(
                        EventType::SignalGenerated,
                        recording_handler(log.clone(), index),
                        "strategy",
                        &format!("handler-{index}"),
                        *priority,
                    )
                    .await
                    .unwrap();
            }

            registry
                .dispatch(Event::new(
                    EventType::SignalGenerated,
                    HashMap::new(),
                    "strategy",
                ))
                .await;

            // Stable sort by priority mirrors the contract exactly.
            let mut expected: Vec<usize> = (0..priorities.len()).collect();
            expected.sort_by_key(|&i| priorities[i]);

            prop_assert_eq!(&*log.lock().await, &expected);
            Ok(())
        })?;
    }
}
