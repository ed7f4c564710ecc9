//! Integration tests for Store action broadcasting
//!
//! Request/response over a reducer: the caller sends an action and waits for the
//! action an effect produces for the same correlation id.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use stayflow_core::{effect::Effect, reducer::Reducer};
use stayflow_runtime::{Store, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum FlowAction {
    /// Begin a three-step flow
    Begin { id: u64 },
    /// One step finished
    StepDone { id: u64, step: u32 },
    /// Flow finished (terminal)
    Finished { id: u64 },
    /// Flow failed (terminal, never produced here)
    Failed { id: u64 },
}

#[derive(Debug, Clone, Default)]
struct FlowBook {
    steps: HashMap<u64, Vec<u32>>,
}

#[derive(Clone)]
struct FlowReducer;

impl Reducer for FlowReducer {
    type State = FlowBook;
    type Action = FlowAction;
    type Environment = ();

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        _env: &Self::Environment,
    ) -> Vec<Effect<Self::Action>> {
        match action {
            FlowAction::Begin { id } => {
                state.steps.insert(id, Vec::new());
                vec![Effect::Future(Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some(FlowAction::StepDone { id, step: 1 })
                }))]
            },
            FlowAction::StepDone { id, step } => {
                state.steps.entry(id).or_default().push(step);
                if step < 3 {
                    vec![Effect::Future(Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Some(FlowAction::StepDone { id, step: step + 1 })
                    }))]
                } else {
                    vec![Effect::Future(Box::pin(async move {
                        Some(FlowAction::Finished { id })
                    }))]
                }
            },
            FlowAction::Finished { .. } | FlowAction::Failed { .. } => vec![Effect::None],
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn waits_for_terminal_action_of_multi_step_flow() {
    let store = Store::new(FlowBook::default(), FlowReducer, ());

    let result = store
        .send_and_wait_for(
            FlowAction::Begin { id: 42 },
            |action| matches!(action, FlowAction::Finished { id: 42 }),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(result, FlowAction::Finished { id: 42 });
    let steps = store.state(|book| book.steps.get(&42).cloned()).await;
    assert_eq!(steps, Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn times_out_when_terminal_action_never_comes() {
    let store = Store::new(FlowBook::default(), FlowReducer, ());

    let result = store
        .send_and_wait_for(
            FlowAction::Begin { id: 99 },
            |action| matches!(action, FlowAction::Failed { id: 99 }),
            Duration::from_millis(30),
        )
        .await;

    assert_eq!(result, Err(StoreError::Timeout));
}

#[tokio::test]
async fn concurrent_waiters_each_get_their_own_flow() {
    let store = Arc::new(Store::new(FlowBook::default(), FlowReducer, ()));

    let mut handles = vec![];
    for id in 1..=5 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .send_and_wait_for(
                    FlowAction::Begin { id },
                    move |action| matches!(action, FlowAction::Finished { id: done } if *done == id),
                    Duration::from_secs(2),
                )
                .await
        }));
    }

    for (index, handle) in handles.into_iter().enumerate() {
        let id = u64::try_from(index).unwrap() + 1;
        assert_eq!(handle.await.unwrap().unwrap(), FlowAction::Finished { id });
    }
    assert_eq!(store.state(|book| book.steps.len()).await, 5);
}

#[tokio::test]
async fn observers_see_every_produced_action() {
    let store = Store::new(FlowBook::default(), FlowReducer, ());
    let mut observer = store.subscribe_actions();

    store.send(FlowAction::Begin { id: 7 }).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let action = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(action);
    }

    assert_eq!(
        seen,
        vec![
            FlowAction::StepDone { id: 7, step: 1 },
            FlowAction::StepDone { id: 7, step: 2 },
            FlowAction::StepDone { id: 7, step: 3 },
            FlowAction::Finished { id: 7 },
        ]
    );
}
