//! Tests for Operation and CompositeOperation completion semantics

mod common;

use common::init_tracing;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tether_core::{CompletionPolicy, CompositeOperation, Operation};
use tether_model::{error_kind, OperationError};

#[tokio::test]
async fn success_is_observable_by_every_waiter() {
    init_tracing();
    let op = Operation::new();
    let a = op.clone();
    let b = op.clone();
    let waiter_a = tokio::spawn(async move { a.wait().await });
    let waiter_b = tokio::spawn(async move { b.wait().await });

    op.complete_success();

    assert!(waiter_a.await.expect("waiter a panicked").is_ok());
    assert!(waiter_b.await.expect("waiter b panicked").is_ok());
    assert!(op.is_finished());
    assert!(op.is_success());
    assert!(!op.is_failure());
}

#[tokio::test]
async fn first_outcome_wins_over_late_failure() {
    init_tracing();
    let op = Operation::new();
    op.complete_success();
    op.complete_failure(OperationError::not_available("too late"));

    assert!(op.wait().await.is_ok());
    assert!(op.is_success());
    assert!(op.error().is_none());
}

#[tokio::test]
async fn first_outcome_wins_over_late_success() {
    init_tracing();
    let op = Operation::new();
    op.complete_failure(OperationError::not_available("gone"));
    op.complete_success();

    let err = op.wait().await.expect_err("failure must stand");
    assert_eq!(err.kind(), error_kind::NOT_AVAILABLE);
    assert!(op.is_failure());
}

#[tokio::test]
async fn empty_failure_kind_is_normalized() {
    init_tracing();
    let op = Operation::failed(OperationError::new("", "boom"));
    let err = op.wait().await.expect_err("must fail");
    assert_eq!(err.kind(), error_kind::INTERNAL);
    assert_eq!(err.message(), "boom");
}

#[tokio::test]
async fn completion_is_not_delivered_reentrantly() {
    init_tracing();
    let op = Operation::new();
    let notified = Arc::new(AtomicBool::new(false));

    let waiter_op = op.clone();
    let waiter_flag = notified.clone();
    tokio::spawn(async move {
        let _ = waiter_op.wait().await;
        waiter_flag.store(true, Ordering::SeqCst);
    });
    // Let the waiter register.
    tokio::task::yield_now().await;

    op.complete_success();
    // Still inside the unit of work that completed the operation: the
    // observer must not have run yet.
    assert!(!notified.load(Ordering::SeqCst));

    common::wait_until(|| notified.load(Ordering::SeqCst)).await;
}

#[tokio::test]
async fn each_waiter_sees_exactly_one_completion() {
    init_tracing();
    let op = Operation::new();
    let notifications = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let waiter_op = op.clone();
        let counter = notifications.clone();
        waiters.push(tokio::spawn(async move {
            let _ = waiter_op.wait().await;
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    tokio::task::yield_now().await;

    op.complete_success();
    op.complete_success();
    op.complete_failure(OperationError::internal("ignored"));

    for waiter in waiters {
        waiter.await.expect("waiter panicked");
    }
    assert_eq!(notifications.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn trivial_constructors_finish_with_their_outcome() {
    init_tracing();
    assert!(Operation::succeeded().wait().await.is_ok());
    let err = Operation::failed(OperationError::not_available("down"))
        .wait()
        .await
        .expect_err("must fail");
    assert_eq!(err.kind(), error_kind::NOT_AVAILABLE);
}

#[tokio::test]
async fn composite_empty_set_succeeds_immediately() {
    init_tracing();
    let composite = CompositeOperation::new(Vec::new(), CompletionPolicy::FailFast);
    assert!(composite.is_finished());
    assert!(composite.wait().await.is_ok());
}

#[tokio::test]
async fn composite_succeeds_when_all_children_do() {
    init_tracing();
    let children: Vec<Operation> = (0..3).map(|_| Operation::new()).collect();
    let composite =
        CompositeOperation::new(children.clone(), CompletionPolicy::CollectAll);

    for child in &children {
        child.complete_success();
    }
    assert!(composite.wait().await.is_ok());
}

#[tokio::test]
async fn composite_fail_fast_reports_first_failure() {
    init_tracing();
    let fast = Operation::new();
    let slow = Operation::new();
    let composite = CompositeOperation::new(
        vec![fast.clone(), slow.clone()],
        CompletionPolicy::FailFast,
    );

    fast.complete_failure(OperationError::not_available("first down"));
    let err = composite.wait().await.expect_err("must fail");
    assert_eq!(err.kind(), error_kind::NOT_AVAILABLE);
    assert_eq!(err.message(), "first down");

    // The unfinished child is not cancelled; it still owns its lifecycle.
    assert!(!slow.is_finished());
    slow.complete_success();
    assert!(slow.is_success());
}

#[tokio::test]
async fn composite_collect_all_aggregates_failures() {
    init_tracing();
    let a = Operation::new();
    let b = Operation::new();
    let c = Operation::new();
    let composite = CompositeOperation::new(
        vec![a.clone(), b.clone(), c.clone()],
        CompletionPolicy::CollectAll,
    );

    a.complete_failure(OperationError::new(error_kind::INVALID_HANDLE, "bad id"));
    c.complete_success();
    // Not finished yet: collect-all waits for every child.
    assert!(!composite.is_finished());
    b.complete_failure(OperationError::not_available("down"));

    let err = composite.wait().await.expect_err("must fail");
    assert_eq!(err.kind(), error_kind::INVALID_HANDLE);
    assert!(err.message().contains("bad id"));
    assert!(err.message().contains("down"));
}
