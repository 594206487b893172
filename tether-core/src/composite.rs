//! CompositeOperation - aggregate completion over a set of operations

use crate::operation::Operation;
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tether_model::{DisplayList, OperationError};

/// How a composite reacts to child failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Complete with the first child failure; stop observing the rest.
    /// The remaining children keep running, they are not cancelled.
    FailFast,
    /// Wait for every child; fail if any failed, aggregating messages.
    CollectAll,
}

/// Completes exactly once, after its children have reported according to
/// the policy. An empty child set completes successfully immediately.
pub struct CompositeOperation {
    op: Operation,
}

impl CompositeOperation {
    pub fn new(children: Vec<Operation>, policy: CompletionPolicy) -> Self {
        let op = Operation::new();
        if children.is_empty() {
            op.complete_success();
            return Self { op };
        }
        let result = op.clone();
        tokio::spawn(async move {
            drive(children, policy, result).await;
        });
        Self { op }
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    pub fn into_operation(self) -> Operation {
        self.op
    }

    pub fn is_finished(&self) -> bool {
        self.op.is_finished()
    }

    pub async fn wait(&self) -> Result<(), OperationError> {
        self.op.wait().await
    }
}

async fn drive(children: Vec<Operation>, policy: CompletionPolicy, result: Operation) {
    match policy {
        CompletionPolicy::FailFast => {
            let mut pending: FuturesUnordered<_> =
                children.iter().map(|child| child.wait()).collect();
            while let Some(outcome) = pending.next().await {
                if let Err(err) = outcome {
                    result.complete_failure(err);
                    return;
                }
            }
            result.complete_success();
        }
        CompletionPolicy::CollectAll => {
            let outcomes = join_all(children.iter().map(|child| child.wait())).await;
            let failures: Vec<OperationError> =
                outcomes.into_iter().filter_map(Result::err).collect();
            match failures.first() {
                None => result.complete_success(),
                Some(first) => result.complete_failure(OperationError::new(
                    first.kind(),
                    DisplayList(&failures).to_string(),
                )),
            }
        }
    }
}
