//! Lifecycle hook execution.
//!
//! Every hook call is a race between the hook's future and a timeout, with
//! panics caught, so a misbehaving hook can only ever produce one of three
//! outcomes. Only `Resolved(true)` lets a transition proceed.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use futures::FutureExt;
use log::{debug, warn};

use crate::core::node::{AtEndContext, AtEndDecision, AtEndHandler, Hook};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Resolved(bool),
    TimedOut,
    Threw(String),
}

impl HookOutcome {
    pub fn allows(&self) -> bool {
        matches!(self, HookOutcome::Resolved(true))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "hook panicked".to_string()
    }
}

/// Runs `hook` with `arg`, bounded by `limit`.
pub async fn run_hook<A: 'static>(
    hook: &Hook<A>,
    arg: A,
    limit: Duration,
    label: &str,
    node_id: &str,
) -> HookOutcome {
    // Building the future runs the closure body, which may itself panic
    let future = match catch_unwind(AssertUnwindSafe(|| hook.call(arg))) {
        Ok(future) => future,
        Err(payload) => {
            let message = panic_message(payload);
            warn!("{} hook of {} panicked: {}", label, node_id, message);
            return HookOutcome::Threw(message);
        }
    };

    let outcome = match tokio::time::timeout(limit, AssertUnwindSafe(future).catch_unwind()).await {
        Err(_) => {
            warn!("{} hook of {} timed out after {:?}", label, node_id, limit);
            HookOutcome::TimedOut
        }
        Ok(Err(payload)) => {
            let message = panic_message(payload);
            warn!("{} hook of {} panicked: {}", label, node_id, message);
            HookOutcome::Threw(message)
        }
        Ok(Ok(Err(e))) => {
            warn!("{} hook of {} failed: {}", label, node_id, e);
            HookOutcome::Threw(e.0)
        }
        Ok(Ok(Ok(verdict))) => HookOutcome::Resolved(verdict),
    };
    debug!("{} hook of {} -> {:?}", label, node_id, outcome);
    outcome
}

/// Runs a custom at-end handler under the same contract as [`run_hook`].
/// A handler that times out or panics counts as `Handled(false)`.
pub async fn run_at_end(handler: &AtEndHandler, ctx: AtEndContext, limit: Duration) -> AtEndDecision {
    let parent_id = ctx.parent_id.clone();
    let future = match catch_unwind(AssertUnwindSafe(|| handler.call(ctx))) {
        Ok(future) => future,
        Err(payload) => {
            warn!("atEnd handler of {} panicked: {}", parent_id, panic_message(payload));
            return AtEndDecision::Handled(false);
        }
    };

    match tokio::time::timeout(limit, AssertUnwindSafe(future).catch_unwind()).await {
        Err(_) => {
            warn!("atEnd handler of {} timed out after {:?}", parent_id, limit);
            AtEndDecision::Handled(false)
        }
        Ok(Err(payload)) => {
            warn!("atEnd handler of {} panicked: {}", parent_id, panic_message(payload));
            AtEndDecision::Handled(false)
        }
        Ok(Ok(decision)) => decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::HookError;

    const LIMIT: Duration = Duration::from_secs(8);

    #[tokio::test]
    async fn test_resolved_verdicts() {
        let yes: Hook<()> = Hook::sync(|_| true);
        let no: Hook<()> = Hook::sync(|_| false);
        assert_eq!(run_hook(&yes, (), LIMIT, "onClose", "P.A").await, HookOutcome::Resolved(true));
        assert_eq!(run_hook(&no, (), LIMIT, "onClose", "P.A").await, HookOutcome::Resolved(false));
        assert!(!HookOutcome::Resolved(false).allows());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_hook_times_out() {
        let slow: Hook<()> = Hook::new(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(true)
        });
        let outcome = run_hook(&slow, (), LIMIT, "onOpen", "P.A").await;
        assert_eq!(outcome, HookOutcome::TimedOut);
        assert!(!outcome.allows());
    }

    #[tokio::test]
    async fn test_error_and_panic_become_threw() {
        let failing: Hook<()> = Hook::new(|_| async { Err(HookError::from("no network")) });
        assert_eq!(
            run_hook(&failing, (), LIMIT, "onOpen", "P.A").await,
            HookOutcome::Threw("no network".into())
        );

        let panicking: Hook<()> = Hook::new(|_| async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            Ok(true)
        });
        assert_eq!(
            run_hook(&panicking, (), LIMIT, "onOpen", "P.A").await,
            HookOutcome::Threw("boom".into())
        );

        let eager: Hook<()> = Hook::sync(|_| panic!("eager"));
        assert_eq!(
            run_hook(&eager, (), LIMIT, "onOpen", "P.A").await,
            HookOutcome::Threw("eager".into())
        );
    }

    fn at_end_ctx() -> AtEndContext {
        AtEndContext {
            parent_id: "P".into(),
            current_child_id: Some("P.A".into()),
            sibling_count: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_end_handler_failures_become_handled_false() {
        let panicking = AtEndHandler::new(|_| async {
            let fail = true;
            if fail {
                panic!("handler boom");
            }
            AtEndDecision::Decline
        });
        assert_eq!(run_at_end(&panicking, at_end_ctx(), LIMIT).await, AtEndDecision::Handled(false));

        let slow = AtEndHandler::new(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            AtEndDecision::Decline
        });
        assert_eq!(run_at_end(&slow, at_end_ctx(), LIMIT).await, AtEndDecision::Handled(false));

        let open = AtEndHandler::new(|_| async { AtEndDecision::Open("A".into()) });
        assert_eq!(run_at_end(&open, at_end_ctx(), LIMIT).await, AtEndDecision::Open("A".into()));
    }
}
