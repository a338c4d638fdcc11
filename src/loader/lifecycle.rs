//! Running extension `setup` hooks.
//!
//! With a [`Scheduler`] the hook runs in the background and the load pass
//! moves on immediately. Without one it is awaited inline, racing the
//! pass's cancellation token, and any error fails the extension.

use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{panic_message, LoadContext};
use crate::error::LoadError;
use crate::plugins::Extension;

/// Accepts setup hooks to run without the loader waiting on them.
pub trait Scheduler {
    /// `source` is the `Type.setup` tag used when reporting the outcome.
    fn spawn(&self, source: String, task: LocalBoxFuture<'static, anyhow::Result<()>>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    Failed(String),
    Panicked(String),
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub source: String,
    pub status: TaskStatus,
}

/// Scheduler that keeps a handle to every task it starts and logs how
/// each one ends.
///
/// Tasks are started with [`tokio::task::spawn_local`], so the supervisor
/// must be used from inside a [`tokio::task::LocalSet`].
#[derive(Debug, Default)]
pub struct Supervisor {
    tasks: RefCell<Vec<(String, JoinHandle<TaskStatus>)>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks started and not yet finished.
    pub fn pending(&self) -> usize {
        self.tasks
            .borrow()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    pub fn abort_all(&self) {
        for (_, handle) in self.tasks.borrow().iter() {
            handle.abort();
        }
    }

    /// Wait for every task started so far, in start order.
    pub async fn join_all(&self) -> Vec<TaskOutcome> {
        let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        let mut outcomes = Vec::with_capacity(tasks.len());
        for (source, handle) in tasks {
            let status = match handle.await {
                Ok(status) => status,
                Err(e) if e.is_cancelled() => TaskStatus::Aborted,
                Err(e) => TaskStatus::Panicked(e.to_string()),
            };
            outcomes.push(TaskOutcome { source, status });
        }
        outcomes
    }
}

impl Scheduler for Supervisor {
    fn spawn(&self, source: String, task: LocalBoxFuture<'static, anyhow::Result<()>>) {
        let tag = source.clone();
        let handle = tokio::task::spawn_local(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(source = %tag, "Setup finished");
                    TaskStatus::Completed
                }
                Ok(Err(error)) => {
                    warn!(source = %tag, "Setup failed: {error:#}");
                    TaskStatus::Failed(format!("{error:#}"))
                }
                Err(payload) => {
                    let message = panic_message(&*payload);
                    warn!(source = %tag, "Setup panicked: {message}");
                    TaskStatus::Panicked(message)
                }
            }
        });
        self.tasks.borrow_mut().push((source, handle));
    }
}

/// Run `instance`'s setup hook in the mode `ctx` selects.
pub(crate) async fn run_setup(
    instance: &Rc<dyn Extension>,
    source: String,
    ctx: &LoadContext,
) -> Result<(), LoadError> {
    if let Some(scheduler) = ctx.scheduler() {
        let instance = Rc::clone(instance);
        debug!(source = %source, "Scheduling setup");
        scheduler.spawn(source, async move { instance.setup().await }.boxed_local());
        return Ok(());
    }

    warn!(
        source = %source,
        "No scheduler supplied; running setup inline and blocking the load pass"
    );
    let setup = AssertUnwindSafe(instance.setup()).catch_unwind();
    tokio::select! {
        _ = ctx.cancel_token().cancelled() => {
            info!(source = %source, "Setup interrupted by cancellation");
            Err(LoadError::Cancelled)
        }
        outcome = setup => match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(LoadError::Setup { source_tag: source, error }),
            Err(payload) => Err(LoadError::Panicked {
                subject: source,
                message: panic_message(&*payload),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tokio::task::LocalSet;

    async fn explode() -> anyhow::Result<()> {
        panic!("exploded")
    }

    #[tokio::test]
    async fn test_supervisor_reports_each_outcome() {
        LocalSet::new()
            .run_until(async {
                let supervisor = Supervisor::new();
                supervisor.spawn("Ok.setup".into(), async { anyhow::Ok(()) }.boxed_local());
                supervisor.spawn(
                    "Bad.setup".into(),
                    async { Err::<(), _>(anyhow!("no token")) }.boxed_local(),
                );
                supervisor.spawn("Boom.setup".into(), explode().boxed_local());

                let outcomes = supervisor.join_all().await;
                assert_eq!(outcomes.len(), 3);
                assert_eq!(outcomes[0].status, TaskStatus::Completed);
                assert_eq!(outcomes[1].source, "Bad.setup");
                assert_eq!(outcomes[1].status, TaskStatus::Failed("no token".into()));
                assert_eq!(outcomes[2].status, TaskStatus::Panicked("exploded".into()));
                assert_eq!(supervisor.pending(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_abort_all_marks_tasks_aborted() {
        LocalSet::new()
            .run_until(async {
                let supervisor = Supervisor::new();
                supervisor.spawn(
                    "Slow.setup".into(),
                    async {
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        anyhow::Ok(())
                    }
                    .boxed_local(),
                );
                assert_eq!(supervisor.pending(), 1);
                supervisor.abort_all();
                let outcomes = supervisor.join_all().await;
                assert_eq!(outcomes[0].status, TaskStatus::Aborted);
            })
            .await;
    }
}
