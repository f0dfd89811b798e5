//! Task lifecycle runner
//!
//! One generic [`Runner`] walks any [`Lifecycle`] through
//! `init → prepare → execute → post`, then always `destroy`. Reader and
//! writer behavior is composed in by [`ReaderLifecycle`] and
//! [`WriterLifecycle`].
//!
//! Each phase is timed into the task counters. An error or a panic in any
//! phase before destroy marks the task failed and captures the first failure;
//! the runner itself never propagates it further than its return value.

use crate::collector::PluginKind;
use crate::counters::{CounterKey, Counters, TaskState};
use crate::error::{Result, SyncError};
use crate::exchanger::{RecordReceiver, RecordSender};
use crate::plugin::{ReaderTask, TaskContext, WriterTask};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Position of a runner in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Init,
    Prepare,
    Execute,
    Post,
    Destroy,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::NotStarted => "not_started",
            Phase::Init => "init",
            Phase::Prepare => "prepare",
            Phase::Execute => "execute",
            Phase::Post => "post",
            Phase::Destroy => "destroy",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Capabilities a runner drives
pub trait Lifecycle: Send {
    fn role(&self) -> PluginKind;

    fn init(&mut self) -> Result<()>;

    fn prepare(&mut self) -> Result<()>;

    fn execute(&mut self) -> Result<()>;

    fn post(&mut self) -> Result<()>;

    fn destroy(&mut self) -> Result<()>;

    /// Whether finishing `post` completes the whole task
    fn completes_task(&self) -> bool {
        false
    }
}

/// Reader task plus the sender it streams into
pub struct ReaderLifecycle {
    task: Box<dyn ReaderTask>,
    sender: Box<dyn RecordSender>,
    ctx: TaskContext,
}

impl ReaderLifecycle {
    pub fn new(task: Box<dyn ReaderTask>, sender: Box<dyn RecordSender>, ctx: TaskContext) -> Self {
        Self { task, sender, ctx }
    }
}

impl Lifecycle for ReaderLifecycle {
    fn role(&self) -> PluginKind {
        PluginKind::Reader
    }

    fn init(&mut self) -> Result<()> {
        self.task.init(&self.ctx)
    }

    fn prepare(&mut self) -> Result<()> {
        self.task.prepare()
    }

    fn execute(&mut self) -> Result<()> {
        self.task.start_read(self.sender.as_mut())?;
        self.sender.terminate()
    }

    fn post(&mut self) -> Result<()> {
        self.task.post()
    }

    fn destroy(&mut self) -> Result<()> {
        self.task.destroy()
    }
}

/// Writer task plus the receiver it drains
pub struct WriterLifecycle {
    task: Box<dyn WriterTask>,
    receiver: Box<dyn RecordReceiver>,
    ctx: TaskContext,
}

impl WriterLifecycle {
    pub fn new(
        task: Box<dyn WriterTask>,
        receiver: Box<dyn RecordReceiver>,
        ctx: TaskContext,
    ) -> Self {
        Self {
            task,
            receiver,
            ctx,
        }
    }

    pub fn supports_failover(&self) -> bool {
        self.task.supports_failover()
    }
}

impl Lifecycle for WriterLifecycle {
    fn role(&self) -> PluginKind {
        PluginKind::Writer
    }

    fn init(&mut self) -> Result<()> {
        self.task.init(&self.ctx)
    }

    fn prepare(&mut self) -> Result<()> {
        self.task.prepare()
    }

    fn execute(&mut self) -> Result<()> {
        self.task.start_write(self.receiver.as_mut())
    }

    fn post(&mut self) -> Result<()> {
        self.task.post()
    }

    fn destroy(&mut self) -> Result<()> {
        self.task.destroy()
    }

    fn completes_task(&self) -> bool {
        true
    }
}

/// Drives one lifecycle to a terminal state
pub struct Runner<L: Lifecycle> {
    lifecycle: L,
    group_id: usize,
    task_id: usize,
    counters: Arc<Counters>,
    phase: Phase,
}

impl<L: Lifecycle> Runner<L> {
    pub fn new(lifecycle: L, group_id: usize, task_id: usize, counters: Arc<Counters>) -> Self {
        Self {
            lifecycle,
            group_id,
            task_id,
            counters,
            phase: Phase::NotStarted,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    /// Run every phase. Destroy runs regardless of the outcome.
    pub fn run(&mut self) -> std::result::Result<(), Arc<SyncError>> {
        let outcome = self.run_phases().map_err(|e| self.mark_fail(e));

        if let Err(e) = self.guarded(Phase::Destroy, |l| l.destroy()) {
            warn!(
                group_id = self.group_id,
                task_id = self.task_id,
                role = %self.lifecycle.role(),
                "Destroy failed: {}",
                e
            );
        }
        self.phase = Phase::Done;
        outcome
    }

    fn run_phases(&mut self) -> Result<()> {
        self.guarded(Phase::Init, |l| l.init())?;
        self.guarded(Phase::Prepare, |l| l.prepare())?;
        self.guarded(Phase::Execute, |l| l.execute())?;
        self.guarded(Phase::Post, |l| l.post())?;
        if self.lifecycle.completes_task() {
            self.mark_success();
        }
        Ok(())
    }

    fn guarded<F>(&mut self, phase: Phase, f: F) -> Result<()>
    where
        F: FnOnce(&mut L) -> Result<()>,
    {
        self.phase = phase;
        let start = Instant::now();
        let lifecycle = &mut self.lifecycle;
        let result = match catch_unwind(AssertUnwindSafe(|| f(lifecycle))) {
            Ok(result) => result,
            Err(payload) => Err(SyncError::Panicked(panic_message(payload.as_ref()))),
        };
        let elapsed = start.elapsed();
        self.counters
            .record_phase(&format!("{}.{}", self.lifecycle.role(), phase), elapsed);
        debug!(
            group_id = self.group_id,
            task_id = self.task_id,
            role = %self.lifecycle.role(),
            "Phase {} finished in {:?}",
            phase,
            elapsed
        );
        result
    }

    /// Mark the task failed and capture the failure
    pub fn mark_fail(&self, err: SyncError) -> Arc<SyncError> {
        error!(
            group_id = self.group_id,
            task_id = self.task_id,
            role = %self.lifecycle.role(),
            code = err.code().code(),
            "Task failed in phase {}: {}",
            self.phase,
            err
        );
        let err = Arc::new(err);
        self.counters.fail(err.clone());
        err
    }

    /// Mark the task succeeded and advance its stage
    pub fn mark_success(&self) {
        self.counters.set_state(TaskState::Succeeded);
        self.counters.increase(CounterKey::Stage, 1);
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Script {
        fail_at: Option<Phase>,
        panic_at: Option<Phase>,
        calls: Arc<Mutex<Vec<Phase>>>,
        completes: bool,
    }

    impl Script {
        fn step(&self, phase: Phase) -> Result<()> {
            self.calls.lock().push(phase);
            if self.panic_at == Some(phase) {
                panic!("boom in {}", phase);
            }
            if self.fail_at == Some(phase) {
                return Err(SyncError::runtime(format!("failed in {}", phase)));
            }
            Ok(())
        }
    }

    impl Lifecycle for Script {
        fn role(&self) -> PluginKind {
            PluginKind::Writer
        }
        fn init(&mut self) -> Result<()> {
            self.step(Phase::Init)
        }
        fn prepare(&mut self) -> Result<()> {
            self.step(Phase::Prepare)
        }
        fn execute(&mut self) -> Result<()> {
            self.step(Phase::Execute)
        }
        fn post(&mut self) -> Result<()> {
            self.step(Phase::Post)
        }
        fn destroy(&mut self) -> Result<()> {
            self.step(Phase::Destroy)
        }
        fn completes_task(&self) -> bool {
            self.completes
        }
    }

    fn run(script: Script) -> (Runner<Script>, std::result::Result<(), Arc<SyncError>>) {
        let mut runner = Runner::new(script, 1, 2, Arc::new(Counters::new()));
        let result = runner.run();
        (runner, result)
    }

    #[test]
    fn test_success_runs_all_phases() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (runner, result) = run(Script {
            calls: calls.clone(),
            completes: true,
            ..Script::default()
        });

        assert!(result.is_ok());
        assert_eq!(
            *calls.lock(),
            vec![
                Phase::Init,
                Phase::Prepare,
                Phase::Execute,
                Phase::Post,
                Phase::Destroy
            ]
        );
        assert_eq!(runner.phase(), Phase::Done);
        assert_eq!(runner.counters().state(), TaskState::Succeeded);
        assert_eq!(runner.counters().get(CounterKey::Stage), 1);
        assert!(runner.counters().phase_timing("writer.execute").is_some());
    }

    #[test]
    fn test_reader_side_does_not_complete_task() {
        let (runner, result) = run(Script::default());
        assert!(result.is_ok());
        assert_eq!(runner.counters().state(), TaskState::Running);
        assert_eq!(runner.counters().get(CounterKey::Stage), 0);
    }

    #[test]
    fn test_failure_skips_to_destroy() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (runner, result) = run(Script {
            fail_at: Some(Phase::Prepare),
            calls: calls.clone(),
            completes: true,
            ..Script::default()
        });

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Runtime error: failed in prepare");
        assert_eq!(*calls.lock(), vec![Phase::Init, Phase::Prepare, Phase::Destroy]);
        assert_eq!(runner.counters().state(), TaskState::Failed);
        assert!(runner.counters().failure().is_some());
        assert_eq!(runner.counters().get(CounterKey::Stage), 0);
    }

    #[test]
    fn test_panic_is_captured() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (runner, result) = run(Script {
            panic_at: Some(Phase::Execute),
            calls: calls.clone(),
            ..Script::default()
        });

        let err = result.unwrap_err();
        assert!(matches!(err.as_ref(), SyncError::Panicked(msg) if msg.contains("boom in execute")));
        assert_eq!(calls.lock().last(), Some(&Phase::Destroy));
        assert_eq!(runner.counters().state(), TaskState::Failed);
    }

    #[test]
    fn test_destroy_failure_does_not_fail_task() {
        let (runner, result) = run(Script {
            fail_at: Some(Phase::Destroy),
            completes: true,
            ..Script::default()
        });
        assert!(result.is_ok());
        assert_eq!(runner.counters().state(), TaskState::Succeeded);
    }
}
