//! Task group execution
//!
//! A [`TaskGroupContainer`] runs the work units of one [`GroupConfig`] with
//! at most `channels` task pairs in flight. Every pair is a reader thread and
//! a writer thread joined by one [`MemoryChannel`]. The container polls for
//! completions, stops the peer of a failed side, retries failed tasks whose
//! writer supports failover, and keeps the group counters rolled up.
//!
//! Per-task failures stay inside the group. Anything that escapes the
//! container is caught by [`TaskGroupRunner`] and surfaces as
//! [`SyncError::GroupFailed`].

use crate::assign::{GroupConfig, WorkUnit};
use crate::channel::MemoryChannel;
use crate::collector::{PluginKind, RecordCollector, TaskCollector};
use crate::config::SyncConfig;
use crate::counters::{Counters, TaskState};
use crate::error::{ErrorCode, Result, SyncError};
use crate::exchanger::{ExchangerPair, ShutdownHandle};
use crate::plugin::{TaskContext, TaskFactory};
use crate::runner::{panic_message, ReaderLifecycle, Runner, WriterLifecycle};
use crate::transformer::TransformChain;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Sent by a task thread when its runner returns
#[derive(Debug, Clone, Copy)]
struct Completion {
    task_id: usize,
    attempt: u32,
    side: PluginKind,
    failed: bool,
}

/// A unit waiting to be launched
#[derive(Debug, Clone, Copy)]
struct Pending {
    index: usize,
    attempt: u32,
    not_before: Instant,
}

/// Threads and handles of one running task attempt
struct TaskExecutor {
    index: usize,
    task_id: usize,
    attempt: u32,
    counters: Arc<Counters>,
    handles: [ShutdownHandle; 2],
    supports_failover: bool,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    reader_done: bool,
    writer_done: bool,
    /// Set once the executor is told to stop; the peers must exit by then
    deadline: Option<Instant>,
}

impl TaskExecutor {
    fn is_finished(&self) -> bool {
        self.reader_done && self.writer_done
    }

    fn shutdown(&mut self, wait: std::time::Duration) {
        for handle in &self.handles {
            handle.shutdown();
        }
        self.deadline.get_or_insert_with(|| Instant::now() + wait);
    }

    fn join(&mut self) {
        for (role, join) in [("reader", self.reader.take()), ("writer", self.writer.take())] {
            if let Some(join) = join {
                if join.join().is_err() {
                    warn!(task_id = self.task_id, "{} thread panicked outside its runner", role);
                }
            }
        }
    }
}

/// Runs one group's tasks on dedicated threads
pub struct TaskGroupContainer<T> {
    group: GroupConfig<T>,
    config: Arc<SyncConfig>,
    factory: Arc<dyn TaskFactory<T>>,
    counters: Arc<Counters>,
    task_counters: IndexMap<usize, Arc<Counters>>,
    abort: Arc<AtomicBool>,
}

impl<T> TaskGroupContainer<T> {
    pub fn new(
        group: GroupConfig<T>,
        config: Arc<SyncConfig>,
        factory: Arc<dyn TaskFactory<T>>,
    ) -> Self {
        let task_counters = group
            .units
            .iter()
            .map(|u| (u.task_id, Arc::new(Counters::new())))
            .collect();
        Self {
            group,
            config,
            factory,
            counters: Arc::new(Counters::new()),
            task_counters,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn group_id(&self) -> usize {
        self.group.group_id
    }

    /// Rolled-up counters of the whole group
    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Counters of every task, by task id
    pub fn task_counters(&self) -> IndexMap<usize, Arc<Counters>> {
        self.task_counters.clone()
    }

    /// Setting the flag kills the group's running tasks
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Run every unit to completion
    pub fn start(&self) -> Result<()> {
        let started = Instant::now();
        info!(
            group_id = self.group_id(),
            "Task group starting: {} tasks on {} channels",
            self.group.units.len(),
            self.group.channels
        );

        let (tx, rx) = unbounded();
        let mut pending: VecDeque<Pending> = (0..self.group.units.len())
            .map(|index| Pending {
                index,
                attempt: 0,
                not_before: started,
            })
            .collect();
        let mut running: IndexMap<usize, TaskExecutor> = IndexMap::new();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.supervise(&mut pending, &mut running, &tx, &rx)
        }))
        .unwrap_or_else(|payload| Err(SyncError::Panicked(panic_message(payload.as_ref()))));

        if let Err(e) = outcome {
            error!(
                group_id = self.group_id(),
                running = running.len(),
                "Task group supervisor failed, stopping its tasks: {}",
                e
            );
            self.kill(&mut running, &pending, &rx, "task group failed");
            self.refresh();
            return Err(e);
        }

        self.refresh();
        info!(
            group_id = self.group_id(),
            state = %self.counters.state(),
            "Task group completed in {:?}",
            started.elapsed()
        );
        Ok(())
    }

    fn supervise(
        &self,
        pending: &mut VecDeque<Pending>,
        running: &mut IndexMap<usize, TaskExecutor>,
        tx: &Sender<Completion>,
        rx: &Receiver<Completion>,
    ) -> Result<()> {
        let settings = &self.config.task_group;
        let mut last_report = Instant::now();

        loop {
            if self.abort.load(Ordering::Acquire) {
                self.kill(running, pending, rx, "task killed by job abort");
                warn!(group_id = self.group_id(), "Task group aborted");
                return Ok(());
            }

            self.launch_ready(pending, running, tx)?;

            if running.is_empty() && pending.is_empty() {
                return Ok(());
            }

            match rx.recv_timeout(settings.sleep_interval()) {
                Ok(completion) => {
                    self.on_completion(completion, running, pending);
                    while let Ok(completion) = rx.try_recv() {
                        self.on_completion(completion, running, pending);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SyncError::runtime("task completion channel disconnected"));
                }
            }

            self.expire_overdue(running, pending);
            self.refresh();

            if last_report.elapsed() >= settings.report_interval() {
                last_report = Instant::now();
                let snapshot = self.counters.snapshot();
                debug!(
                    group_id = self.group_id(),
                    running = running.len(),
                    pending = pending.len(),
                    read_records = snapshot.total_read_records(),
                    write_records = snapshot.write_succeed_records(),
                    error_records = snapshot.total_error_records(),
                    "Task group progress"
                );
            }
        }
    }

    fn refresh(&self) {
        let total = Counters::rollup(self.task_counters.values().map(|c| c.as_ref()));
        self.counters.copy_from(&total);
    }

    fn task_counters_of(&self, task_id: usize) -> Result<Arc<Counters>> {
        self.task_counters
            .get(&task_id)
            .cloned()
            .ok_or_else(|| SyncError::runtime(format!("no counters for task {}", task_id)))
    }

    fn launch_ready(
        &self,
        pending: &mut VecDeque<Pending>,
        running: &mut IndexMap<usize, TaskExecutor>,
        tx: &Sender<Completion>,
    ) -> Result<()> {
        while running.len() < self.group.channels {
            let now = Instant::now();
            let Some(pos) = pending.iter().position(|p| p.not_before <= now) else {
                break;
            };
            let Some(next) = pending.remove(pos) else {
                break;
            };
            let unit = &self.group.units[next.index];
            if let Some(executor) = self.launch(unit, next.index, next.attempt, tx)? {
                running.insert(unit.task_id, executor);
            }
        }
        Ok(())
    }

    fn launch(
        &self,
        unit: &WorkUnit<T>,
        index: usize,
        attempt: u32,
        tx: &Sender<Completion>,
    ) -> Result<Option<TaskExecutor>> {
        let group_id = self.group_id();
        let task_id = unit.task_id;
        let counters = self.task_counters_of(task_id)?;
        if attempt > 0 {
            counters.reset();
        }

        let tasks = self
            .factory
            .create_reader(unit)
            .and_then(|reader| Ok((reader, self.factory.create_writer(unit)?)));
        let (reader_task, writer_task) = match tasks {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(group_id, task_id, "Failed to create task plugins: {}", e);
                counters.fail(Arc::new(e));
                return Ok(None);
            }
        };

        let settings = &self.config.task_group;
        let channel = Arc::new(MemoryChannel::new(
            group_id,
            task_id,
            self.config.channel.clone(),
            counters.clone(),
        )?);
        let reader_collector: Arc<dyn RecordCollector> = Arc::new(TaskCollector::with_max_dirty_log(
            counters.clone(),
            PluginKind::Reader,
            settings.max_dirty_log,
        ));
        let writer_collector: Arc<dyn RecordCollector> = Arc::new(TaskCollector::with_max_dirty_log(
            counters.clone(),
            PluginKind::Writer,
            settings.max_dirty_log,
        ));
        let pair = ExchangerPair::new(
            channel,
            &self.config.exchanger,
            TransformChain::from_steps(&self.config.transformers)?,
            reader_collector.clone(),
            writer_collector.clone(),
        );
        let handles = pair.shutdown_handles();
        let ExchangerPair {
            sender, receiver, ..
        } = pair;

        let context = |collector: Arc<dyn RecordCollector>| TaskContext {
            group_id,
            task_id,
            attempt,
            collector,
        };
        let writer = WriterLifecycle::new(writer_task, receiver, context(writer_collector));
        let supports_failover = writer.supports_failover();
        let reader = ReaderLifecycle::new(reader_task, sender, context(reader_collector));

        let writer_join = spawn_runner(
            format!("writer-{}-{}", group_id, task_id),
            Runner::new(writer, group_id, task_id, counters.clone()),
            Completion {
                task_id,
                attempt,
                side: PluginKind::Writer,
                failed: false,
            },
            tx.clone(),
        )?;
        let reader_join = match spawn_runner(
            format!("reader-{}-{}", group_id, task_id),
            Runner::new(reader, group_id, task_id, counters.clone()),
            Completion {
                task_id,
                attempt,
                side: PluginKind::Reader,
                failed: false,
            },
            tx.clone(),
        ) {
            Ok(join) => join,
            Err(e) => {
                for handle in &handles {
                    handle.shutdown();
                }
                return Err(e);
            }
        };

        info!(group_id, task_id, attempt, "Task started");
        Ok(Some(TaskExecutor {
            index,
            task_id,
            attempt,
            counters,
            handles,
            supports_failover,
            reader: Some(reader_join),
            writer: Some(writer_join),
            reader_done: false,
            writer_done: false,
            deadline: None,
        }))
    }

    fn on_completion(
        &self,
        completion: Completion,
        running: &mut IndexMap<usize, TaskExecutor>,
        pending: &mut VecDeque<Pending>,
    ) {
        let max_wait = self.config.task_group.task_max_wait();
        let Some(executor) = running.get_mut(&completion.task_id) else {
            debug!(task_id = completion.task_id, "Ignoring completion of a detached task");
            return;
        };
        if executor.attempt != completion.attempt {
            debug!(
                task_id = completion.task_id,
                attempt = completion.attempt,
                "Ignoring completion of a stale attempt"
            );
            return;
        }

        match completion.side {
            PluginKind::Reader => executor.reader_done = true,
            _ => executor.writer_done = true,
        }

        if completion.failed {
            warn!(
                group_id = self.group_id(),
                task_id = completion.task_id,
                "{} failed, shutting down its peer",
                completion.side
            );
            executor.shutdown(max_wait);
        } else if executor.writer_done && !executor.reader_done {
            // Nothing consumes the channel any more; a reader still sending
            // must not block on it.
            debug!(
                group_id = self.group_id(),
                task_id = completion.task_id,
                "Writer finished first, releasing reader side"
            );
            executor.shutdown(max_wait);
        }

        if executor.is_finished() {
            if let Some(mut executor) = running.shift_remove(&completion.task_id) {
                executor.join();
                self.finish(executor, pending);
            }
        }
    }

    fn expire_overdue(
        &self,
        running: &mut IndexMap<usize, TaskExecutor>,
        pending: &mut VecDeque<Pending>,
    ) {
        let now = Instant::now();
        let overdue: Vec<usize> = running
            .values()
            .filter(|e| e.deadline.is_some_and(|d| d <= now))
            .map(|e| e.task_id)
            .collect();

        for task_id in overdue {
            if let Some(executor) = running.shift_remove(&task_id) {
                error!(
                    group_id = self.group_id(),
                    task_id,
                    "Task threads did not exit within {:?}, detaching",
                    self.config.task_group.task_max_wait()
                );
                executor.counters.fail(Arc::new(SyncError::plugin(
                    ErrorCode::WaitTimeExceed,
                    format!("task {} did not stop in time", task_id),
                )));
                self.finish(executor, pending);
            }
        }
    }

    /// Decide between done and retry for an attempt that left the run set
    fn finish(&self, executor: TaskExecutor, pending: &mut VecDeque<Pending>) {
        let settings = &self.config.task_group;
        let state = executor.counters.state();

        if state.is_failed()
            && executor.supports_failover
            && executor.attempt + 1 < settings.task_max_retry_times
        {
            warn!(
                group_id = self.group_id(),
                task_id = executor.task_id,
                attempt = executor.attempt + 1,
                "Task failed, retrying in {:?}",
                settings.task_retry_interval()
            );
            pending.push_back(Pending {
                index: executor.index,
                attempt: executor.attempt + 1,
                not_before: Instant::now() + settings.task_retry_interval(),
            });
            return;
        }

        if state == TaskState::Running {
            executor.counters.set_state(TaskState::Succeeded);
        }
        info!(
            group_id = self.group_id(),
            task_id = executor.task_id,
            state = %executor.counters.state(),
            "Task finished"
        );
    }

    /// Stop every running attempt and mark it, and every unstarted unit, killed
    fn kill(
        &self,
        running: &mut IndexMap<usize, TaskExecutor>,
        pending: &VecDeque<Pending>,
        rx: &Receiver<Completion>,
        reason: &str,
    ) {
        let max_wait = self.config.task_group.task_max_wait();
        for executor in running.values_mut() {
            executor.shutdown(max_wait);
        }

        let deadline = Instant::now() + max_wait;
        while running.values().any(|e| !e.is_finished()) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match rx.recv_timeout(left) {
                Ok(completion) => {
                    if let Some(executor) = running.get_mut(&completion.task_id) {
                        if executor.attempt == completion.attempt {
                            match completion.side {
                                PluginKind::Reader => executor.reader_done = true,
                                _ => executor.writer_done = true,
                            }
                        }
                    }
                }
                Err(_) => break,
            }
        }

        let killed = || Arc::new(SyncError::plugin(ErrorCode::ShutDownTask, reason));
        for (task_id, mut executor) in running.drain(..) {
            if executor.is_finished() {
                executor.join();
            }
            executor.counters.fail(killed());
            executor.counters.force_state(TaskState::Killed);
            info!(group_id = self.group_id(), task_id, "Task killed");
        }
        for next in pending {
            let task_id = self.group.units[next.index].task_id;
            if let Some(counters) = self.task_counters.get(&task_id) {
                counters.fail(killed());
                counters.force_state(TaskState::Killed);
            }
        }
    }
}

fn spawn_runner<L>(
    name: String,
    mut runner: Runner<L>,
    done: Completion,
    tx: Sender<Completion>,
) -> Result<JoinHandle<()>>
where
    L: crate::runner::Lifecycle + 'static,
{
    let join = thread::Builder::new().name(name).spawn(move || {
        let failed = runner.run().is_err();
        // the container may already have given up on this attempt
        let _ = tx.send(Completion { failed, ..done });
    })?;
    Ok(join)
}

/// Join handle of a group running on its own thread
pub struct GroupHandle {
    group_id: usize,
    counters: Arc<Counters>,
    task_counters: IndexMap<usize, Arc<Counters>>,
    abort: Arc<AtomicBool>,
    join: JoinHandle<Result<()>>,
}

impl GroupHandle {
    pub fn group_id(&self) -> usize {
        self.group_id
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn task_counters(&self) -> &IndexMap<usize, Arc<Counters>> {
        &self.task_counters
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Kill the group's running tasks
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Wait for the group thread
    pub fn join(self) -> Result<()> {
        match self.join.join() {
            Ok(result) => result,
            Err(payload) => Err(SyncError::GroupFailed {
                group_id: self.group_id,
                source: Arc::new(SyncError::Panicked(panic_message(payload.as_ref()))),
            }),
        }
    }
}

/// Runs a [`TaskGroupContainer`] on a dedicated thread.
///
/// A failure escaping the container marks the group failed and is returned
/// as [`SyncError::GroupFailed`].
pub struct TaskGroupRunner;

impl TaskGroupRunner {
    pub fn spawn<T>(container: TaskGroupContainer<T>) -> Result<GroupHandle>
    where
        T: Send + 'static,
    {
        let group_id = container.group_id();
        let counters = container.counters();
        let task_counters = container.task_counters();
        let abort = container.abort_flag();

        let join = thread::Builder::new()
            .name(format!("taskGroup-{}", group_id))
            .spawn(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(|| container.start())) {
                    Ok(result) => result,
                    Err(payload) => Err(SyncError::Panicked(panic_message(payload.as_ref()))),
                };
                outcome.map_err(|e| {
                    error!(group_id, "Task group failed: {}", e);
                    let source = Arc::new(e);
                    container.counters().fail(source.clone());
                    SyncError::GroupFailed { group_id, source }
                })
            })?;

        Ok(GroupHandle {
            group_id,
            counters,
            task_counters,
            abort,
            join,
        })
    }
}
