//! Job scheduler
//!
//! Assigns work units to task groups, runs every group on its own thread,
//! enforces the dirty-record limit while polling and returns a
//! [`JobReport`] once all groups are done.

use crate::assign::{assign_fairly, WorkUnit};
use crate::config::{ErrorLimitConfig, SyncConfig};
use crate::counters::{Counters, CountersSnapshot, Progress, TaskState};
use crate::error::{Result, SyncError};
use crate::group::{GroupHandle, TaskGroupContainer, TaskGroupRunner};
use crate::plugin::TaskFactory;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Dirty-record limit enforcement.
///
/// A record limit takes priority: when both are configured only the record
/// limit applies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorRecordChecker {
    record_limit: Option<u64>,
    percentage_limit: Option<f64>,
}

impl ErrorRecordChecker {
    pub fn new(config: &ErrorLimitConfig) -> Self {
        Self {
            record_limit: config.record,
            percentage_limit: if config.record.is_some() {
                None
            } else {
                config.percentage
            },
        }
    }

    /// Checked on every poll
    pub fn check_record_limit(&self, snapshot: &CountersSnapshot) -> Result<()> {
        let Some(limit) = self.record_limit else {
            return Ok(());
        };
        let errors = snapshot.total_error_records();
        if errors > limit {
            return Err(SyncError::OverLimit(format!(
                "the limit is {} dirty records, but {} were captured",
                limit, errors
            )));
        }
        Ok(())
    }

    /// Checked once the job is done
    pub fn check_percentage_limit(&self, snapshot: &CountersSnapshot) -> Result<()> {
        let Some(limit) = self.percentage_limit else {
            return Ok(());
        };
        let total = snapshot.total_read_records();
        if total == 0 {
            return Ok(());
        }
        let ratio = snapshot.total_error_records() as f64 / total as f64;
        if ratio > limit {
            return Err(SyncError::OverLimit(format!(
                "the limit is {:.4} dirty records per record read, but {:.4} were captured",
                limit, ratio
            )));
        }
        Ok(())
    }
}

/// Outcome of one task group
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub group_id: usize,
    pub channels: usize,
    pub snapshot: CountersSnapshot,
    pub tasks: Vec<(usize, CountersSnapshot)>,
}

/// Outcome of a whole job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub elapsed: Duration,
    pub job: CountersSnapshot,
    pub groups: Vec<GroupReport>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.job.state == TaskState::Succeeded
    }

    pub fn state(&self) -> TaskState {
        self.job.state
    }

    /// Snapshots of every failed or killed task
    pub fn failed_tasks(&self) -> Vec<(usize, &CountersSnapshot)> {
        self.groups
            .iter()
            .flat_map(|g| g.tasks.iter())
            .filter(|(_, s)| s.state.is_failed())
            .map(|(id, s)| (*id, s))
            .collect()
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f64().max(0.001);
        let read = self.job.total_read_records();
        writeln!(f, "Job state          : {}", self.job.state)?;
        writeln!(f, "Total elapsed time : {:.3}s", self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "Average throughput : {}/s",
            crate::counters::human_bytes((self.job.total_read_bytes() as f64 / secs) as u64)
        )?;
        writeln!(f, "Record speed       : {} records/s", (read as f64 / secs) as u64)?;
        writeln!(f, "Total read records : {}", read)?;
        writeln!(f, "Total error records: {}", self.job.total_error_records())?;
        for (task_id, snapshot) in self.failed_tasks() {
            let reason = snapshot
                .failure
                .as_ref()
                .map(|c| format!("{} {}", c.code, c.message))
                .unwrap_or_else(|| "unknown".to_string());
            writeln!(f, "Task {} {}: {}", task_id, snapshot.state, reason)?;
        }
        Ok(())
    }
}

/// Drives a job from work units to a [`JobReport`]
pub struct JobScheduler<T> {
    config: Arc<SyncConfig>,
    factory: Arc<dyn TaskFactory<T>>,
}

impl<T: Send + 'static> JobScheduler<T> {
    /// Validates `config` up front
    pub fn new(config: SyncConfig, factory: Arc<dyn TaskFactory<T>>) -> Result<Self> {
        config.check()?;
        Ok(Self {
            config: Arc::new(config),
            factory,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run every unit. Task failures show up in the report; a group failure,
    /// an exceeded error limit or invalid input fail the call.
    pub fn run(&self, units: Vec<WorkUnit<T>>) -> Result<JobReport> {
        let started = Instant::now();
        let job = &self.config.job;
        let total_tasks = units.len() as u64;
        let groups = assign_fairly(units, job.channels, job.channels_per_group)?;
        info!(
            "Scheduling {} tasks in {} task groups with {} channels",
            total_tasks,
            groups.len(),
            job.channels
        );

        let mut runs: Vec<GroupRun> = Vec::with_capacity(groups.len());
        for group in groups {
            let channels = group.channels;
            let container = TaskGroupContainer::new(group, self.config.clone(), self.factory.clone());
            match TaskGroupRunner::spawn(container) {
                Ok(handle) => runs.push(GroupRun::new(channels, handle)),
                Err(e) => {
                    error!("Failed to start task group: {}", e);
                    abort_all(&mut runs);
                    return Err(e);
                }
            }
        }

        let checker = ErrorRecordChecker::new(&job.error_limit);
        let mut last_report: Option<(Instant, CountersSnapshot)> = None;
        loop {
            if let Some(e) = runs.iter_mut().find_map(|run| run.join_if_finished().err()) {
                error!("Task group failed, aborting the job: {}", e);
                abort_all(&mut runs);
                return Err(e);
            }
            let finished = runs.iter().all(GroupRun::is_joined);
            let snapshot = rollup(&runs).snapshot();

            if let Err(e) = checker.check_record_limit(&snapshot) {
                error!("Dirty record check failed: {}", e);
                abort_all(&mut runs);
                return Err(e);
            }

            let report_due = last_report
                .as_ref()
                .map_or(true, |(at, _)| at.elapsed() >= job.report_interval());
            if report_due || finished {
                let (since, previous) = match &last_report {
                    Some((at, prev)) => (*at, Some(prev)),
                    None => (started, None),
                };
                let progress = Progress::between(previous, &snapshot, since.elapsed(), total_tasks);
                info!("{}", progress);
                last_report = Some((Instant::now(), snapshot));
            }

            if finished {
                break;
            }
            thread::sleep(job.sleep_interval());
        }

        let job_snapshot = rollup(&runs).snapshot();
        let reports: Vec<GroupReport> = runs.into_iter().filter_map(|run| run.report).collect();

        checker.check_record_limit(&job_snapshot)?;
        checker.check_percentage_limit(&job_snapshot)?;

        let report = JobReport {
            elapsed: started.elapsed(),
            job: job_snapshot,
            groups: reports,
        };
        if report.is_success() {
            info!("Job completed in {:?}", report.elapsed);
        } else {
            warn!(
                failed_tasks = report.failed_tasks().len(),
                "Job finished with state {}",
                report.state()
            );
        }
        debug!("Job report:\n{}", report);
        Ok(report)
    }
}

/// A spawned group, joined as soon as its thread is done
struct GroupRun {
    channels: usize,
    counters: Arc<Counters>,
    handle: Option<GroupHandle>,
    report: Option<GroupReport>,
}

impl GroupRun {
    fn new(channels: usize, handle: GroupHandle) -> Self {
        Self {
            channels,
            counters: handle.counters().clone(),
            handle: Some(handle),
            report: None,
        }
    }

    fn is_joined(&self) -> bool {
        self.handle.is_none()
    }

    fn join_if_finished(&mut self) -> Result<()> {
        if !self.handle.as_ref().is_some_and(GroupHandle::is_finished) {
            return Ok(());
        }
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.report = Some(group_report(self.channels, &handle));
        handle.join()
    }
}

fn rollup(runs: &[GroupRun]) -> Counters {
    Counters::rollup(runs.iter().map(|run| run.counters.as_ref()))
}

/// Abort and join every group still running
fn abort_all(runs: &mut [GroupRun]) {
    let handles: Vec<GroupHandle> = runs.iter_mut().filter_map(|run| run.handle.take()).collect();
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            warn!("Task group failed during abort: {}", e);
        }
    }
}

fn group_report(channels: usize, handle: &GroupHandle) -> GroupReport {
    GroupReport {
        group_id: handle.group_id(),
        channels,
        snapshot: handle.counters().snapshot(),
        tasks: handle
            .task_counters()
            .iter()
            .map(|(id, c)| (*id, c.snapshot()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterKey;
    use crate::testing::{work_units, MockTask, MockTaskFactory};

    fn snapshot(read: u64, dirty: u64) -> CountersSnapshot {
        let counters = Counters::new();
        counters.increase(CounterKey::ReadSucceedRecords, read - dirty);
        counters.increase(CounterKey::ReadFailedRecords, dirty);
        counters.snapshot()
    }

    fn fast_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.job.sleep_interval_ms = 5;
        config.job.report_interval_ms = 20;
        config.task_group.sleep_interval_ms = 5;
        config
    }

    #[test]
    fn test_record_limit_takes_priority() {
        let checker = ErrorRecordChecker::new(&ErrorLimitConfig {
            record: Some(2),
            percentage: Some(0.0),
        });
        assert!(checker.check_record_limit(&snapshot(100, 2)).is_ok());
        assert!(checker.check_percentage_limit(&snapshot(100, 2)).is_ok());

        let err = checker.check_record_limit(&snapshot(100, 3)).unwrap_err();
        assert!(matches!(err, SyncError::OverLimit(_)));
    }

    #[test]
    fn test_percentage_limit() {
        let checker = ErrorRecordChecker::new(&ErrorLimitConfig {
            record: None,
            percentage: Some(0.1),
        });
        assert!(checker.check_percentage_limit(&snapshot(100, 10)).is_ok());
        assert!(checker.check_percentage_limit(&snapshot(100, 11)).is_err());
        assert!(checker.check_percentage_limit(&snapshot(0, 0)).is_ok());
        assert!(checker.check_record_limit(&snapshot(100, 50)).is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SyncConfig::default();
        config.job.channels = 0;
        let factory: Arc<dyn TaskFactory<MockTask>> = Arc::new(MockTaskFactory::new());
        assert!(JobScheduler::new(config, factory).is_err());
    }

    #[test]
    fn test_job_report() {
        let mut config = fast_config();
        config.job.channels = 3;
        config.job.channels_per_group = 2;
        let factory = MockTaskFactory::new();
        let scheduler = JobScheduler::new(config, Arc::new(factory.clone())).unwrap();

        let tasks = (0..4).map(|_| MockTask::new().with_records(25)).collect();
        let report = scheduler.run(work_units(tasks)).unwrap();

        assert!(report.is_success());
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].channels, 2);
        assert_eq!(report.groups[1].channels, 1);
        assert_eq!(report.job.total_read_records(), 100);
        assert_eq!(report.job.get(CounterKey::Stage), 4);
        assert_eq!(factory.written().len(), 100);
        assert!(report.to_string().contains("Total read records : 100"));
        assert!(serde_json::to_string(&report).is_ok());
    }

    #[test]
    fn test_failed_task_reported_not_raised() {
        let factory = MockTaskFactory::new();
        let scheduler = JobScheduler::new(fast_config(), Arc::new(factory)).unwrap();

        let tasks = vec![
            MockTask::new().with_records(5),
            MockTask::new().with_records(5).fail_reader_at(2),
        ];
        let report = scheduler.run(work_units(tasks)).unwrap();

        assert_eq!(report.state(), TaskState::Failed);
        let failed = report.failed_tasks();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, 1);
        assert!(report.to_string().contains("Task 1 failed"));
    }

    #[test]
    fn test_group_failure_aborts_other_groups() {
        let mut config = fast_config();
        config.job.channels = 2;
        config.job.channels_per_group = 1;
        config.task_group.task_max_wait_ms = 2_000;
        let scheduler = JobScheduler::new(config, Arc::new(MockTaskFactory::new())).unwrap();

        let tasks = vec![
            MockTask::new()
                .with_records(1_000_000)
                .with_read_delay(Duration::from_millis(1)),
            MockTask::new().with_records(1).panic_create(),
        ];
        let started = Instant::now();
        let err = scheduler.run(work_units(tasks)).unwrap_err();

        assert!(matches!(err, SyncError::GroupFailed { .. }));
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "job kept running for {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_empty_job_rejected() {
        let scheduler =
            JobScheduler::new(fast_config(), Arc::new(MockTaskFactory::new())).unwrap();
        assert!(matches!(
            scheduler.run(Vec::new()),
            Err(SyncError::Config(_))
        ));
    }
}
