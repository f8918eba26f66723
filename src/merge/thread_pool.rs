//! Merge schedulers.
//!
//! [`ResourceControlThreadPool`] runs work items on a fixed set of worker
//! threads while the sum of the running items' declared memory stays under
//! a ceiling. Admission scans the pending queue for the first item that fits,
//! so a large item waiting for room does not hold back smaller ones behind
//! it. [`SimpleMergeScheduler`] runs everything on the calling thread.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::config::{MergeConfig, SchedulerKind};
use crate::error::{Result, TesseraError};
use crate::merge::file_system::MergeFileSystem;
use crate::merge::work_item::MergeWorkItem;

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub completed: usize,
    pub failed: Vec<String>,
    /// Ceiling actually enforced, after any raise.
    pub resource_ceiling: u64,
    /// Highest sum of running items' resources observed.
    pub peak_resource: u64,
    pub published_files: usize,
    pub elapsed_ms: u64,
}

/// Something that can run a batch of merge work items.
pub trait MergeScheduler: Send + Sync {
    /// Run every item and publish their output. Fails with `Internal` when
    /// any item failed; the remaining items still run.
    fn run(
        &self,
        items: Vec<Box<dyn MergeWorkItem>>,
        file_system: &MergeFileSystem,
    ) -> Result<SchedulerStats>;
}

/// Build the scheduler selected by `config`.
pub fn create_scheduler(config: &MergeConfig) -> Box<dyn MergeScheduler> {
    match config.scheduler {
        SchedulerKind::Simple => Box::new(SimpleMergeScheduler),
        SchedulerKind::ResourceControl => Box::new(ResourceControlThreadPool::new(
            config.thread_count,
            config.max_memory_bytes(),
        )),
    }
}

fn failure_error(failed: &[String]) -> TesseraError {
    TesseraError::internal(format!(
        "{} merge work item(s) failed: {}",
        failed.len(),
        failed.join(", ")
    ))
}

fn run_item(item: &mut dyn MergeWorkItem) -> std::result::Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| item.process())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("panicked: {message}"))
        }
    }
}

/// Runs items one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleMergeScheduler;

impl MergeScheduler for SimpleMergeScheduler {
    fn run(
        &self,
        items: Vec<Box<dyn MergeWorkItem>>,
        file_system: &MergeFileSystem,
    ) -> Result<SchedulerStats> {
        let start = Instant::now();
        let mut stats = SchedulerStats::default();
        for mut item in items {
            let required = item.required_resource();
            stats.peak_resource = stats.peak_resource.max(required);
            stats.resource_ceiling = stats.resource_ceiling.max(required);
            match run_item(item.as_mut()) {
                Ok(()) => stats.completed += 1,
                Err(e) => {
                    log::error!("merge work item {} failed: {e}", item.name());
                    stats.failed.push(item.name().to_string());
                }
            }
        }
        stats.published_files = file_system.commit()?;
        stats.elapsed_ms = start.elapsed().as_millis() as u64;

        if stats.failed.is_empty() {
            Ok(stats)
        } else {
            Err(failure_error(&stats.failed))
        }
    }
}

struct PoolState {
    pending: VecDeque<Box<dyn MergeWorkItem>>,
    running_resource: u64,
    peak_resource: u64,
    completed: usize,
    failed: Vec<String>,
    published_files: usize,
}

/// Worker pool bounded by a memory ceiling.
#[derive(Debug, Clone)]
pub struct ResourceControlThreadPool {
    thread_count: usize,
    resource_ceiling: u64,
}

impl ResourceControlThreadPool {
    pub fn new(thread_count: usize, resource_ceiling: u64) -> Self {
        ResourceControlThreadPool {
            thread_count: thread_count.max(1),
            resource_ceiling,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn resource_ceiling(&self) -> u64 {
        self.resource_ceiling
    }

    /// Take the first pending item that fits next to the running ones.
    /// Blocks while nothing fits; `None` once the queue is empty.
    fn admit(
        state: &Mutex<PoolState>,
        changed: &Condvar,
        ceiling: u64,
    ) -> Option<Box<dyn MergeWorkItem>> {
        let mut guard = state.lock();
        loop {
            if guard.pending.is_empty() {
                return None;
            }
            let running = guard.running_resource;
            let fit = guard
                .pending
                .iter()
                .position(|item| running + item.required_resource() <= ceiling);
            if let Some(index) = fit {
                let item = guard.pending.remove(index)?;
                guard.running_resource += item.required_resource();
                guard.peak_resource = guard.peak_resource.max(guard.running_resource);
                return Some(item);
            }
            changed.wait(&mut guard);
        }
    }

    fn worker(state: &Mutex<PoolState>, changed: &Condvar, ceiling: u64, fs: &MergeFileSystem) {
        while let Some(mut item) = Self::admit(state, changed, ceiling) {
            let required = item.required_resource();
            let outcome = run_item(item.as_mut());

            let mut guard = state.lock();
            guard.running_resource -= required;
            match outcome {
                Ok(()) => guard.completed += 1,
                Err(e) => {
                    log::error!("merge work item {} failed: {e}", item.name());
                    guard.failed.push(item.name().to_string());
                }
            }
            drop(guard);
            changed.notify_all();
        }

        match fs.commit() {
            Ok(count) => state.lock().published_files += count,
            Err(e) => {
                log::error!("merge worker failed to publish its output: {e}");
                state.lock().failed.push("commit".to_string());
            }
        }
    }
}

impl MergeScheduler for ResourceControlThreadPool {
    fn run(
        &self,
        items: Vec<Box<dyn MergeWorkItem>>,
        file_system: &MergeFileSystem,
    ) -> Result<SchedulerStats> {
        let start = Instant::now();
        let max_required = items
            .iter()
            .map(|item| item.required_resource())
            .max()
            .unwrap_or(0);
        let mut ceiling = self.resource_ceiling;
        if max_required > ceiling {
            log::warn!(
                "merge work item needs {max_required} bytes, above the ceiling of {ceiling}; raising the ceiling"
            );
            ceiling = max_required;
        }

        let workers = self.thread_count.min(items.len()).max(1);
        log::debug!(
            "running {} merge work items on {workers} threads, ceiling {ceiling}",
            items.len()
        );

        let state = Mutex::new(PoolState {
            pending: items.into(),
            running_resource: 0,
            peak_resource: 0,
            completed: 0,
            failed: Vec::new(),
            published_files: 0,
        });
        let changed = Condvar::new();

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| Self::worker(&state, &changed, ceiling, file_system));
            }
        });

        let state = state.into_inner();
        let stats = SchedulerStats {
            completed: state.completed,
            failed: state.failed,
            resource_ceiling: ceiling,
            peak_resource: state.peak_resource,
            published_files: state.published_files,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        if stats.failed.is_empty() {
            Ok(stats)
        } else {
            Err(failure_error(&stats.failed))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::merge::work_item::FnWorkItem;
    use crate::storage::{MemoryStorage, Storage, write_atomic};

    fn file_system() -> (Arc<dyn Storage>, MergeFileSystem) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let fs = MergeFileSystem::new(Arc::clone(&storage));
        (storage, fs)
    }

    #[test]
    fn test_items_above_ceiling_still_run() {
        let (_, fs) = file_system();
        let done = Arc::new(AtomicUsize::new(0));
        let items: Vec<Box<dyn MergeWorkItem>> = [10u64, 10, 50]
            .iter()
            .enumerate()
            .map(|(i, &bytes)| {
                let done = Arc::clone(&done);
                FnWorkItem::boxed(format!("item{i}"), bytes, move || {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let pool = ResourceControlThreadPool::new(3, 20);
        let stats = pool.run(items, &fs).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.resource_ceiling, 50);
        assert!(stats.peak_resource <= 50);
    }

    #[test]
    fn test_failure_does_not_stop_siblings() {
        let (_, fs) = file_system();
        let done = Arc::new(AtomicUsize::new(0));
        let mut items: Vec<Box<dyn MergeWorkItem>> = vec![
            FnWorkItem::boxed("bad", 1, || Err(TesseraError::corrupt("broken input"))),
            FnWorkItem::boxed("panics", 1, || panic!("boom")),
        ];
        for i in 0..4 {
            let done = Arc::clone(&done);
            items.push(FnWorkItem::boxed(format!("good{i}"), 1, move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let pool = ResourceControlThreadPool::new(2, 2);
        let err = pool.run(items, &fs).unwrap_err();
        assert!(matches!(err, TesseraError::Internal(_)));
        assert!(err.to_string().contains("bad"));
        assert!(err.to_string().contains("panics"));
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_output_published_per_worker() {
        let (storage, fs) = file_system();
        let fs = Arc::new(fs);
        let items: Vec<Box<dyn MergeWorkItem>> = (0..6)
            .map(|i| {
                let fs = Arc::clone(&fs);
                FnWorkItem::boxed(format!("w{i}"), 1, move || {
                    fs.stage(&format!("segment_9/out{i}"), |s, name| {
                        write_atomic(s, name, b"v")
                    })
                })
            })
            .collect();

        let stats = ResourceControlThreadPool::new(3, 100).run(items, &fs).unwrap();
        assert_eq!(stats.published_files, 6);
        for i in 0..6 {
            assert!(storage.file_exists(&format!("segment_9/out{i}")));
        }
    }

    #[test]
    fn test_simple_scheduler_commits_once() {
        let (storage, fs) = file_system();
        let fs = Arc::new(fs);
        let items: Vec<Box<dyn MergeWorkItem>> = (0..3)
            .map(|i| {
                let fs = Arc::clone(&fs);
                FnWorkItem::boxed(format!("s{i}"), 5, move || {
                    fs.stage(&format!("segment_2/f{i}"), |s, name| write_atomic(s, name, b"v"))
                })
            })
            .collect();

        let stats = SimpleMergeScheduler.run(items, &fs).unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.published_files, 3);
        assert!(storage.file_exists("segment_2/f2"));
    }
}
