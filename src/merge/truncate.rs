//! Background writer pool for truncated outputs.
//!
//! The pool starts on the first pushed item. Pushing blocks while the
//! bounded queue is full. [`MultiTruncateWriterScheduler::wait_finished`]
//! closes the queue, joins the workers and reports the outcome; calling it
//! again returns the same outcome.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;

use crate::error::{Result, TesseraError};
use crate::merge::work_item::MergeWorkItem;

#[derive(Debug, Default)]
struct Outcome {
    completed: usize,
    failed: Vec<String>,
}

#[derive(Debug)]
pub struct MultiTruncateWriterScheduler {
    thread_count: usize,
    queue_capacity: usize,
    sender: Option<Sender<Box<dyn MergeWorkItem>>>,
    workers: Vec<JoinHandle<()>>,
    outcome: Arc<Mutex<Outcome>>,
    finished: bool,
}

impl MultiTruncateWriterScheduler {
    pub fn new(thread_count: usize, queue_capacity: usize) -> Self {
        MultiTruncateWriterScheduler {
            thread_count: thread_count.max(1),
            queue_capacity: queue_capacity.max(1),
            sender: None,
            workers: Vec::new(),
            outcome: Arc::new(Mutex::new(Outcome::default())),
            finished: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.sender.is_some() || !self.workers.is_empty()
    }

    fn start(&mut self) -> Sender<Box<dyn MergeWorkItem>> {
        let (sender, receiver) = bounded::<Box<dyn MergeWorkItem>>(self.queue_capacity);
        for index in 0..self.thread_count {
            let receiver = receiver.clone();
            let outcome = Arc::clone(&self.outcome);
            let handle = thread::Builder::new()
                .name(format!("truncate-writer-{index}"))
                .spawn(move || {
                    for mut item in receiver.iter() {
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            item.process()
                        }));
                        let mut outcome = outcome.lock();
                        match result {
                            Ok(Ok(())) => outcome.completed += 1,
                            Ok(Err(e)) => {
                                log::error!("truncate work item {} failed: {e}", item.name());
                                outcome.failed.push(item.name().to_string());
                            }
                            Err(_) => {
                                log::error!("truncate work item {} panicked", item.name());
                                outcome.failed.push(item.name().to_string());
                            }
                        }
                    }
                });
            match handle {
                Ok(handle) => self.workers.push(handle),
                Err(e) => log::error!("failed to start truncate writer thread: {e}"),
            }
        }
        log::debug!("started {} truncate writer threads", self.workers.len());
        self.sender = Some(sender.clone());
        sender
    }

    /// Queue `item`, starting the pool if needed. Blocks while the queue
    /// is full.
    pub fn push_work_item(&mut self, item: Box<dyn MergeWorkItem>) -> Result<()> {
        if self.finished {
            return Err(TesseraError::invalid_operation(
                "truncate writer scheduler already finished",
            ));
        }
        let sender = match &self.sender {
            Some(sender) => sender.clone(),
            None => self.start(),
        };
        if self.workers.is_empty() {
            return Err(TesseraError::internal("no truncate writer threads running"));
        }
        sender
            .send(item)
            .map_err(|e| TesseraError::internal(format!("truncate queue closed: {}", e.0.name())))
    }

    /// Wait for all queued items.
    pub fn wait_finished(&mut self) -> Result<usize> {
        if !self.finished {
            self.sender = None;
            for handle in self.workers.drain(..) {
                if handle.join().is_err() {
                    self.outcome.lock().failed.push("worker".to_string());
                }
            }
            self.finished = true;
        }
        let outcome = self.outcome.lock();
        if outcome.failed.is_empty() {
            Ok(outcome.completed)
        } else {
            Err(TesseraError::internal(format!(
                "{} truncate work item(s) failed: {}",
                outcome.failed.len(),
                outcome.failed.join(", ")
            )))
        }
    }
}

impl Drop for MultiTruncateWriterScheduler {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.wait_finished();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::merge::work_item::FnWorkItem;

    #[test]
    fn test_lazy_start_and_idempotent_wait() {
        let mut scheduler = MultiTruncateWriterScheduler::new(2, 1);
        assert!(!scheduler.is_started());
        assert_eq!(scheduler.wait_finished().unwrap(), 0);

        let mut scheduler = MultiTruncateWriterScheduler::new(2, 1);
        let count = Arc::new(AtomicUsize::new(0));
        for i in 0..8 {
            let count = Arc::clone(&count);
            scheduler
                .push_work_item(FnWorkItem::boxed(format!("t{i}"), 0, move || {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        assert!(scheduler.is_started());
        assert_eq!(scheduler.wait_finished().unwrap(), 8);
        assert_eq!(scheduler.wait_finished().unwrap(), 8);
        assert_eq!(count.load(Ordering::SeqCst), 8);
        assert!(scheduler.push_work_item(FnWorkItem::boxed("late", 0, || Ok(()))).is_err());
    }

    #[test]
    fn test_failure_reported_as_internal() {
        let mut scheduler = MultiTruncateWriterScheduler::new(1, 4);
        scheduler
            .push_work_item(FnWorkItem::boxed("ok", 0, || Ok(())))
            .unwrap();
        scheduler
            .push_work_item(FnWorkItem::boxed("broken", 0, || {
                Err(TesseraError::corrupt("bad"))
            }))
            .unwrap();

        let err = scheduler.wait_finished().unwrap_err();
        assert!(matches!(err, TesseraError::Internal(_)));
        assert!(scheduler.wait_finished().is_err());
    }
}
