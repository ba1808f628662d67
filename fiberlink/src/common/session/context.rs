// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  future::Future,
  panic::AssertUnwindSafe,
  sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::{
  runtime::Handle,
  sync::mpsc::{self, UnboundedSender},
  task::JoinHandle,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
  sender: Option<UnboundedSender<Job>>,
  worker: Option<JoinHandle<()>>,
}

/// The single serial queue that drives a session's observable work
///
/// Jobs posted here run one at a time, in the order they were posted, on a
/// worker task owned by the context. Network stages are spawned onto the same
/// runtime but never run user callbacks directly; they post them here.
pub struct ExecutionContext {
  runtime: Handle,
  queue: Mutex<Queue>,
}

impl std::fmt::Debug for ExecutionContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecutionContext")
      .field("running", &self.is_running())
      .finish_non_exhaustive()
  }
}

impl ExecutionContext {
  pub fn new(runtime: Handle) -> Self {
    Self {
      runtime,
      queue: Mutex::new(Queue::default()),
    }
  }

  /// Binds to the runtime of the calling task
  ///
  /// Panics when called outside of a tokio runtime.
  pub fn current() -> Self {
    Self::new(Handle::current())
  }

  pub fn runtime(&self) -> &Handle {
    &self.runtime
  }

  fn queue(&self) -> MutexGuard<'_, Queue> {
    self.queue.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Opens the queue; returns `false` if it was already open
  ///
  /// A queue reopened after [stop](Self::stop) only begins once the jobs
  /// left in the previous one have drained, so posted work never overlaps.
  pub fn start(&self) -> bool {
    let mut queue = self.queue();
    if queue.sender.is_some() {
      return false;
    }
    let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
    let previous = queue.worker.take();
    let worker = self.runtime.spawn(async move {
      if let Some(previous) = previous {
        let _ = previous.await;
      }
      while let Some(job) = receiver.recv().await {
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
          tracing::error!("execution_context_job_panicked");
        }
      }
      tracing::trace!("execution_context_drained");
    });
    queue.sender = Some(sender);
    queue.worker = Some(worker);
    true
  }

  /// Closes the queue; jobs already posted still run
  pub fn stop(&self) -> bool {
    self.queue().sender.take().is_some()
  }

  pub fn is_running(&self) -> bool {
    self.queue().sender.is_some()
  }

  /// Queues `job` behind everything posted so far
  ///
  /// Returns `false`, dropping the job, when the queue is closed.
  pub fn post<F>(&self, job: F) -> bool
  where
    F: FnOnce() + Send + 'static,
  {
    let sender = self.queue().sender.clone();
    match sender {
      Some(sender) => sender.send(Box::new(job)).is_ok(),
      None => false,
    }
  }

  /// Runs `future` on the context's runtime, outside of the serial queue
  pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    self.runtime.spawn(future)
  }

  /// Resolves once every job posted before the queue closed has run
  pub async fn drained(&self) {
    let worker = self.queue().worker.take();
    if let Some(worker) = worker {
      let _ = worker.await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::ExecutionContext;
  use std::{
    sync::{Arc, Mutex},
    time::Duration,
  };

  #[tokio::test]
  async fn jobs_run_in_post_order() {
    let context = ExecutionContext::current();
    assert!(context.start());
    assert!(!context.start(), "Start is idempotent while running");
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..16 {
      let seen = Arc::clone(&seen);
      assert!(context.post(move || seen.lock().unwrap().push(i)));
    }
    assert!(context.stop());
    assert!(!context.stop());
    tokio::time::timeout(Duration::from_secs(5), context.drained())
      .await
      .expect("Queue must drain after stop");
    assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn posting_to_a_closed_queue_drops_the_job() {
    let context = ExecutionContext::current();
    assert!(!context.post(|| panic!("Must never run")));
    context.start();
    context.stop();
    assert!(!context.post(|| panic!("Must never run")));
  }

  #[tokio::test]
  async fn restarted_queue_follows_the_previous_one() {
    let context = ExecutionContext::current();
    let seen = Arc::new(Mutex::new(Vec::new()));
    context.start();
    {
      let seen = Arc::clone(&seen);
      context.post(move || {
        std::thread::sleep(Duration::from_millis(20));
        seen.lock().unwrap().push("first");
      });
    }
    context.stop();
    context.start();
    {
      let seen = Arc::clone(&seen);
      context.post(move || seen.lock().unwrap().push("second"));
    }
    context.stop();
    tokio::time::timeout(Duration::from_secs(5), context.drained())
      .await
      .expect("Queue must drain after stop");
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
  }

  #[tokio::test]
  async fn panicking_job_does_not_stop_the_queue() {
    let context = ExecutionContext::current();
    let seen = Arc::new(Mutex::new(false));
    context.start();
    context.post(|| panic!("job failure"));
    {
      let seen = Arc::clone(&seen);
      context.post(move || *seen.lock().unwrap() = true);
    }
    context.stop();
    tokio::time::timeout(Duration::from_secs(5), context.drained())
      .await
      .expect("Queue must drain after stop");
    assert!(*seen.lock().unwrap());
  }
}
