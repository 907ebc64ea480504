//! Deferred notification delivery.
//!
//! Sessions never call `on_interface_down` while holding their lock. Instead
//! they post it here, and a single consumer drains the queue in FIFO order,
//! either synchronously through [`NotifyQueue::run_pending`] or on a tokio task
//! started with [`NotifyQueue::spawn`].

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, trace};
use tokio::{sync::Notify, task::JoinHandle, time};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Interval at which an idle consumer re-checks whether producers are gone
const IDLE_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Single-consumer FIFO of deferred notifications.
pub struct NotifyQueue {
   queue: SegQueue<Task>,
   notifier: Notify,
   drain_lock: parking_lot::Mutex<()>,
}

impl NotifyQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         drain_lock: parking_lot::Mutex::new(()),
      })
   }

   /// Enqueues a task for later delivery.
   pub fn post<F>(&self, task: F)
   where
      F: FnOnce() + Send + 'static,
   {
      self.queue.push(Box::new(task));
      self.notifier.notify_waiters();
   }

   pub fn len(&self) -> usize {
      self.queue.len()
   }

   pub fn is_empty(&self) -> bool {
      self.queue.is_empty()
   }

   /// Runs every queued task on the calling thread. Returns how many ran.
   ///
   /// Concurrent drains are serialized so tasks keep their posting order.
   pub fn run_pending(&self) -> usize {
      let _drain = self.drain_lock.lock();
      let mut count = 0;
      while let Some(task) = self.queue.pop() {
         task();
         count += 1;
      }
      if count > 0 {
         trace!("Ran {count} deferred notification(s)");
      }
      count
   }

   fn run_one(&self, task: Task) {
      let _drain = self.drain_lock.lock();
      task();
   }

   async fn recv(self: &Arc<Self>) -> Option<Task> {
      loop {
         if let Some(task) = self.queue.pop() {
            return Some(task);
         }
         let notify = self.notifier.notified();
         if let Some(task) = self.queue.pop() {
            return Some(task);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(IDLE_RECHECK_INTERVAL, notify).await;
      }
   }

   /// Starts a tokio consumer for this queue.
   ///
   /// The consumer exits once the queue is empty and every other handle to it
   /// has been dropped.
   pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
      let this = self.clone();
      tokio::spawn(async move {
         while let Some(task) = this.recv().await {
            this.run_one(task);
         }
         debug!("Notification queue consumer finished");
      })
   }
}
