//! Host-side task queue of one join.
//!
//! Tasks wait in `pending` until a launch slot is free; at most `cap` tasks
//! run on the devices at once. Tasks sent back for a retry go to the front
//! so a range is finished before new outer rows are read. Result chunks of
//! completed tasks queue in `completed` until the caller consumes them.

use std::collections::{HashMap, VecDeque};

use crate::chunk::ColumnarChunk;
use crate::task::JoinTask;

pub struct TaskQueue {
    cap: usize,
    pending: VecDeque<JoinTask>,
    running: HashMap<u64, JoinTask>,
    completed: VecDeque<ColumnarChunk>,
}

impl TaskQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            pending: VecDeque::new(),
            running: HashMap::new(),
            completed: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn push_pending(&mut self, task: JoinTask) {
        self.pending.push_back(task);
    }

    /// Requeue ahead of everything else.
    pub fn push_front(&mut self, task: JoinTask) {
        self.pending.push_front(task);
    }

    pub fn pop_pending(&mut self) -> Option<JoinTask> {
        self.pending.pop_front()
    }

    pub fn has_slot(&self) -> bool {
        self.running.len() < self.cap
    }

    /// Track a launched task under its callback token; hands the task back
    /// when every slot is taken.
    pub fn try_push_running(&mut self, token: u64, task: JoinTask) -> Result<(), JoinTask> {
        if !self.has_slot() {
            return Err(task);
        }
        self.running.insert(token, task);
        Ok(())
    }

    pub fn take_running(&mut self, token: u64) -> Option<JoinTask> {
        self.running.remove(&token)
    }

    pub fn push_completed(&mut self, chunk: ColumnarChunk) {
        self.completed.push_back(chunk);
    }

    pub fn pop_completed(&mut self) -> Option<ColumnarChunk> {
        self.completed.pop_front()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_completed(&self) -> usize {
        self.completed.len()
    }

    /// Nothing queued or in flight; completed chunks may remain.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    /// Remove every pending and running task, for teardown.
    pub fn drain_tasks(&mut self) -> Vec<JoinTask> {
        let mut out: Vec<JoinTask> = self.pending.drain(..).collect();
        out.extend(self.running.drain().map(|(_, t)| t));
        out
    }

    pub fn clear(&mut self) -> Vec<JoinTask> {
        self.completed.clear();
        self.drain_tasks()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("cap", &self.cap)
            .field("pending", &self.pending.len())
            .field("running", &self.running.len())
            .field("completed", &self.completed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_chunks_are_fifo() {
        let mut q = TaskQueue::with_capacity(0);
        assert_eq!(q.capacity(), 1);
        q.push_completed(ColumnarChunk::new_row(1, 64));
        q.push_completed(ColumnarChunk::new_row(2, 64));
        assert_eq!(q.num_completed(), 2);
        assert_eq!(q.pop_completed().map(|c| c.ncols()), Some(1));
        assert_eq!(q.pop_completed().map(|c| c.ncols()), Some(2));
        assert!(q.pop_completed().is_none());
        assert!(q.is_idle());
    }
}
