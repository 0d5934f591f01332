use crate::types::JobId;
use std::collections::{HashSet, VecDeque};

/// FIFO admission control with a fixed number of execution slots.
///
/// Jobs wait in submission order; a job is admitted only while fewer than
/// `capacity` jobs hold a slot.
#[derive(Debug)]
pub struct AdmissionQueue {
    capacity: usize,
    waiting: VecDeque<JobId>,
    running: HashSet<JobId>,
}

impl AdmissionQueue {
    /// A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            waiting: VecDeque::new(),
            running: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a job to the back of the queue.
    pub fn enqueue(&mut self, job_id: JobId) {
        if !self.waiting.contains(&job_id) && !self.running.contains(&job_id) {
            self.waiting.push_back(job_id);
        }
    }

    /// Pop the oldest waiting job into a slot, if one is free.
    pub fn admit_next(&mut self) -> Option<JobId> {
        if self.running.len() >= self.capacity {
            return None;
        }
        let job_id = self.waiting.pop_front()?;
        self.running.insert(job_id);
        Some(job_id)
    }

    /// Take a job out of the waiting line. False if it was not waiting.
    pub fn withdraw(&mut self, job_id: JobId) -> bool {
        match self.waiting.iter().position(|id| *id == job_id) {
            Some(pos) => {
                self.waiting.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Free the slot held by `job_id`. Idempotent.
    pub fn release(&mut self, job_id: JobId) -> bool {
        self.running.remove(&job_id)
    }

    /// 0-based place in the waiting line.
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        self.waiting.iter().position(|id| *id == job_id)
    }

    pub fn is_waiting(&self, job_id: JobId) -> bool {
        self.waiting.contains(&job_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }
}
