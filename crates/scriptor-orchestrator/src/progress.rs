use crate::types::{Job, JobStatus, ProgressEvent, Stage, StageStatus};
use chrono::Utc;

/// Weighted completion of a stage list, in 0–100.
///
/// Succeeded and skipped stages count their full weight; running and failed
/// stages count `weight × percent / 100`; pending stages count nothing.
pub fn aggregate_percent(stages: &[Stage]) -> f64 {
    let total: f64 = stages.iter().map(|s| f64::from(s.weight)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let earned: f64 = stages
        .iter()
        .map(|s| {
            let weight = f64::from(s.weight);
            match s.status {
                StageStatus::Succeeded | StageStatus::Skipped => weight,
                StageStatus::Running | StageStatus::Failed => weight * s.percent / 100.0,
                StageStatus::Pending => 0.0,
            }
        })
        .sum();
    (earned / total * 100.0).clamp(0.0, 100.0)
}

/// Per-job event sequencer.
///
/// Keeps `Job::progress` monotonic and decides which changes become events:
/// every status change does, plain progress only once it has moved by at
/// least `min_delta` points since the last event (or reached 100).
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    min_delta: f64,
    seq: u64,
    last_percent: Option<f64>,
    last_status: Option<JobStatus>,
    last_stage: Option<(usize, StageStatus)>,
}

impl ProgressTracker {
    pub fn new(min_delta: f64) -> Self {
        Self {
            min_delta: min_delta.max(0.0),
            seq: 0,
            last_percent: None,
            last_status: None,
            last_stage: None,
        }
    }

    /// Sequence number of the last emitted event; 0 before the first.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// A job or stage status changed.
    pub fn on_transition(
        &mut self,
        job: &mut Job,
        stage: Option<usize>,
        message: impl Into<String>,
    ) -> Option<ProgressEvent> {
        self.observe(job, stage, message.into(), false)
    }

    /// Stage-local progress moved; coalesced by `min_delta`.
    pub fn on_progress(
        &mut self,
        job: &mut Job,
        stage: usize,
        message: impl Into<String>,
    ) -> Option<ProgressEvent> {
        self.observe(job, Some(stage), message.into(), true)
    }

    fn observe(
        &mut self,
        job: &mut Job,
        stage: Option<usize>,
        message: String,
        coalesce: bool,
    ) -> Option<ProgressEvent> {
        let computed = aggregate_percent(&job.stages);
        if computed > job.progress {
            job.progress = computed;
        }
        let percent = job.progress;
        let status = job.status();
        let stage_idx = stage.or(job.current_stage);
        let stage_ref = stage_idx.and_then(|idx| job.stages.get(idx));
        let stage_key = stage_ref.map(|s| (s.position, s.status));

        let status_changed = self.last_status != Some(status);
        let stage_changed = stage_key.is_some() && stage_key != self.last_stage;
        let advanced = match self.last_percent {
            None => true,
            Some(last) if coalesce => {
                percent - last >= self.min_delta || (percent >= 100.0 && last < 100.0)
            }
            Some(last) => percent > last,
        };
        if !(status_changed || stage_changed || advanced) {
            return None;
        }

        self.seq += 1;
        self.last_percent = Some(percent);
        self.last_status = Some(status);
        if stage_key.is_some() {
            self.last_stage = stage_key;
        }

        Some(ProgressEvent {
            job_id: job.id,
            seq: self.seq,
            status,
            stage: stage_ref.map(|s| s.name.clone()),
            stage_status: stage_ref.map(|s| s.status),
            stage_percent: stage_ref.map_or(0.0, |s| s.percent),
            aggregate_percent: percent,
            message,
            error: if status == JobStatus::Failed {
                job.error.clone()
            } else {
                None
            },
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::profiles::{StageTemplate, WorkflowProfile};
    use serde_json::json;

    fn job() -> Job {
        let profile = WorkflowProfile::new(
            "express",
            vec![
                StageTemplate::new("discovery", 40),
                StageTemplate::new("drafting", 30),
                StageTemplate::new("build", 30),
            ],
        );
        let mut job = Job::new(&profile, json!({}));
        job.admit().unwrap();
        job
    }

    #[test]
    fn test_weighted_aggregate() {
        let mut job = job();
        job.begin_stage(0).unwrap();
        job.succeed_stage(0).unwrap();
        job.begin_stage(1).unwrap();
        job.stage_progress(1, 50.0);
        let pct = aggregate_percent(&job.stages);
        assert!((pct - 55.0).abs() < 1e-9, "got {pct}");
    }

    #[test]
    fn test_skipped_counts_full_weight() {
        let mut job = job();
        job.begin_stage(0).unwrap();
        job.skip_stage(0, "unavailable").unwrap();
        assert!((aggregate_percent(&job.stages) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_and_zero_weight() {
        assert_eq!(aggregate_percent(&[]), 0.0);
    }

    #[test]
    fn test_first_observation_emits() {
        let mut job = job();
        let mut tracker = ProgressTracker::new(5.0);
        let event = tracker.on_transition(&mut job, None, "admitted").unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.status, JobStatus::Running);
        assert!(event.stage.is_none());
    }

    #[test]
    fn test_progress_is_coalesced() {
        let mut job = job();
        let mut tracker = ProgressTracker::new(5.0);
        job.begin_stage(0).unwrap();
        tracker.on_transition(&mut job, Some(0), "started").unwrap();

        // 5% of a 40-weight stage moves the aggregate by 2 points.
        job.stage_progress(0, 5.0);
        assert!(tracker.on_progress(&mut job, 0, "tick").is_none());
        job.stage_progress(0, 12.0);
        assert!(tracker.on_progress(&mut job, 0, "tick").is_none());
        job.stage_progress(0, 13.0);
        let event = tracker.on_progress(&mut job, 0, "tick").unwrap();
        assert!((event.aggregate_percent - 5.2).abs() < 1e-9);
        assert_eq!(event.seq, 2);
    }

    #[test]
    fn test_reaching_hundred_always_emits() {
        let mut job = job();
        let mut tracker = ProgressTracker::new(50.0);
        for idx in 0..2 {
            job.begin_stage(idx).unwrap();
            job.succeed_stage(idx).unwrap();
        }
        job.begin_stage(2).unwrap();
        tracker.on_transition(&mut job, Some(2), "started").unwrap();
        job.stage_progress(2, 100.0);
        let event = tracker.on_progress(&mut job, 2, "done").unwrap();
        assert_eq!(event.aggregate_percent, 100.0);
    }

    #[test]
    fn test_stage_transition_emits_without_progress() {
        let mut job = job();
        let mut tracker = ProgressTracker::new(5.0);
        tracker.on_transition(&mut job, None, "admitted").unwrap();
        job.begin_stage(0).unwrap();
        let event = tracker.on_transition(&mut job, Some(0), "started").unwrap();
        assert_eq!(event.stage.as_deref(), Some("discovery"));
        assert_eq!(event.stage_status, Some(StageStatus::Running));
        assert_eq!(event.aggregate_percent, 0.0);
        assert!(tracker.on_transition(&mut job, Some(0), "again").is_none());
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut job = job();
        let mut tracker = ProgressTracker::new(1.0);
        job.begin_stage(0).unwrap();
        job.stage_progress(0, 80.0);
        tracker.on_progress(&mut job, 0, "tick").unwrap();
        let before = job.progress;

        // A failed stage keeps its partial contribution, so nothing drops.
        job.fail_stage(0, "boom").unwrap();
        let event = tracker.on_transition(&mut job, Some(0), "failed").unwrap();
        assert!(event.aggregate_percent >= before);
        assert_eq!(event.status, JobStatus::Failed);
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert!(event.is_terminal());
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let mut job = job();
        let mut tracker = ProgressTracker::new(0.5);
        let mut seqs = Vec::new();
        job.begin_stage(0).unwrap();
        seqs.extend(tracker.on_transition(&mut job, Some(0), "start").map(|e| e.seq));
        for pct in [10.0, 20.0, 30.0, 100.0] {
            job.stage_progress(0, pct);
            seqs.extend(tracker.on_progress(&mut job, 0, "tick").map(|e| e.seq));
        }
        assert!(seqs.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(tracker.seq(), *seqs.last().unwrap());
    }
}
