/// Fetch job model and the in-memory tracker of in-flight jobs.
///
/// Jobs are ephemeral: a job is tracked from acceptance until its terminal
/// outcome and then forgotten.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How fetched images are packaged before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Password-protected archive wrapping an inner archive.
    Archive,
    /// Multi-page PDF document.
    Document,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "archive" | "zip" => Ok(OutputMode::Archive),
            "document" | "pdf" => Ok(OutputMode::Document),
            other => Err(format!("unknown output mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputMode::Archive => write!(f, "archive"),
            OutputMode::Document => write!(f, "document"),
        }
    }
}

/// Pipeline stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Accepted,
    Fetching,
    PostProcessing,
    SizeChecked,
    Uploading,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Accepted => "accepted",
            JobState::Fetching => "fetching",
            JobState::PostProcessing => "post_processing",
            JobState::SizeChecked => "size_checked",
            JobState::Uploading => "uploading",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed)
    }
}

/// One accepted fetch command.
#[derive(Debug, Clone)]
pub struct FetchJob {
    /// `<content>-<requester>-<nonce>`, unique per accepted command.
    pub id: String,
    pub content_id: String,
    pub requester_id: i64,
    pub group_id: i64,
    pub mode: OutputMode,
    /// Job-scoped working directory the fetcher populates.
    pub work_dir: PathBuf,
    pub accepted_at: DateTime<Utc>,
}

impl FetchJob {
    /// Create a job whose working directory lives at
    /// `<download_root>/<requester>/<job id>`.
    pub fn new(
        content_id: &str,
        requester_id: i64,
        group_id: i64,
        mode: OutputMode,
        download_root: &Path,
    ) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}-{}", content_id, requester_id, &nonce[..8]);
        let work_dir = download_root.join(requester_id.to_string()).join(&id);
        Self {
            id,
            content_id: content_id.to_string(),
            requester_id,
            group_id,
            mode,
            work_dir,
            accepted_at: Utc::now(),
        }
    }
}

// ====== TRACKER ======

/// Snapshot of a tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedJob {
    pub job_id: String,
    pub content_id: String,
    pub group_id: i64,
    pub requester_id: i64,
    pub mode: OutputMode,
    pub state: JobState,
    pub accepted_at: DateTime<Utc>,
}

/// In-flight jobs keyed by job id.
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<Mutex<HashMap<String, TrackedJob>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a job. Returns false if the id is already tracked.
    pub async fn track(&self, job: &FetchJob) -> bool {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            warn!("Job {} already tracked", job.id);
            return false;
        }
        jobs.insert(
            job.id.clone(),
            TrackedJob {
                job_id: job.id.clone(),
                content_id: job.content_id.clone(),
                group_id: job.group_id,
                requester_id: job.requester_id,
                mode: job.mode,
                state: JobState::Accepted,
                accepted_at: job.accepted_at,
            },
        );
        info!("Job {} accepted (mode: {})", job.id, job.mode);
        true
    }

    /// Move a job to a non-terminal state. Terminal states are only reached
    /// through [`JobTracker::finish`].
    pub async fn transition(&self, job_id: &str, state: JobState) {
        if state.is_terminal() {
            warn!("Ignoring transition of job {} to terminal state {}", job_id, state);
            return;
        }
        if let Some(job) = self.jobs.lock().await.get_mut(job_id) {
            debug!("Job {}: {} -> {}", job_id, job.state, state);
            job.state = state;
        }
    }

    /// Record the terminal outcome and forget the job. Returns the final
    /// snapshot, in its terminal state.
    pub async fn finish(&self, job_id: &str, outcome: &JobOutcome) -> Option<TrackedJob> {
        let removed = self.jobs.lock().await.remove(job_id);
        let state = match outcome {
            JobOutcome::Completed => {
                info!("Job {} completed", job_id);
                JobState::Completed
            }
            JobOutcome::Failed { reason } => {
                warn!("Job {} failed: {}", job_id, reason);
                JobState::Failed
            }
        };
        removed.map(|mut job| {
            job.state = state;
            job
        })
    }

    pub async fn active_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// In-flight jobs, oldest first.
    pub async fn snapshot(&self) -> Vec<TrackedJob> {
        let mut jobs: Vec<TrackedJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.accepted_at.cmp(&b.accepted_at).then_with(|| a.job_id.cmp(&b.job_id)));
        jobs
    }
}
