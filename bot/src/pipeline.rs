/// Fetch job pipeline.
///
/// One job runs sequentially through fetch, post-processing, size check and
/// upload; independent jobs run concurrently. Whatever happens, the job's
/// working directory and artifacts are removed before the job is forgotten.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use jm_shared::errors::{GatewayError, JobError};
use jm_shared::gateway_protocol::group_file_params;
use jm_shared::group_state::CooldownTable;
use jm_shared::job::{FetchJob, JobOutcome, JobState, JobTracker, OutputMode};

use crate::config::BotConfig;
use crate::gateway::GatewayApi;
use crate::packaging::archive::{self, ArchivePaths};
use crate::packaging::{document, find_images};
use crate::workers::fetcher::Fetcher;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub download_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub document_dir: PathBuf,
    pub archive_password: String,
    pub max_file_bytes: u64,
    pub mode: OutputMode,
}

impl PipelineSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            download_dir: config.download_dir(),
            archive_dir: config.archive_dir(),
            document_dir: config.document_dir(),
            archive_password: config.archive_password.clone(),
            max_file_bytes: config.max_file_bytes,
            mode: config.output_mode,
        }
    }
}

/// Files a job may create outside its working directory.
struct JobArtifacts {
    archive: ArchivePaths,
    document: PathBuf,
}

/// Artifact ready for upload.
struct Packaged {
    path: PathBuf,
    upload_name: String,
}

pub struct JobPipeline {
    gateway: Arc<dyn GatewayApi>,
    fetcher: Arc<dyn Fetcher>,
    cooldowns: CooldownTable,
    jobs: JobTracker,
    settings: PipelineSettings,
}

impl JobPipeline {
    pub fn new(
        gateway: Arc<dyn GatewayApi>,
        fetcher: Arc<dyn Fetcher>,
        cooldowns: CooldownTable,
        jobs: JobTracker,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            gateway,
            fetcher,
            cooldowns,
            jobs,
            settings,
        }
    }

    /// Create a job in the configured output mode.
    pub fn create_job(&self, content_id: &str, requester_id: i64, group_id: i64) -> FetchJob {
        FetchJob::new(
            content_id,
            requester_id,
            group_id,
            self.settings.mode,
            &self.settings.download_dir,
        )
    }

    /// Run `job` to its terminal outcome, report it to the group and clean up.
    pub async fn run(&self, job: FetchJob) -> JobOutcome {
        self.jobs.track(&job).await;
        info!("Job {} started ({} in flight)", job.id, self.jobs.active_count().await);
        let artifacts = JobArtifacts {
            archive: ArchivePaths::for_job(&self.settings.archive_dir, &job.id),
            document: self.settings.document_dir.join(format!("{}.pdf", job.id)),
        };

        let result = self.execute(&job, &artifacts).await;

        // The cooldown covers attempts that got as far as the upload.
        let attempted = match &result {
            Ok(()) => true,
            Err(e) => e.reached_upload(),
        };
        if attempted {
            self.cooldowns.start(job.group_id, Utc::now()).await;
        }

        let outcome = match result {
            Ok(()) => {
                self.gateway
                    .send_group_text(job.group_id, &format!("JM{}发送完成！", job.content_id))
                    .await;
                JobOutcome::Completed
            }
            Err(e) => {
                match &e {
                    JobError::UploadRejected(cause) => {
                        error!("Job {}: gateway rejected the upload: {}", job.id, cause)
                    }
                    JobError::UploadTransport(cause) => {
                        error!("Job {}: upload never got a response: {}", job.id, cause)
                    }
                    other => error!("Job {} failed: {}", job.id, other),
                }
                self.gateway
                    .send_group_text(job.group_id, &e.user_message(&job.content_id))
                    .await;
                JobOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.cleanup(&job, &artifacts).await;
        self.jobs.finish(&job.id, &outcome).await;
        outcome
    }

    async fn execute(&self, job: &FetchJob, artifacts: &JobArtifacts) -> Result<(), JobError> {
        self.jobs.transition(&job.id, JobState::Fetching).await;
        self.fetcher.fetch(&job.content_id, &job.work_dir).await?;

        self.jobs.transition(&job.id, JobState::PostProcessing).await;
        let work_dir = job.work_dir.clone();
        let images = tokio::task::spawn_blocking(move || find_images(&work_dir))
            .await
            .map_err(join_err)?;
        if images.is_empty() {
            return Err(JobError::NoContent);
        }
        info!("Job {}: found {} image(s)", job.id, images.len());

        let packaged = self.package(job, artifacts, images).await?;

        let size = tokio::fs::metadata(&packaged.path).await?.len();
        if size > self.settings.max_file_bytes {
            warn!(
                "Job {}: artifact is {} bytes, limit {}",
                job.id, size, self.settings.max_file_bytes
            );
            return Err(JobError::SizeExceeded {
                size,
                limit: self.settings.max_file_bytes,
            });
        }
        self.jobs.transition(&job.id, JobState::SizeChecked).await;

        self.jobs.transition(&job.id, JobState::Uploading).await;
        let file_path = tokio::fs::canonicalize(&packaged.path)
            .await
            .unwrap_or_else(|_| packaged.path.clone());
        let params = group_file_params(
            job.group_id,
            &packaged.upload_name,
            &file_path.to_string_lossy(),
        );
        info!("Job {}: uploading {} bytes to group {}", job.id, size, job.group_id);
        match self.gateway.request("send_group_msg", params).await {
            Ok(_) => {
                info!("Job {}: upload accepted", job.id);
                Ok(())
            }
            Err(e @ GatewayError::Rejected { .. }) | Err(e @ GatewayError::InvalidResponse(_)) => {
                Err(JobError::UploadRejected(e.to_string()))
            }
            Err(e) => Err(JobError::UploadTransport(e.to_string())),
        }
    }

    async fn package(
        &self,
        job: &FetchJob,
        artifacts: &JobArtifacts,
        images: Vec<PathBuf>,
    ) -> Result<Packaged, JobError> {
        match job.mode {
            OutputMode::Archive => {
                let src = job.work_dir.clone();
                let paths = artifacts.archive.clone();
                let entry_name = format!("{}.zip", job.content_id);
                let password = self.settings.archive_password.clone();
                let path = tokio::task::spawn_blocking(move || {
                    archive::package(&src, &paths, &entry_name, &password)
                })
                .await
                .map_err(join_err)??;
                Ok(Packaged {
                    path,
                    upload_name: format!(
                        "密码{}【{}】.zip",
                        self.settings.archive_password, job.content_id
                    ),
                })
            }
            OutputMode::Document => {
                let output = artifacts.document.clone();
                let target = output.clone();
                let pages = tokio::task::spawn_blocking(move || {
                    document::build_document(&images, &target)
                })
                .await
                .map_err(join_err)??;
                info!("Job {}: document has {} page(s)", job.id, pages);
                Ok(Packaged {
                    path: output,
                    upload_name: format!("【{}】.pdf", job.content_id),
                })
            }
        }
    }

    async fn cleanup(&self, job: &FetchJob, artifacts: &JobArtifacts) {
        remove_path(&job.work_dir).await;
        for path in artifacts.archive.all() {
            remove_path(path).await;
        }
        remove_path(&artifacts.document).await;
        // Drop the requester directory once its last job is gone.
        if let Some(parent) = job.work_dir.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }
}

fn join_err(e: tokio::task::JoinError) -> JobError {
    JobError::Io(std::io::Error::other(e.to_string()))
}

/// Best-effort removal of a file or directory tree.
async fn remove_path(path: &Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    match result {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::gateway::mock::RecordingGateway;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use jm_shared::errors::FetchError;

    /// Writes `images` small PNGs into the job directory, or fails.
    pub struct FakeFetcher {
        pub images: usize,
        pub fail: bool,
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, content_id: &str, work_dir: &Path) -> Result<(), FetchError> {
            if self.fail {
                return Err(FetchError::Exited {
                    code: Some(1),
                    detail: format!("album {} not found", content_id),
                });
            }
            let chapter = work_dir.join(content_id).join("ch1");
            std::fs::create_dir_all(&chapter)?;
            std::fs::write(chapter.join("readme.txt"), b"fetched")?;
            for n in 0..self.images {
                let img = RgbImage::from_pixel(4, 4, Rgb([n as u8 * 10, 100, 200]));
                img.save(chapter.join(format!("{:05}.png", n + 1)))
                    .map_err(|e| FetchError::Io(std::io::Error::other(e.to_string())))?;
            }
            Ok(())
        }
    }

    pub struct Harness {
        pub pipeline: Arc<JobPipeline>,
        pub gateway: Arc<RecordingGateway>,
        pub cooldowns: CooldownTable,
        pub settings: PipelineSettings,
        _dir: tempfile::TempDir,
    }

    pub fn harness(gateway: RecordingGateway, fetcher: FakeFetcher, mode: OutputMode) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = PipelineSettings {
            download_dir: dir.path().join("downloads"),
            archive_dir: dir.path().join("zips"),
            document_dir: dir.path().join("pdf"),
            archive_password: "123456".to_string(),
            max_file_bytes: 100 * 1024 * 1024,
            mode,
        };
        let gateway = Arc::new(gateway);
        let cooldowns = CooldownTable::new(std::time::Duration::from_secs(60));
        let pipeline = Arc::new(JobPipeline::new(
            gateway.clone(),
            Arc::new(fetcher),
            cooldowns.clone(),
            JobTracker::new(),
            settings.clone(),
        ));
        Harness {
            pipeline,
            gateway,
            cooldowns,
            settings,
            _dir: dir,
        }
    }

    fn is_empty_dir(path: &Path) -> bool {
        match std::fs::read_dir(path) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    fn upload_name(gateway: &RecordingGateway) -> String {
        let calls = gateway.calls.lock().unwrap();
        let (_, params) = calls
            .iter()
            .find(|(action, _)| action == "send_group_msg")
            .unwrap();
        params["message"][0]["data"]["name"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_archive_job_completes_and_cleans_up() {
        let h = harness(
            RecordingGateway::new(),
            FakeFetcher { images: 3, fail: false },
            OutputMode::Archive,
        );
        let job = h.pipeline.create_job("350234", 11, 500);
        let work_dir = job.work_dir.clone();

        let outcome = h.pipeline.run(job).await;
        assert!(outcome.is_success());
        assert_eq!(h.gateway.count("send_group_msg"), 1);
        assert_eq!(h.gateway.uploaded_files.lock().unwrap().len(), 1);
        assert_eq!(upload_name(&h.gateway), "密码123456【350234】.zip");
        assert_eq!(h.gateway.texts(), vec!["JM350234发送完成！"]);
        assert!(h.cooldowns.remaining(500, Utc::now()).await > 0);

        assert!(!work_dir.exists());
        assert!(is_empty_dir(&h.settings.archive_dir));
        assert_eq!(h.pipeline.jobs.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_document_job_uploads_pdf() {
        let h = harness(
            RecordingGateway::new(),
            FakeFetcher { images: 2, fail: false },
            OutputMode::Document,
        );
        let job = h.pipeline.create_job("42", 11, 500);

        assert!(h.pipeline.run(job).await.is_success());
        assert_eq!(upload_name(&h.gateway), "【42】.pdf");
        assert_eq!(h.gateway.uploaded_files.lock().unwrap().len(), 1);
        assert!(is_empty_dir(&h.settings.document_dir));
        assert!(is_empty_dir(&h.settings.download_dir));
    }

    #[tokio::test]
    async fn test_fetch_failure_sets_no_cooldown() {
        let h = harness(
            RecordingGateway::new(),
            FakeFetcher { images: 0, fail: true },
            OutputMode::Archive,
        );
        let job = h.pipeline.create_job("350234", 11, 500);

        let outcome = h.pipeline.run(job).await;
        assert!(!outcome.is_success());
        assert_eq!(h.gateway.texts(), vec!["下载JM350234失败，请稍后重试。"]);
        assert_eq!(h.gateway.count("send_group_msg"), 0);
        assert_eq!(h.cooldowns.remaining(500, Utc::now()).await, 0);
    }

    #[tokio::test]
    async fn test_no_images_is_no_content() {
        let h = harness(
            RecordingGateway::new(),
            FakeFetcher { images: 0, fail: false },
            OutputMode::Archive,
        );
        let job = h.pipeline.create_job("7", 11, 500);
        let work_dir = job.work_dir.clone();

        h.pipeline.run(job).await;
        assert_eq!(h.gateway.texts(), vec!["下载JM7失败：找不到下载内容。"]);
        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn test_oversized_artifact_is_not_uploaded() {
        let mut h = harness(
            RecordingGateway::new(),
            FakeFetcher { images: 2, fail: false },
            OutputMode::Archive,
        );
        h.settings.max_file_bytes = 10;
        let pipeline = JobPipeline::new(
            h.gateway.clone(),
            Arc::new(FakeFetcher { images: 2, fail: false }),
            h.cooldowns.clone(),
            JobTracker::new(),
            h.settings.clone(),
        );
        let job = pipeline.create_job("7", 11, 500);

        assert!(!pipeline.run(job).await.is_success());
        assert_eq!(h.gateway.count("send_group_msg"), 0);
        assert!(h.gateway.texts()[0].starts_with("抱歉，文件大小超过限制"));
        assert_eq!(h.cooldowns.remaining(500, Utc::now()).await, 0);
        assert!(is_empty_dir(&h.settings.archive_dir));
    }

    #[tokio::test]
    async fn test_rejected_upload_still_cools_down() {
        let h = harness(
            RecordingGateway::rejecting("send_group_msg"),
            FakeFetcher { images: 1, fail: false },
            OutputMode::Archive,
        );
        let job = h.pipeline.create_job("9", 11, 500);

        let outcome = h.pipeline.run(job).await;
        assert!(matches!(outcome, JobOutcome::Failed { ref reason } if reason.contains("rejected")));
        assert_eq!(h.gateway.texts(), vec!["JM9上传失败：上传请求失败。"]);
        assert!(h.cooldowns.remaining(500, Utc::now()).await > 0);
    }

    #[tokio::test]
    async fn test_transport_failure_on_upload() {
        let h = harness(
            RecordingGateway::dropping("send_group_msg"),
            FakeFetcher { images: 1, fail: false },
            OutputMode::Document,
        );
        let job = h.pipeline.create_job("9", 11, 500);

        let outcome = h.pipeline.run(job).await;
        assert!(matches!(outcome, JobOutcome::Failed { ref reason } if reason.contains("transport")));
        assert_eq!(h.gateway.texts(), vec!["JM9上传失败：上传请求失败。"]);
        assert!(h.cooldowns.remaining(500, Utc::now()).await > 0);
        assert!(is_empty_dir(&h.settings.document_dir));
    }
}
