/// External content fetcher subprocess.
///
/// Runs the configured downloader once per job with the job directory as
/// its working directory. Stdout is discarded; stderr is forwarded to
/// tracing and its tail is kept for the failure report.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use jm_shared::errors::FetchError;

/// Stderr lines kept for the failure detail.
const STDERR_TAIL: usize = 20;

/// Fills a working directory with the images of one content item.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, content_id: &str, work_dir: &Path) -> Result<(), FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Executable to run.
    pub program: String,
    /// Argument template. `{id}`, `{dir}` and `{option}` are substituted;
    /// the id is appended when no argument mentions `{id}`.
    pub args: Vec<String>,
    /// Downloader option file handed over through `{option}`.
    pub option_file: PathBuf,
}

impl FetcherConfig {
    /// Substitute the placeholders. Callers pass absolute paths: the child
    /// runs inside `work_dir`, so relative ones would resolve against it.
    pub fn render_args(&self, content_id: &str, work_dir: &Path, option_file: &Path) -> Vec<String> {
        let dir = work_dir.to_string_lossy();
        let option = option_file.to_string_lossy();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{id}", content_id)
                    .replace("{dir}", &dir)
                    .replace("{option}", &option)
            })
            .collect();
        if !self.args.iter().any(|a| a.contains("{id}")) {
            args.push(content_id.to_string());
        }
        args
    }

    /// The option file as an absolute path, relative ones taken against the
    /// process working directory.
    pub fn absolute_option_file(&self) -> std::io::Result<PathBuf> {
        if self.option_file.is_absolute() {
            Ok(self.option_file.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.option_file))
        }
    }
}

/// [`Fetcher`] backed by an external command.
pub struct CommandFetcher {
    config: FetcherConfig,
}

impl CommandFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, content_id: &str, work_dir: &Path) -> Result<(), FetchError> {
        tokio::fs::create_dir_all(work_dir).await?;
        let work_dir = tokio::fs::canonicalize(work_dir).await?;
        let option_file = self.config.absolute_option_file()?;
        let args = self.config.render_args(content_id, &work_dir, &option_file);
        info!("Fetching {} into {:?}", content_id, work_dir);
        debug!("Fetcher command: {} {:?}", self.config.program, args);

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .current_dir(&work_dir)
            .env("JM_DOWNLOAD_DIR", &work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::SpawnFailed(format!("{}: {}", self.config.program, e)))?;

        // Drain stderr before waiting so a chatty fetcher cannot block on a full pipe.
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "fetcher", "{}", line);
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }

        let status = child.wait().await?;
        if status.success() {
            info!("Fetcher finished for {}", content_id);
            return Ok(());
        }

        let detail = tail.into_iter().collect::<Vec<_>>().join("\n");
        warn!("Fetcher failed for {} ({})", content_id, status);
        Err(FetchError::Exited {
            code: status.code(),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandFetcher {
        CommandFetcher::new(FetcherConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            option_file: PathBuf::from("/etc/jm-option.yml"),
        })
    }

    #[test]
    fn test_render_args_substitutes_placeholders() {
        let config = FetcherConfig {
            program: "jmcomic".to_string(),
            args: vec!["{id}".to_string(), "--option={option}".to_string()],
            option_file: PathBuf::from("/etc/jm-option.yml"),
        };
        let args = config.render_args("350234", Path::new("/tmp/job"), &config.option_file);
        assert_eq!(args, vec!["350234", "--option=/etc/jm-option.yml"]);
    }

    #[test]
    fn test_render_args_appends_missing_id() {
        let config = FetcherConfig {
            program: "fetch".to_string(),
            args: vec!["--out".to_string(), "{dir}".to_string()],
            option_file: PathBuf::new(),
        };
        let args = config.render_args("42", Path::new("/tmp/job"), Path::new("/etc/opt.yml"));
        assert_eq!(args, vec!["--out", "/tmp/job", "42"]);
    }

    #[tokio::test]
    async fn test_fetch_runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("job");
        let fetcher = shell("mkdir -p ch1 && printf img > ch1/{id}.jpg && printf \"$JM_DOWNLOAD_DIR\" > where.txt");

        fetcher.fetch("77", &work).await.unwrap();
        assert!(work.join("ch1/77.jpg").is_file());
        let recorded = std::fs::read_to_string(work.join("where.txt")).unwrap();
        assert_eq!(Path::new(&recorded), work.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_relative_paths_resolve_outside_work_dir() {
        // A relative data dir, as with the default DATA_DIR of ".".
        let dir = tempfile::tempdir_in(".").unwrap();
        assert!(dir.path().is_relative());
        let option = dir.path().join("jm-option.yml");
        std::fs::write(&option, b"dir_rule: {}").unwrap();
        let work = dir.path().join("downloads/11/350234-11-abcd");

        let fetcher = CommandFetcher::new(FetcherConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "test -f '{option}' && test -d '{dir}' && test \"$JM_DOWNLOAD_DIR\" = \"$(pwd -P)\" \
                 && printf \"$JM_DOWNLOAD_DIR\" > where.txt || exit 7"
                    .to_string(),
            ],
            option_file: option,
        });

        fetcher.fetch("350234", &work).await.unwrap();
        let recorded = std::fs::read_to_string(work.join("where.txt")).unwrap();
        assert!(Path::new(&recorded).is_absolute());
        assert_eq!(Path::new(&recorded), work.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = shell("echo 'album {id} not found' >&2; exit 3");

        let err = fetcher.fetch("9", dir.path()).await.unwrap_err();
        match err {
            FetchError::Exited { code, detail } => {
                assert_eq!(code, Some(3));
                assert!(detail.contains("album 9 not found"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CommandFetcher::new(FetcherConfig {
            program: "/nonexistent/jm-fetcher".to_string(),
            args: vec![],
            option_file: PathBuf::new(),
        });
        let err = fetcher.fetch("1", dir.path()).await.unwrap_err();
        assert!(matches!(err, FetchError::SpawnFailed(_)));
    }
}
