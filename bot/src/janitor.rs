/// Background cleanup of stale job data.
///
/// Sweeps the top level of each scratch directory and deletes entries whose
/// modification time is more than a day old.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};

/// Entries older than this are swept.
pub const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pause after a failed sweep, instead of the configured interval.
const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
    pub errors: usize,
}

fn remove_entry(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Delete entries directly under `dirs` last modified strictly more than
/// `ttl` before `now`. Missing directories are skipped; per-entry failures
/// are counted and logged. Fails only if a directory cannot be listed.
pub fn sweep(dirs: &[PathBuf], ttl: Duration, now: SystemTime) -> io::Result<SweepReport> {
    let mut report = SweepReport::default();
    for dir in dirs {
        if !dir.exists() {
            continue;
        }
        for entry in fs::read_dir(dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("Unreadable entry in {:?}: {}", dir, e);
                    report.errors += 1;
                    continue;
                }
            };
            let modified = match fs::symlink_metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Cannot stat {:?}: {}", path, e);
                    report.errors += 1;
                    continue;
                }
            };
            // Future timestamps count as fresh.
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= ttl {
                report.kept += 1;
                continue;
            }
            match remove_entry(&path) {
                Ok(()) => {
                    debug!("Removed stale {:?}", path);
                    report.removed += 1;
                }
                Err(e) => {
                    error!("Failed to remove {:?}: {}", path, e);
                    report.errors += 1;
                }
            }
        }
    }
    Ok(report)
}

/// Remove everything under `dirs`, regardless of age. Used once at startup,
/// when no job can be running.
pub fn purge(dirs: &[PathBuf]) -> SweepReport {
    let mut report = SweepReport::default();
    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                error!("Cannot list {:?}: {}", dir, e);
                report.errors += 1;
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match remove_entry(&path) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    error!("Failed to remove {:?}: {}", path, e);
                    report.errors += 1;
                }
            }
        }
    }
    info!("Startup purge removed {} entries", report.removed);
    report
}

/// Pause before the next sweep: the configured interval after a sweep that
/// ran, [`FALLBACK_INTERVAL`] after one that failed.
fn pause_after(result: &io::Result<SweepReport>, interval: Duration) -> Duration {
    match result {
        Ok(report) => {
            info!(
                "Cleanup sweep: removed {}, kept {}, errors {}",
                report.removed, report.kept, report.errors
            );
            interval
        }
        Err(e) => {
            error!("Cleanup sweep failed: {}", e);
            FALLBACK_INTERVAL
        }
    }
}

/// Sweep forever, pausing `interval` between sweeps.
pub async fn run(dirs: Vec<PathBuf>, interval: Duration) {
    info!("Cleanup task started (interval: {}s)", interval.as_secs());
    loop {
        let targets = dirs.clone();
        let result = tokio::task::spawn_blocking(move || sweep(&targets, ENTRY_TTL, SystemTime::now()))
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, format!("sweep aborted: {}", e))));
        tokio::time::sleep(pause_after(&result, interval)).await;
    }
}
