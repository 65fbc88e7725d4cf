/// Per-group state: the enabled-groups registry and the cooldown table.
///
/// Both are memory-resident and shared between the dispatcher and running
/// jobs, so every mutation goes through a tokio mutex.
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

// ====== GROUP REGISTRY ======

/// Set of groups where the fetch command is active, mirrored to a JSON file.
#[derive(Clone)]
pub struct GroupRegistry {
    path: PathBuf,
    groups: Arc<Mutex<BTreeSet<i64>>>,
}

impl GroupRegistry {
    /// Load the registry from `path`. A missing file is created empty; an
    /// unreadable one is logged and treated as empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let groups = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<Vec<i64>>(&raw) {
                Ok(list) => list.into_iter().collect(),
                Err(e) => {
                    error!("Failed to parse enabled groups file {:?}: {}", path, e);
                    BTreeSet::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Enabled groups file {:?} not found, creating an empty one", path);
                let empty = BTreeSet::new();
                if let Err(e) = persist(&path, &empty).await {
                    error!("Failed to create enabled groups file: {}", e);
                }
                empty
            }
            Err(e) => {
                error!("Failed to read enabled groups file {:?}: {}", path, e);
                BTreeSet::new()
            }
        };
        info!("Loaded {} enabled group(s)", groups.len());
        Self {
            path,
            groups: Arc::new(Mutex::new(groups)),
        }
    }

    pub async fn is_enabled(&self, group_id: i64) -> bool {
        self.groups.lock().await.contains(&group_id)
    }

    /// Enable a group. Returns false if it was already enabled (no write).
    pub async fn enable(&self, group_id: i64) -> bool {
        let mut groups = self.groups.lock().await;
        if !groups.insert(group_id) {
            return false;
        }
        self.save_locked(&groups).await;
        info!("Group {} enabled", group_id);
        true
    }

    /// Disable a group. Returns false if it was not enabled (no write).
    pub async fn disable(&self, group_id: i64) -> bool {
        let mut groups = self.groups.lock().await;
        if !groups.remove(&group_id) {
            return false;
        }
        self.save_locked(&groups).await;
        info!("Group {} disabled", group_id);
        true
    }

    pub async fn snapshot(&self) -> BTreeSet<i64> {
        self.groups.lock().await.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Called with the lock held so the file always matches memory.
    async fn save_locked(&self, groups: &BTreeSet<i64>) {
        match persist(&self.path, groups).await {
            Ok(()) => info!("Saved enabled groups ({} total)", groups.len()),
            Err(e) => error!("Failed to save enabled groups to {:?}: {}", self.path, e),
        }
    }
}

async fn persist(path: &Path, groups: &BTreeSet<i64>) -> std::io::Result<()> {
    let list: Vec<i64> = groups.iter().copied().collect();
    let json = serde_json::to_string(&list)?;
    tokio::fs::write(path, json).await
}

// ====== COOLDOWN TABLE ======

/// Group id -> absolute cooldown expiry.
///
/// Advisory only: two commands checked before either job reaches its upload
/// can both pass.
#[derive(Clone)]
pub struct CooldownTable {
    window: Duration,
    expiries: Arc<Mutex<HashMap<i64, DateTime<Utc>>>>,
}

impl CooldownTable {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::days(365)),
            expiries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seconds left before `group_id` may fetch again; 0 means eligible.
    /// Partial seconds round up.
    pub async fn remaining(&self, group_id: i64, now: DateTime<Utc>) -> u64 {
        let expiries = self.expiries.lock().await;
        match expiries.get(&group_id) {
            Some(expiry) => {
                let millis = (*expiry - now).num_milliseconds();
                if millis <= 0 {
                    0
                } else {
                    ((millis + 999) / 1000) as u64
                }
            }
            None => 0,
        }
    }

    /// Start (or restart) the cooldown window for `group_id` at `now`.
    pub async fn start(&self, group_id: i64, now: DateTime<Utc>) {
        let expiry = now + self.window;
        self.expiries.lock().await.insert(group_id, expiry);
        info!("Group {} cooling down for {}s", group_id, self.window.num_seconds());
    }

    pub fn window_secs(&self) -> i64 {
        self.window.num_seconds()
    }
}

/// Render a second count as hours/minutes/seconds, omitting zero parts.
pub fn format_remaining(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}小时", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}分钟", minutes));
    }
    if seconds > 0 {
        out.push_str(&format!("{}秒", seconds));
    }
    out
}
