//! Janitor worker for stale acquisition artifacts
//!
//! Pipelines remove their own workspace and upload. Anything older than
//! `max_age` under the clones or uploads directory was left behind by a
//! process that died mid-pipeline.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Janitor worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,

    /// Artifacts last modified longer ago than this are removed
    pub max_age: Duration,

    /// Directories to sweep
    pub dirs: Vec<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(6 * 60 * 60),
            dirs: Vec::new(),
        }
    }
}

/// Remove entries of `dir` last modified before `now - max_age`.
///
/// Returns the number of entries removed. A missing directory counts as empty.
pub async fn sweep_stale(dir: &Dir, max_age: Duration, now: SystemTime) -> Result<usize, EngineError> {
    if !dir.exists().await {
        return Ok(0);
    }

    let mut removed = 0;
    for (path, modified) in dir.entries().await? {
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if path.is_dir() {
            Dir::new(&path).delete().await
        } else {
            File::new(&path).delete().await
        };
        match result {
            Ok(()) => {
                debug!("Removed stale artifact {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove stale artifact {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// Run the janitor worker
pub async fn run<S, F>(
    options: &Options,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Janitor worker starting...");

    loop {
        for dir in &options.dirs {
            match sweep_stale(&Dir::new(dir), options.max_age, SystemTime::now()).await {
                Ok(0) => {}
                Ok(n) => info!("Removed {} stale artifacts from {}", n, dir.display()),
                Err(e) => error!("Sweep of {} failed: {}", dir.display(), e),
            }
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Janitor worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
