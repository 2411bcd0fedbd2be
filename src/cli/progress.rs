//! Progress display for jobs being polled.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use docsift::error::ExtractError;
use docsift::jobs::Orchestrator;
use docsift::models::{JobId, JobSnapshot};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll a job until it finishes, mirroring its progress on a bar.
pub async fn follow_job(
    orchestrator: &Orchestrator,
    id: &JobId,
    label: &str,
    visible: bool,
) -> anyhow::Result<JobSnapshot> {
    let bar = if visible {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {wide_msg}")?
                .progress_chars("█▓░"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    } else {
        ProgressBar::hidden()
    };

    let snapshot = loop {
        let snapshot = match orchestrator.status(id).await {
            Ok(snapshot) => snapshot,
            Err(ExtractError::NotFound(_)) => anyhow::bail!("job {} disappeared", id),
            Err(e) => return Err(e.into()),
        };
        bar.set_position(snapshot.progress as u64);
        bar.set_message(format!("{} ({})", label, snapshot.status));
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    bar.finish_and_clear();
    Ok(snapshot)
}
