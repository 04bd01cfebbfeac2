use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use ops_tracker::resume::{apply_verification, resume_batches, AuditVerification, VerificationStatus};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::http::PulseHttp;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ResumeSummary {
    pub(crate) verified: usize,
    pub(crate) failed: usize,
    pub(crate) errors: usize,
    pub(crate) unchecked: usize,
    pub(crate) skipped_batches: usize,
}

impl ResumeSummary {
    fn record(&mut self, status: VerificationStatus) {
        match status {
            VerificationStatus::Verified => self.verified += 1,
            VerificationStatus::Failed => self.failed += 1,
            VerificationStatus::Error => self.errors += 1,
            VerificationStatus::Unchecked => self.unchecked += 1,
        }
    }
}

pub(crate) fn load_state(path: &Path) -> anyhow::Result<Vec<AuditVerification>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read audit state {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse audit state {}", path.display()))
}

fn save_state(path: &Path, records: &[AuditVerification]) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(records)?;
    std::fs::write(path, raw)
        .with_context(|| format!("failed to write audit state {}", path.display()))
}

async fn confirm(prompt: String) -> anyhow::Result<bool> {
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        eprint!("{prompt} [y/N] ");
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Re-verifies unverified audit events one batch at a time. The state file is
/// rewritten after every batch so an interrupted run resumes where it stopped.
pub(crate) async fn resume_verification(
    http: Arc<PulseHttp>,
    state_path: &Path,
    batch_size: usize,
    assume_yes: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<ResumeSummary> {
    let mut records = load_state(state_path)?;
    let batches = resume_batches(&records, batch_size);
    let index: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(position, record)| (record.event_id.clone(), position))
        .collect();
    info!(
        total = records.len(),
        batches = batches.len(),
        "audit verification resume"
    );

    let mut summary = ResumeSummary::default();
    let total_batches = batches.len();
    for (number, batch) in batches.into_iter().enumerate() {
        if shutdown.is_cancelled() {
            break;
        }
        let prompt = format!(
            "Verify batch {}/{} ({} events)?",
            number + 1,
            total_batches,
            batch.len()
        );
        if !assume_yes && !confirm(prompt).await? {
            summary.skipped_batches = total_batches - number;
            break;
        }
        for pending in batch {
            let Some(&position) = index.get(&pending.event_id) else {
                continue;
            };
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = http.verify_audit_event(&pending.event_id) => result,
            };
            if let Err(err) = &result {
                warn!(event_id = %pending.event_id, error = %err, "audit verification request failed");
            }
            let status = apply_verification(&mut records[position], result.as_ref());
            summary.record(status);
        }
        save_state(state_path, &records)?;
    }
    Ok(summary)
}
