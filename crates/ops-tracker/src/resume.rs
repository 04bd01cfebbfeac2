use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Failed,
    Error,
    Unchecked,
}

impl VerificationStatus {
    pub fn needs_resume(self) -> bool {
        !matches!(self, VerificationStatus::Verified)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditVerification {
    pub event_id: String,
    pub status: VerificationStatus,
}

/// Server answer of the audit verify endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerifyResponse {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl VerifyResponse {
    pub fn status(&self) -> VerificationStatus {
        match (self.available, self.verified) {
            (false, _) => VerificationStatus::Unchecked,
            (true, true) => VerificationStatus::Verified,
            (true, false) => VerificationStatus::Failed,
        }
    }
}

/// Records that still need verification, in input order.
pub fn select_resumable(records: &[AuditVerification]) -> Vec<AuditVerification> {
    records
        .iter()
        .filter(|record| record.status.needs_resume())
        .cloned()
        .collect()
}

/// Splits resumable records into batches the user re-verifies one at a time.
/// A batch size of zero is treated as one.
pub fn resume_batches(
    records: &[AuditVerification],
    batch_size: usize,
) -> Vec<Vec<AuditVerification>> {
    select_resumable(records)
        .chunks(batch_size.max(1))
        .map(<[AuditVerification]>::to_vec)
        .collect()
}

/// Folds one verify attempt into the record. Request errors mark it `error`
/// so the next resume picks it up again.
pub fn apply_verification<E>(
    record: &mut AuditVerification,
    result: Result<&VerifyResponse, E>,
) -> VerificationStatus {
    record.status = match result {
        Ok(response) => response.status(),
        Err(_) => VerificationStatus::Error,
    };
    record.status
}
