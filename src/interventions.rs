use chrono::Utc;
use tracing::info;

use crate::error::ValidationError;
use crate::models::{Intervention, InterventionStatus, InterventionType, NewIntervention, Student};
use crate::store::InterventionStore;
use crate::students::StudentError;

pub const DEFAULT_AUTHOR: &str = "Faculty";

/// Appends a remedial action to the student's log. Entries are never edited
/// afterwards.
pub async fn log_intervention<S: InterventionStore + ?Sized>(
    store: &S,
    student: &Student,
    kind: InterventionType,
    note: &str,
    created_by: Option<&str>,
) -> Result<Intervention, StudentError> {
    let note = note.trim();
    if note.is_empty() {
        return Err(ValidationError::MissingField("note").into());
    }
    let created_by = created_by
        .map(str::trim)
        .filter(|author| !author.is_empty())
        .unwrap_or(DEFAULT_AUTHOR);

    let intervention = store
        .insert_intervention(NewIntervention {
            student_id: student.id,
            student_name: student.name.clone(),
            kind,
            note: note.to_string(),
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            status: InterventionStatus::Done,
        })
        .await?;

    info!(
        student = %student.roll,
        kind = kind.as_str(),
        "intervention logged"
    );
    Ok(intervention)
}
