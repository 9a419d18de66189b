//! Admin pass that re-scores the whole roster against current marks and
//! flags students at or above the alert threshold.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Department, RiskTier};
use crate::risk;
use crate::store::{MarkStore, StudentStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAlert {
    pub student_id: Uuid,
    pub name: String,
    pub roll: String,
    pub dept: Department,
    pub score: i32,
    pub tier: RiskTier,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskRefresh {
    pub assessed: usize,
    /// Students whose cached risk changed.
    pub updated: usize,
    pub alerts: Vec<RiskAlert>,
}

/// Writes each student's marks-aware score into the cached risk. Students
/// without marks keep their profile risk. Aborts on the first storage
/// failure; students already written stay written.
pub async fn refresh_all_risks<S>(store: &S, threshold: i32) -> Result<RiskRefresh, StoreError>
where
    S: StudentStore + MarkStore + ?Sized,
{
    let students = store.list_students().await?;
    let marks = store.list_marks().await?;
    let mut refresh = RiskRefresh {
        assessed: students.len(),
        ..RiskRefresh::default()
    };

    for mut student in students {
        let assessment = risk::assess_student(&student, &marks);

        if assessment.score >= threshold {
            warn!(roll = %student.roll, score = assessment.score, "student at or above alert threshold");
            refresh.alerts.push(RiskAlert {
                student_id: student.id,
                name: student.name.clone(),
                roll: student.roll.clone(),
                dept: student.dept,
                score: assessment.score,
                tier: assessment.tier,
            });
        }

        if assessment.score != student.risk {
            student.risk = assessment.score;
            store.update_student(&student).await?;
            refresh.updated += 1;
        }
    }

    info!(
        assessed = refresh.assessed,
        updated = refresh.updated,
        alerts = refresh.alerts.len(),
        threshold,
        "risk refresh finished"
    );
    Ok(refresh)
}
