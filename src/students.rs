use std::io::Read;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{IngestError, StoreError, ValidationError};
use crate::models::{Department, Student, StudentProfile};
use crate::risk;
use crate::store::StudentStore;

#[derive(Debug, thiserror::Error)]
pub enum StudentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

fn validate_profile(
    profile: &StudentProfile,
    existing: &[Student],
    editing: Option<Uuid>,
) -> Result<StudentProfile, ValidationError> {
    let name = profile.name.trim();
    if name.is_empty() {
        return Err(ValidationError::MissingField("name"));
    }
    let roll = profile.roll.trim();
    if roll.is_empty() {
        return Err(ValidationError::MissingField("roll"));
    }
    if !(0.0..=10.0).contains(&profile.gpa) {
        return Err(ValidationError::OutOfRange {
            field: "gpa",
            value: profile.gpa,
            max: 10.0,
        });
    }
    if !(0..=100).contains(&profile.attendance) {
        return Err(ValidationError::OutOfRange {
            field: "attendance",
            value: f64::from(profile.attendance),
            max: 100.0,
        });
    }
    if existing
        .iter()
        .any(|student| student.roll == roll && Some(student.id) != editing)
    {
        return Err(ValidationError::DuplicateRoll(roll.to_string()));
    }

    Ok(StudentProfile {
        name: name.to_string(),
        roll: roll.to_string(),
        dept: profile.dept,
        gpa: (profile.gpa * 10.0).round() / 10.0,
        attendance: profile.attendance,
    })
}

/// Adds a student, caching the profile risk at enrollment time.
pub async fn create_student<S: StudentStore + ?Sized>(
    store: &S,
    profile: &StudentProfile,
) -> Result<Student, StudentError> {
    let existing = store.list_students().await?;
    insert_profile(store, profile, &existing).await
}

/// Validates against a roster the caller already holds, then inserts.
async fn insert_profile<S: StudentStore + ?Sized>(
    store: &S,
    profile: &StudentProfile,
    existing: &[Student],
) -> Result<Student, StudentError> {
    let profile = validate_profile(profile, existing, None)?;

    let student = Student {
        id: Uuid::new_v4(),
        risk: risk::profile_risk(profile.gpa, profile.attendance),
        name: profile.name,
        roll: profile.roll,
        dept: profile.dept,
        gpa: profile.gpa,
        attendance: profile.attendance,
        created_at: Utc::now(),
    };
    store.insert_student(&student).await?;
    info!(roll = %student.roll, risk = student.risk, "student created");
    Ok(student)
}

/// Replaces a student's profile and refreshes the cached risk. Snapshots
/// already copied onto mark records are left untouched.
pub async fn update_student<S: StudentStore + ?Sized>(
    store: &S,
    id: Uuid,
    profile: &StudentProfile,
) -> Result<Student, StudentError> {
    let current = store
        .find_student(id)
        .await?
        .ok_or(StoreError::NotFound(id))?;
    let existing = store.list_students().await?;
    let profile = validate_profile(profile, &existing, Some(id))?;

    let student = Student {
        risk: risk::profile_risk(profile.gpa, profile.attendance),
        name: profile.name,
        roll: profile.roll,
        dept: profile.dept,
        gpa: profile.gpa,
        attendance: profile.attendance,
        ..current
    };
    store.update_student(&student).await?;
    info!(roll = %student.roll, risk = student.risk, "student updated");
    Ok(student)
}

pub async fn delete_student<S: StudentStore + ?Sized>(
    store: &S,
    id: Uuid,
) -> Result<(), StudentError> {
    store.delete_student(id).await?;
    info!(student_id = %id, "student deleted");
    Ok(())
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StudentCsvRow {
    name: Option<String>,
    roll: Option<String>,
    dept: Option<String>,
    gpa: Option<String>,
    attendance: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct StudentImportReport {
    pub rows: usize,
    pub created: usize,
    pub skipped: usize,
}

fn profile_from_csv(row: StudentCsvRow) -> Result<StudentProfile, ValidationError> {
    let name = row.name.unwrap_or_default();
    let roll = row.roll.unwrap_or_default();
    if name.trim().is_empty() {
        return Err(ValidationError::MissingField("name"));
    }
    if roll.trim().is_empty() {
        return Err(ValidationError::MissingField("roll"));
    }

    let dept = match row.dept.as_deref().map(str::trim) {
        None | Some("") => Department::Cs,
        Some(raw) => {
            Department::parse(raw).ok_or_else(|| ValidationError::UnknownDepartment(raw.to_string()))?
        }
    };

    let gpa = row
        .gpa
        .as_deref()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|gpa| gpa.is_finite())
        .unwrap_or(0.0);
    let attendance = row
        .attendance
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .unwrap_or(0);

    Ok(StudentProfile {
        name,
        roll,
        dept,
        gpa,
        attendance,
    })
}

/// Bulk student upload. Invalid rows are skipped; a storage failure aborts
/// the rest of the file.
pub async fn import_students_csv<S: StudentStore + ?Sized, R: Read>(
    store: &S,
    input: R,
) -> Result<StudentImportReport, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    let mut rows = Vec::new();
    for result in reader.deserialize::<StudentCsvRow>() {
        rows.push(result?);
    }

    let mut report = StudentImportReport {
        rows: rows.len(),
        ..StudentImportReport::default()
    };
    let mut roster = store.list_students().await.map_err(|source| IngestError::Storage {
        applied: 0,
        source,
    })?;

    for (index, row) in rows.into_iter().enumerate() {
        let created = match profile_from_csv(row) {
            Ok(profile) => insert_profile(store, &profile, &roster).await,
            Err(err) => Err(err.into()),
        };

        match created {
            Ok(student) => {
                roster.push(student);
                report.created += 1;
            }
            Err(StudentError::Validation(reason)) => {
                warn!(row = index + 1, reason = %reason, "skipping student row");
                report.skipped += 1;
            }
            Err(StudentError::Storage(source)) => {
                return Err(IngestError::Storage {
                    applied: report.created,
                    source,
                });
            }
        }
    }

    info!(
        rows = report.rows,
        created = report.created,
        skipped = report.skipped,
        "student import finished"
    );
    Ok(report)
}
