//! Marks ingestion: normalizes incoming rows and reconciles them against the
//! store so each (student, subject) pair ends up with exactly one record.
//!
//! Rows are applied strictly in input order and each row's stale records are
//! gone before its replacement is written. Nothing spans two rows: a storage
//! failure aborts the batch and leaves earlier rows applied.

use std::collections::HashMap;
use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, StoreError, ValidationError};
use crate::models::{MarkRow, NewMarkRecord, Student, INTERNAL_MAX, UPC_DAYS_MAX};
use crate::store::MarkStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileMode {
    /// Single upsert keyed on (student, subject), when the store offers one.
    #[default]
    Atomic,
    /// Find, delete every match, then insert. Not atomic: a crash between
    /// the delete and the insert leaves the pair with no record.
    DeleteThenInsert,
}

/// Marks of one row after coercion and range checks.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMarks {
    pub subject: String,
    pub internal1: f64,
    pub internal2: f64,
    pub internal3: f64,
    pub avg_internal: f64,
    pub has_upc: bool,
    pub upc_days: f64,
}

impl NormalizedMarks {
    fn for_student(self, student: &Student) -> NewMarkRecord {
        NewMarkRecord {
            student_id: student.id,
            student_name: student.name.clone(),
            roll: student.roll.clone(),
            subject: self.subject,
            internal1: self.internal1,
            internal2: self.internal2,
            internal3: self.internal3,
            avg_internal: self.avg_internal,
            has_upc: self.has_upc,
            upc_days: self.upc_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Skipped(ValidationError),
    Reconciled { id: Uuid, deleted: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    /// 1-based position of the row within the batch.
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub rows: usize,
    pub reconciled: usize,
    pub deleted: usize,
    pub skipped: Vec<SkippedRow>,
}

impl IngestReport {
    fn record(&mut self, row: usize, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Skipped(reason) => {
                warn!(row, reason = %reason, "skipping mark row");
                self.skipped.push(SkippedRow {
                    row,
                    reason: reason.to_string(),
                });
            }
            RowOutcome::Reconciled { id, deleted } => {
                debug!(row, record_id = %id, deleted, "mark row reconciled");
                self.reconciled += 1;
                self.deleted += deleted;
            }
        }
    }
}

/// Missing, blank, or non-numeric values count as zero.
pub fn coerce_number(value: Option<&str>) -> f64 {
    value
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|parsed| parsed.is_finite())
        .unwrap_or(0.0)
}

pub fn round_2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn check_range(field: &'static str, value: f64, max: f64) -> Result<f64, ValidationError> {
    if (0.0..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange { field, value, max })
    }
}

/// Subject presence, numeric coercion, range checks and the derived average.
pub fn normalize_row(row: &MarkRow) -> Result<NormalizedMarks, ValidationError> {
    let subject = row
        .subject
        .as_deref()
        .map(str::trim)
        .filter(|subject| !subject.is_empty())
        .ok_or(ValidationError::EmptySubject)?;

    let internal1 = check_range("internal1", coerce_number(row.internal1.as_deref()), INTERNAL_MAX)?;
    let internal2 = check_range("internal2", coerce_number(row.internal2.as_deref()), INTERNAL_MAX)?;
    let internal3 = check_range("internal3", coerce_number(row.internal3.as_deref()), INTERNAL_MAX)?;

    let has_upc = row
        .upc_days
        .as_deref()
        .is_some_and(|raw| !raw.trim().is_empty());
    let upc_days = check_range("upc_days", coerce_number(row.upc_days.as_deref()), UPC_DAYS_MAX)?;

    Ok(NormalizedMarks {
        subject: subject.to_string(),
        internal1,
        internal2,
        internal3,
        avg_internal: round_2((internal1 + internal2 + internal3) / 3.0),
        has_upc,
        upc_days,
    })
}

/// Reads a marks file with a header row. Every row is parsed before any is
/// returned, so a malformed file yields no rows at all.
pub fn parse_marks_csv<R: Read>(input: R) -> Result<Vec<MarkRow>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = reader.headers()?.clone();
    let has_column = |name: &str| headers.iter().any(|header| header == name);

    if !has_column("subject") {
        return Err(IngestError::Parse("missing required column `subject`".to_string()));
    }
    if !(has_column("roll") || has_column("studentId") || has_column("student_id")) {
        return Err(IngestError::Parse(
            "missing student column, expected `roll` or `studentId`".to_string(),
        ));
    }

    let mut rows = Vec::new();
    for result in reader.deserialize::<MarkRow>() {
        rows.push(result?);
    }

    Ok(rows)
}

/// Lookup of students by id and by roll, built from a caller snapshot.
struct Roster<'a> {
    by_id: HashMap<Uuid, &'a Student>,
    by_roll: HashMap<&'a str, &'a Student>,
}

impl<'a> Roster<'a> {
    fn new(students: &'a [Student]) -> Self {
        let mut by_id = HashMap::new();
        let mut by_roll = HashMap::new();
        for student in students {
            by_id.insert(student.id, student);
            // later entries win on a repeated roll
            by_roll.insert(student.roll.as_str(), student);
        }
        Self { by_id, by_roll }
    }

    fn resolve(&self, row: &MarkRow) -> Result<&'a Student, ValidationError> {
        if let Some(raw_id) = row.student_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return Uuid::parse_str(raw_id)
                .ok()
                .and_then(|id| self.by_id.get(&id).copied())
                .ok_or_else(|| ValidationError::UnknownStudent(raw_id.to_string()));
        }

        let roll = row.roll.as_deref().map(str::trim).unwrap_or_default();
        self.by_roll
            .get(roll)
            .copied()
            .ok_or_else(|| ValidationError::UnknownStudent(roll.to_string()))
    }
}

pub struct MarksIngestor<'a, S: MarkStore + ?Sized> {
    store: &'a S,
    mode: ReconcileMode,
}

impl<'a, S: MarkStore + ?Sized> MarksIngestor<'a, S> {
    pub fn new(store: &'a S, mode: ReconcileMode) -> Self {
        let mode = if mode == ReconcileMode::Atomic && !store.supports_atomic_upsert() {
            warn!("store has no atomic upsert, falling back to delete-then-insert");
            ReconcileMode::DeleteThenInsert
        } else {
            mode
        };
        Self { store, mode }
    }

    pub fn mode(&self) -> ReconcileMode {
        self.mode
    }

    /// Best-effort import of file rows. Rows with an unknown student, an empty
    /// subject or out-of-range values are skipped and listed in the report.
    pub async fn ingest_bulk(
        &self,
        students: &[Student],
        rows: &[MarkRow],
    ) -> Result<IngestReport, IngestError> {
        let roster = Roster::new(students);
        let mut report = IngestReport {
            rows: rows.len(),
            ..IngestReport::default()
        };

        for (index, row) in rows.iter().enumerate() {
            let validated = roster
                .resolve(row)
                .and_then(|student| normalize_row(row).map(|marks| (student, marks)));

            let outcome = match validated {
                Err(reason) => RowOutcome::Skipped(reason),
                Ok((student, marks)) => self
                    .reconcile(marks.for_student(student))
                    .await
                    .map_err(|source| storage_failure(&report, source))?,
            };
            report.record(index + 1, outcome);
        }

        info!(
            rows = report.rows,
            reconciled = report.reconciled,
            deleted = report.deleted,
            skipped = report.skipped.len(),
            "bulk marks ingestion finished"
        );
        Ok(report)
    }

    /// Form entry for one pre-selected student. Preconditions are checked for
    /// the whole submission before the store is touched; rows without a
    /// subject are skipped.
    pub async fn ingest_manual(
        &self,
        students: &[Student],
        selected: Option<Uuid>,
        rows: &[MarkRow],
    ) -> Result<IngestReport, IngestError> {
        let selected = selected.ok_or(ValidationError::NoStudentSelected)?;
        let student = students
            .iter()
            .find(|student| student.id == selected)
            .ok_or_else(|| ValidationError::UnknownStudent(selected.to_string()))?;

        let mut planned = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            match normalize_row(row) {
                Ok(marks) => planned.push((index + 1, Some(marks))),
                Err(ValidationError::EmptySubject) => planned.push((index + 1, None)),
                Err(err) => return Err(err.into()),
            }
        }

        let mut report = IngestReport {
            rows: rows.len(),
            ..IngestReport::default()
        };

        for (row, marks) in planned {
            let outcome = match marks {
                None => RowOutcome::Skipped(ValidationError::EmptySubject),
                Some(marks) => self
                    .reconcile(marks.for_student(student))
                    .await
                    .map_err(|source| storage_failure(&report, source))?,
            };
            report.record(row, outcome);
        }

        info!(
            student = %student.roll,
            reconciled = report.reconciled,
            deleted = report.deleted,
            skipped = report.skipped.len(),
            "manual marks entry finished"
        );
        Ok(report)
    }

    async fn reconcile(&self, record: NewMarkRecord) -> Result<RowOutcome, StoreError> {
        match self.mode {
            ReconcileMode::Atomic => {
                let upserted = self.store.upsert_record(record).await?;
                Ok(RowOutcome::Reconciled {
                    id: upserted.id,
                    deleted: upserted.replaced,
                })
            }
            ReconcileMode::DeleteThenInsert => {
                let existing = self
                    .store
                    .find_records(record.student_id, &record.subject)
                    .await?;
                let mut deleted = 0;
                for stale in &existing {
                    // a concurrent batch may have removed it already
                    if self.store.delete_record(stale.id).await? {
                        deleted += 1;
                    }
                }
                let id = self.store.insert_record(record).await?;
                Ok(RowOutcome::Reconciled { id, deleted })
            }
        }
    }
}

/// Explicit removal of a single mark record by id.
pub async fn delete_mark<S: MarkStore + ?Sized>(store: &S, id: Uuid) -> Result<(), StoreError> {
    if !store.delete_record(id).await? {
        return Err(StoreError::NotFound(id));
    }
    info!(record_id = %id, "mark record deleted");
    Ok(())
}

fn storage_failure(report: &IngestReport, source: StoreError) -> IngestError {
    warn!(applied = report.reconciled, error = %source, "aborting marks ingestion");
    IngestError::Storage {
        applied: report.reconciled,
        source,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use proptest::prelude::*;

    use super::*;
    use crate::models::{Department, MarkRecord};
    use crate::store::{MemoryStore, StudentStore};

    fn student(name: &str, roll: &str) -> Student {
        Student {
            id: Uuid::new_v4(),
            name: name.to_string(),
            roll: roll.to_string(),
            dept: Department::Cs,
            gpa: 7.2,
            attendance: 82,
            risk: 0,
            created_at: Utc::now(),
        }
    }

    fn row(roll: &str, subject: &str, marks: [&str; 3], upc: Option<&str>) -> MarkRow {
        MarkRow {
            roll: Some(roll.to_string()),
            student_id: None,
            subject: Some(subject.to_string()),
            internal1: Some(marks[0].to_string()),
            internal2: Some(marks[1].to_string()),
            internal3: Some(marks[2].to_string()),
            upc_days: upc.map(str::to_string),
        }
    }

    fn count_pair(marks: &[MarkRecord], student_id: Uuid, subject: &str) -> usize {
        marks
            .iter()
            .filter(|mark| mark.student_id == student_id && mark.subject == subject)
            .count()
    }

    #[test]
    fn coercion_defaults_to_zero() {
        assert_eq!(coerce_number(None), 0.0);
        assert_eq!(coerce_number(Some("")), 0.0);
        assert_eq!(coerce_number(Some("abc")), 0.0);
        assert_eq!(coerce_number(Some("NaN")), 0.0);
        assert_eq!(coerce_number(Some(" 12.5 ")), 12.5);
    }

    #[test]
    fn normalization_derives_two_decimal_average() {
        let marks = normalize_row(&row("CS1", "Maths", ["10", "11", "11"], None)).unwrap();
        assert_eq!(marks.avg_internal, 10.67);
        assert!(!marks.has_upc);
        assert_eq!(marks.upc_days, 0.0);
    }

    #[test]
    fn normalization_flags_upc_when_present() {
        let marks = normalize_row(&row("CS1", "Maths", ["40", "", "x"], Some("7"))).unwrap();
        assert!(marks.has_upc);
        assert_eq!(marks.upc_days, 7.0);
        assert_eq!(marks.internal2, 0.0);
        assert_eq!(marks.internal3, 0.0);
    }

    #[test]
    fn normalization_rejects_out_of_range_values() {
        let err = normalize_row(&row("CS1", "Maths", ["51", "0", "0"], None)).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { field: "internal1", .. }));

        let err = normalize_row(&row("CS1", "Maths", ["1", "1", "1"], Some("11"))).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { field: "upc_days", .. }));

        let err = normalize_row(&row("CS1", "Maths", ["-1", "1", "1"], None)).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test]
    fn normalization_requires_subject() {
        let err = normalize_row(&row("CS1", "  ", ["1", "1", "1"], None)).unwrap_err();
        assert_eq!(err, ValidationError::EmptySubject);
    }

    #[test]
    fn csv_parsing_ignores_unknown_columns() {
        let input = "roll,subject,internal1,internal2,internal3,section\n\
                     CS1, Maths ,10,20,30,A\n\
                     CS2,Physics,,5,5,B\n";
        let rows = parse_marks_csv(input.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].subject.as_deref(), Some("Maths"));
        assert_eq!(rows[0].upc_days, None);
        assert_eq!(rows[1].roll.as_deref(), Some("CS2"));
    }

    #[test]
    fn csv_parsing_accepts_student_id_column() {
        let id = Uuid::new_v4();
        let input = format!("studentId,subject,internal1,internal2,internal3,upc_days\n{id},Maths,1,2,3,4\n");
        let rows = parse_marks_csv(input.as_bytes()).unwrap();
        assert_eq!(rows[0].student_id.as_deref(), Some(id.to_string().as_str()));
        assert_eq!(rows[0].upc_days.as_deref(), Some("4"));
    }

    #[test]
    fn csv_parsing_rejects_ragged_rows() {
        let input = "roll,subject,internal1,internal2,internal3\nCS1,Maths,1,2,3\nCS2,Maths,1\n";
        assert!(matches!(
            parse_marks_csv(input.as_bytes()),
            Err(IngestError::Parse(_))
        ));
    }

    #[test]
    fn csv_parsing_requires_subject_column() {
        let input = "roll,internal1\nCS1,4\n";
        assert!(matches!(
            parse_marks_csv(input.as_bytes()),
            Err(IngestError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn bulk_ingest_replaces_existing_duplicates() {
        let asha = student("Asha Rao", "CS101");
        let stale = |subject: &str| {
            NewMarkRecord {
                student_id: asha.id,
                student_name: "Asha R.".to_string(),
                roll: "CS101".to_string(),
                subject: subject.to_string(),
                internal1: 1.0,
                internal2: 1.0,
                internal3: 1.0,
                avg_internal: 1.0,
                has_upc: false,
                upc_days: 0.0,
            }
            .into_record(Uuid::new_v4())
        };
        let store = MemoryStore::with_records(
            vec![asha.clone()],
            vec![stale("Maths"), stale("Maths"), stale("Physics")],
        );
        let ingestor = MarksIngestor::new(&store, ReconcileMode::DeleteThenInsert);

        let rows = vec![row("CS101", "Maths", ["30", "35", "40"], Some("8"))];
        let report = ingestor.ingest_bulk(&[asha.clone()], &rows).await.unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.deleted, 2);

        let marks = store.list_marks().await.unwrap();
        assert_eq!(count_pair(&marks, asha.id, "Maths"), 1);
        assert_eq!(count_pair(&marks, asha.id, "Physics"), 1);
        let maths = marks.iter().find(|mark| mark.subject == "Maths").unwrap();
        assert_eq!(maths.student_name, "Asha Rao");
        assert_eq!(maths.avg_internal, 35.0);
        assert!(maths.has_upc);
    }

    #[tokio::test]
    async fn bulk_ingest_skips_unknown_rolls_and_keeps_going() {
        let asha = student("Asha Rao", "CS101");
        let store = MemoryStore::new();
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);

        let rows = vec![
            row("NOPE", "Maths", ["10", "10", "10"], None),
            row("CS101", "", ["10", "10", "10"], None),
            row("CS101", "Maths", ["10", "10", "99"], None),
            row("CS101", "Maths", ["10", "10", "10"], None),
        ];
        let report = ingestor.ingest_bulk(&[asha.clone()], &rows).await.unwrap();

        assert_eq!(report.rows, 4);
        assert_eq!(report.reconciled, 1);
        let skipped: Vec<usize> = report.skipped.iter().map(|skip| skip.row).collect();
        assert_eq!(skipped, vec![1, 2, 3]);

        let marks = store.list_marks().await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].roll, "CS101");
    }

    #[tokio::test]
    async fn duplicate_rows_in_one_batch_leave_one_record() {
        let asha = student("Asha Rao", "CS101");
        let store = MemoryStore::without_atomic_upsert();
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);
        assert_eq!(ingestor.mode(), ReconcileMode::DeleteThenInsert);

        let rows = vec![
            row("CS101", "Maths", ["10", "10", "10"], None),
            row("CS101", "Maths", ["20", "20", "20"], None),
        ];
        let report = ingestor.ingest_bulk(&[asha.clone()], &rows).await.unwrap();
        assert_eq!(report.deleted, 1);

        let marks = store.list_marks().await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].avg_internal, 20.0);
    }

    #[tokio::test]
    async fn student_id_takes_precedence_over_roll() {
        let asha = student("Asha Rao", "CS101");
        let kabir = student("Kabir Singh", "IT207");
        let store = MemoryStore::new();
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);

        let mut by_id = row("CS101", "Maths", ["10", "10", "10"], None);
        by_id.student_id = Some(kabir.id.to_string());
        ingestor
            .ingest_bulk(&[asha.clone(), kabir.clone()], &[by_id])
            .await
            .unwrap();

        let marks = store.list_marks().await.unwrap();
        assert_eq!(marks[0].student_id, kabir.id);
        assert_eq!(marks[0].roll, "IT207");
    }

    #[tokio::test]
    async fn manual_entry_requires_selected_student() {
        let store = MemoryStore::new();
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);
        let rows = vec![row("", "Maths", ["10", "10", "10"], None)];

        let err = ingestor.ingest_manual(&[], None, &rows).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Validation(ValidationError::NoStudentSelected)
        ));
        assert!(store.list_marks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_entry_rejects_whole_submission_on_bad_value() {
        let asha = student("Asha Rao", "CS101");
        let store = MemoryStore::new();
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);
        let rows = vec![
            row("", "Maths", ["10", "10", "10"], None),
            row("", "Physics", ["10", "80", "10"], None),
        ];

        let err = ingestor
            .ingest_manual(&[asha.clone()], Some(asha.id), &rows)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Validation(ValidationError::OutOfRange { .. })
        ));
        assert!(store.list_marks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_entry_skips_blank_subjects() {
        let asha = student("Asha Rao", "CS101");
        let store = MemoryStore::new();
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);
        let rows = vec![
            row("", "", ["", "", ""], None),
            row("", "Maths", ["12", "", "18"], Some("9")),
        ];

        let report = ingestor
            .ingest_manual(&[asha.clone()], Some(asha.id), &rows)
            .await
            .unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].row, 1);

        let marks = store.list_marks().await.unwrap();
        assert_eq!(marks[0].avg_internal, 10.0);
        assert_eq!(marks[0].upc_days, 9.0);
    }

    /// Fails every insert after the first `allowed` ones.
    struct FlakyStore {
        inner: MemoryStore,
        allowed: usize,
        inserts: AtomicUsize,
    }

    #[async_trait]
    impl MarkStore for FlakyStore {
        async fn find_records(
            &self,
            student_id: Uuid,
            subject: &str,
        ) -> Result<Vec<MarkRecord>, StoreError> {
            self.inner.find_records(student_id, subject).await
        }

        async fn delete_record(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_record(id).await
        }

        async fn insert_record(&self, record: NewMarkRecord) -> Result<Uuid, StoreError> {
            if self.inserts.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            self.inner.insert_record(record).await
        }

        async fn list_marks(&self) -> Result<Vec<MarkRecord>, StoreError> {
            self.inner.list_marks().await
        }
    }

    #[tokio::test]
    async fn storage_failure_aborts_without_rollback() {
        let asha = student("Asha Rao", "CS101");
        let store = FlakyStore {
            inner: MemoryStore::new(),
            allowed: 1,
            inserts: AtomicUsize::new(0),
        };
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);
        let rows = vec![
            row("CS101", "Maths", ["10", "10", "10"], None),
            row("CS101", "Physics", ["10", "10", "10"], None),
            row("CS101", "Chemistry", ["10", "10", "10"], None),
        ];

        let err = ingestor.ingest_bulk(&[asha.clone()], &rows).await.unwrap_err();
        assert!(matches!(err, IngestError::Storage { applied: 1, .. }));

        let marks = store.list_marks().await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].subject, "Maths");
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Delete(Uuid),
        Insert(String),
    }

    struct RecordingStore {
        inner: MemoryStore,
        ops: StdMutex<Vec<Op>>,
    }

    #[async_trait]
    impl MarkStore for RecordingStore {
        async fn find_records(
            &self,
            student_id: Uuid,
            subject: &str,
        ) -> Result<Vec<MarkRecord>, StoreError> {
            self.inner.find_records(student_id, subject).await
        }

        async fn delete_record(&self, id: Uuid) -> Result<bool, StoreError> {
            let removed = self.inner.delete_record(id).await?;
            self.ops.lock().unwrap().push(Op::Delete(id));
            Ok(removed)
        }

        async fn insert_record(&self, record: NewMarkRecord) -> Result<Uuid, StoreError> {
            let subject = record.subject.clone();
            let id = self.inner.insert_record(record).await?;
            self.ops.lock().unwrap().push(Op::Insert(subject));
            Ok(id)
        }

        async fn list_marks(&self) -> Result<Vec<MarkRecord>, StoreError> {
            self.inner.list_marks().await
        }
    }

    #[tokio::test]
    async fn stale_records_are_deleted_before_the_insert() {
        let asha = student("Asha Rao", "CS101");
        let store = RecordingStore {
            inner: MemoryStore::new(),
            ops: StdMutex::new(Vec::new()),
        };
        let ingestor = MarksIngestor::new(&store, ReconcileMode::DeleteThenInsert);
        let first = vec![row("CS101", "Maths", ["10", "10", "10"], None)];
        ingestor.ingest_bulk(&[asha.clone()], &first).await.unwrap();
        let first_id = store.list_marks().await.unwrap()[0].id;

        ingestor.ingest_bulk(&[asha.clone()], &first).await.unwrap();
        let ops = store.ops.lock().unwrap().clone();
        assert_eq!(
            ops,
            vec![
                Op::Insert("Maths".to_string()),
                Op::Delete(first_id),
                Op::Insert("Maths".to_string()),
            ]
        );
    }

    /// Hands control back to the scheduler after every lookup, so two
    /// batches polled together both see the same stale records.
    struct YieldingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl MarkStore for YieldingStore {
        async fn find_records(
            &self,
            student_id: Uuid,
            subject: &str,
        ) -> Result<Vec<MarkRecord>, StoreError> {
            let found = self.inner.find_records(student_id, subject).await?;
            tokio::task::yield_now().await;
            Ok(found)
        }

        async fn delete_record(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_record(id).await
        }

        async fn insert_record(&self, record: NewMarkRecord) -> Result<Uuid, StoreError> {
            self.inner.insert_record(record).await
        }

        async fn list_marks(&self) -> Result<Vec<MarkRecord>, StoreError> {
            self.inner.list_marks().await
        }
    }

    #[tokio::test]
    async fn interleaved_batches_on_one_pair_both_complete() {
        let asha = student("Asha Rao", "CS101");
        let store = YieldingStore {
            inner: MemoryStore::without_atomic_upsert(),
        };
        let seed = MarksIngestor::new(&store, ReconcileMode::DeleteThenInsert);
        seed.ingest_bulk(&[asha.clone()], &[row("CS101", "Maths", ["1", "1", "1"], None)])
            .await
            .unwrap();

        let first = MarksIngestor::new(&store, ReconcileMode::DeleteThenInsert);
        let second = MarksIngestor::new(&store, ReconcileMode::DeleteThenInsert);
        let first_rows = vec![row("CS101", "Maths", ["10", "10", "10"], None)];
        let second_rows = vec![row("CS101", "Maths", ["20", "20", "20"], None)];
        let roster = [asha.clone()];
        let (first_report, second_report) = tokio::join!(
            first.ingest_bulk(&roster, &first_rows),
            second.ingest_bulk(&roster, &second_rows),
        );
        let (first_report, second_report) = (first_report.unwrap(), second_report.unwrap());
        assert_eq!(first_report.reconciled, 1);
        assert_eq!(second_report.reconciled, 1);
        assert_eq!(first_report.deleted + second_report.deleted, 1);

        // the uncoordinated window may leave both inserts; the next batch settles it
        seed.ingest_bulk(&roster, &second_rows).await.unwrap();
        let marks = store.list_marks().await.unwrap();
        assert_eq!(count_pair(&marks, asha.id, "Maths"), 1);
        assert_eq!(marks[0].avg_internal, 20.0);
    }

    #[tokio::test]
    async fn repeated_roll_resolves_to_last_student() {
        let first = student("Asha Rao", "CS101");
        let second = student("Asha Rao", "CS101");
        let store = MemoryStore::new();
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);

        ingestor
            .ingest_bulk(
                &[first.clone(), second.clone()],
                &[row("CS101", "Maths", ["10", "10", "10"], None)],
            )
            .await
            .unwrap();

        let marks = store.list_marks().await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].student_id, second.id);
    }

    #[tokio::test]
    async fn delete_mark_removes_one_record() {
        let asha = student("Asha Rao", "CS101");
        let store = MemoryStore::new();
        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);
        let rows = vec![
            row("CS101", "Maths", ["10", "10", "10"], None),
            row("CS101", "Physics", ["10", "10", "10"], None),
        ];
        ingestor.ingest_bulk(&[asha.clone()], &rows).await.unwrap();
        let maths = store
            .find_records(asha.id, "Maths")
            .await
            .unwrap()
            .remove(0);

        delete_mark(&store, maths.id).await.unwrap();
        let marks = store.list_marks().await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].subject, "Physics");

        let err = delete_mark(&store, maths.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == maths.id));
    }

    #[tokio::test]
    async fn ingested_students_come_from_the_caller_snapshot() {
        let store = MemoryStore::new();
        let asha = student("Asha Rao", "CS101");
        store.insert_student(&asha).await.unwrap();

        let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);
        let rows = vec![row("CS101", "Maths", ["10", "10", "10"], None)];
        let report = ingestor.ingest_bulk(&[], &rows).await.unwrap();
        assert_eq!(report.reconciled, 0);
        assert_eq!(report.skipped.len(), 1);
    }

    fn arb_row() -> impl Strategy<Value = (usize, usize, u8, u8, u8)> {
        (0usize..3, 0usize..3, 0u8..=50, 0u8..=50, 0u8..=50)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn repeated_batches_leave_one_record_per_pair(
            picks in prop::collection::vec(arb_row(), 1..20),
            atomic in any::<bool>()
        ) {
            let students = vec![
                student("Asha Rao", "CS101"),
                student("Kabir Singh", "IT207"),
                student("Meera Iyer", "ECE310"),
            ];
            let subjects = ["Maths", "Physics", "maths"];
            let rows: Vec<MarkRow> = picks
                .iter()
                .map(|(who, what, a, b, c)| {
                    let (a, b, c) = (a.to_string(), b.to_string(), c.to_string());
                    row(&students[*who].roll, subjects[*what], [a.as_str(), b.as_str(), c.as_str()], None)
                })
                .collect();

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let marks = runtime.block_on(async {
                let store = if atomic { MemoryStore::new() } else { MemoryStore::without_atomic_upsert() };
                let ingestor = MarksIngestor::new(&store, ReconcileMode::Atomic);
                ingestor.ingest_bulk(&students, &rows).await.unwrap();
                ingestor.ingest_bulk(&students, &rows).await.unwrap();
                store.list_marks().await.unwrap()
            });

            for (who, what, ..) in &picks {
                prop_assert_eq!(count_pair(&marks, students[*who].id, subjects[*what]), 1);
            }
            prop_assert!(marks.len() <= students.len() * subjects.len());
        }
    }
}
