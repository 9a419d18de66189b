//! Storage collaborator seams. The core never keeps state of its own: it is
//! handed a store and works on point-in-time snapshots read from it.

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Intervention, MarkRecord, NewIntervention, NewMarkRecord, Student};

/// Result of an atomic upsert keyed on (student, subject).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: Uuid,
    pub replaced: usize,
}

#[async_trait]
pub trait MarkStore: Send + Sync {
    /// Exact match on both fields. Usually zero or one record, more only
    /// when earlier writes left duplicates behind.
    async fn find_records(
        &self,
        student_id: Uuid,
        subject: &str,
    ) -> Result<Vec<MarkRecord>, StoreError>;

    /// Removes one record. Returns `false` when it was already gone, which
    /// happens when another batch reconciled the same pair first.
    async fn delete_record(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn insert_record(&self, record: NewMarkRecord) -> Result<Uuid, StoreError>;

    fn supports_atomic_upsert(&self) -> bool {
        false
    }

    /// Replace every record for the row's (student, subject) with `record`
    /// in a single atomic step.
    async fn upsert_record(&self, record: NewMarkRecord) -> Result<Upserted, StoreError> {
        let _ = record;
        Err(StoreError::UpsertUnsupported)
    }

    async fn list_marks(&self) -> Result<Vec<MarkRecord>, StoreError>;
}

#[async_trait]
pub trait StudentStore: Send + Sync {
    async fn list_students(&self) -> Result<Vec<Student>, StoreError>;

    async fn find_student(&self, id: Uuid) -> Result<Option<Student>, StoreError>;

    async fn insert_student(&self, student: &Student) -> Result<(), StoreError>;

    async fn update_student(&self, student: &Student) -> Result<(), StoreError>;

    async fn delete_student(&self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait InterventionStore: Send + Sync {
    async fn insert_intervention(
        &self,
        intervention: NewIntervention,
    ) -> Result<Intervention, StoreError>;

    /// Interventions for one student, oldest first.
    async fn list_interventions(&self, student_id: Uuid) -> Result<Vec<Intervention>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    students: Vec<Student>,
    marks: Vec<MarkRecord>,
    interventions: Vec<Intervention>,
}

/// Process-local store. Every operation takes the single state lock, so an
/// atomic upsert is trivially available unless disabled.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    atomic_upsert: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            atomic_upsert: true,
        }
    }

    /// A store that behaves like a backend without transactions.
    pub fn without_atomic_upsert() -> Self {
        Self {
            atomic_upsert: false,
            ..Self::new()
        }
    }

    pub fn with_records(students: Vec<Student>, marks: Vec<MarkRecord>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                students,
                marks,
                interventions: Vec::new(),
            }),
            atomic_upsert: true,
        }
    }
}

#[async_trait]
impl MarkStore for MemoryStore {
    async fn find_records(
        &self,
        student_id: Uuid,
        subject: &str,
    ) -> Result<Vec<MarkRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .marks
            .iter()
            .filter(|mark| mark.student_id == student_id && mark.subject == subject)
            .cloned()
            .collect())
    }

    async fn delete_record(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.marks.len();
        state.marks.retain(|mark| mark.id != id);
        Ok(state.marks.len() < before)
    }

    async fn insert_record(&self, record: NewMarkRecord) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.state.lock().await.marks.push(record.into_record(id));
        Ok(id)
    }

    fn supports_atomic_upsert(&self) -> bool {
        self.atomic_upsert
    }

    async fn upsert_record(&self, record: NewMarkRecord) -> Result<Upserted, StoreError> {
        if !self.atomic_upsert {
            return Err(StoreError::UpsertUnsupported);
        }

        let mut state = self.state.lock().await;
        let before = state.marks.len();
        state
            .marks
            .retain(|mark| !(mark.student_id == record.student_id && mark.subject == record.subject));
        let replaced = before - state.marks.len();

        let id = Uuid::new_v4();
        state.marks.push(record.into_record(id));
        Ok(Upserted { id, replaced })
    }

    async fn list_marks(&self) -> Result<Vec<MarkRecord>, StoreError> {
        Ok(self.state.lock().await.marks.clone())
    }
}

#[async_trait]
impl StudentStore for MemoryStore {
    async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        Ok(self.state.lock().await.students.clone())
    }

    async fn find_student(&self, id: Uuid) -> Result<Option<Student>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.students.iter().find(|student| student.id == id).cloned())
    }

    async fn insert_student(&self, student: &Student) -> Result<(), StoreError> {
        self.state.lock().await.students.push(student.clone());
        Ok(())
    }

    async fn update_student(&self, student: &Student) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let existing = state
            .students
            .iter_mut()
            .find(|existing| existing.id == student.id)
            .ok_or(StoreError::NotFound(student.id))?;
        *existing = student.clone();
        Ok(())
    }

    async fn delete_student(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let before = state.students.len();
        state.students.retain(|student| student.id != id);
        if state.students.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl InterventionStore for MemoryStore {
    async fn insert_intervention(
        &self,
        intervention: NewIntervention,
    ) -> Result<Intervention, StoreError> {
        let stored = Intervention {
            id: Uuid::new_v4(),
            student_id: intervention.student_id,
            student_name: intervention.student_name,
            kind: intervention.kind,
            note: intervention.note,
            created_by: intervention.created_by,
            created_at: intervention.created_at,
            status: intervention.status,
        };
        self.state.lock().await.interventions.push(stored.clone());
        Ok(stored)
    }

    async fn list_interventions(&self, student_id: Uuid) -> Result<Vec<Intervention>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<Intervention> = state
            .interventions
            .iter()
            .filter(|intervention| intervention.student_id == student_id)
            .cloned()
            .collect();
        found.sort_by_key(|intervention| intervention.created_at);
        Ok(found)
    }
}
