use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::StoreError;
use crate::ingest::{MarksIngestor, ReconcileMode};
use crate::models::{
    Department, Intervention, InterventionStatus, InterventionType, MarkRecord, MarkRow,
    NewIntervention, NewMarkRecord, Student,
};
use crate::risk;
use crate::store::{InterventionStore, MarkStore, StudentStore, Upserted};

const MARK_COLUMNS: &str = "id, student_id, student_name, roll, subject, internal1, internal2, \
                            internal3, avg_internal, has_upc, upc_days";
const STUDENT_COLUMNS: &str = "id, name, roll, dept, gpa, attendance, risk, created_at";
const INTERVENTION_COLUMNS: &str =
    "id, student_id, student_name, kind, note, created_by, created_at, status";

/// Postgres-backed store for students, marks and interventions.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let database_url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn mark_from_row(row: &PgRow) -> Result<MarkRecord, StoreError> {
    Ok(MarkRecord {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        student_name: row.try_get("student_name")?,
        roll: row.try_get("roll")?,
        subject: row.try_get("subject")?,
        internal1: row.try_get("internal1")?,
        internal2: row.try_get("internal2")?,
        internal3: row.try_get("internal3")?,
        avg_internal: row.try_get("avg_internal")?,
        has_upc: row.try_get("has_upc")?,
        upc_days: row.try_get("upc_days")?,
    })
}

fn student_from_row(row: &PgRow) -> Result<Student, StoreError> {
    let dept: String = row.try_get("dept")?;
    Ok(Student {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        roll: row.try_get("roll")?,
        dept: Department::parse(&dept)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown department `{dept}`")))?,
        gpa: row.try_get("gpa")?,
        attendance: row.try_get("attendance")?,
        risk: row.try_get("risk")?,
        created_at: row.try_get("created_at")?,
    })
}

fn intervention_from_row(row: &PgRow) -> Result<Intervention, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(Intervention {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        student_name: row.try_get("student_name")?,
        kind: InterventionType::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown intervention type `{kind}`")))?,
        note: row.try_get("note")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        status: InterventionStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown intervention status `{status}`")))?,
    })
}

async fn insert_mark<'e, E>(executor: E, id: Uuid, record: &NewMarkRecord) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO early_warning.marks
        (id, student_id, student_name, roll, subject, internal1, internal2, internal3,
         avg_internal, has_upc, upc_days)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(id)
    .bind(record.student_id)
    .bind(&record.student_name)
    .bind(&record.roll)
    .bind(&record.subject)
    .bind(record.internal1)
    .bind(record.internal2)
    .bind(record.internal3)
    .bind(record.avg_internal)
    .bind(record.has_upc)
    .bind(record.upc_days)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl MarkStore for PgStore {
    async fn find_records(
        &self,
        student_id: Uuid,
        subject: &str,
    ) -> Result<Vec<MarkRecord>, StoreError> {
        let query = format!(
            "SELECT {MARK_COLUMNS} FROM early_warning.marks WHERE student_id = $1 AND subject = $2"
        );
        let rows = sqlx::query(&query)
            .bind(student_id)
            .bind(subject)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(mark_from_row).collect()
    }

    async fn delete_record(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM early_warning.marks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_record(&self, record: NewMarkRecord) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        insert_mark(&self.pool, id, &record).await?;
        Ok(id)
    }

    fn supports_atomic_upsert(&self) -> bool {
        true
    }

    async fn upsert_record(&self, record: NewMarkRecord) -> Result<Upserted, StoreError> {
        let mut tx = self.pool.begin().await?;

        // held until commit, so concurrent upserts of one pair run one at a time
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}", record.student_id, record.subject))
            .execute(&mut *tx)
            .await?;

        let deleted =
            sqlx::query("DELETE FROM early_warning.marks WHERE student_id = $1 AND subject = $2")
                .bind(record.student_id)
                .bind(&record.subject)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        let id = Uuid::new_v4();
        insert_mark(&mut *tx, id, &record).await?;
        tx.commit().await?;

        Ok(Upserted {
            id,
            replaced: usize::try_from(deleted).unwrap_or(usize::MAX),
        })
    }

    async fn list_marks(&self) -> Result<Vec<MarkRecord>, StoreError> {
        let query = format!(
            "SELECT {MARK_COLUMNS} FROM early_warning.marks ORDER BY roll, subject"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(mark_from_row).collect()
    }
}

#[async_trait]
impl StudentStore for PgStore {
    async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let query = format!("SELECT {STUDENT_COLUMNS} FROM early_warning.students ORDER BY roll");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(student_from_row).collect()
    }

    async fn find_student(&self, id: Uuid) -> Result<Option<Student>, StoreError> {
        let query = format!("SELECT {STUDENT_COLUMNS} FROM early_warning.students WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(student_from_row).transpose()
    }

    async fn insert_student(&self, student: &Student) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO early_warning.students
            (id, name, roll, dept, gpa, attendance, risk, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(student.id)
        .bind(&student.name)
        .bind(&student.roll)
        .bind(student.dept.as_str())
        .bind(student.gpa)
        .bind(student.attendance)
        .bind(student.risk)
        .bind(student.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_student(&self, student: &Student) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE early_warning.students
            SET name = $2, roll = $3, dept = $4, gpa = $5, attendance = $6, risk = $7
            WHERE id = $1
            "#,
        )
        .bind(student.id)
        .bind(&student.name)
        .bind(&student.roll)
        .bind(student.dept.as_str())
        .bind(student.gpa)
        .bind(student.attendance)
        .bind(student.risk)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(student.id));
        }
        Ok(())
    }

    async fn delete_student(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM early_warning.students WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl InterventionStore for PgStore {
    async fn insert_intervention(
        &self,
        intervention: NewIntervention,
    ) -> Result<Intervention, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO early_warning.interventions
            (id, student_id, student_name, kind, note, created_by, created_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(intervention.student_id)
        .bind(&intervention.student_name)
        .bind(intervention.kind.as_str())
        .bind(&intervention.note)
        .bind(&intervention.created_by)
        .bind(intervention.created_at)
        .bind(intervention.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(Intervention {
            id,
            student_id: intervention.student_id,
            student_name: intervention.student_name,
            kind: intervention.kind,
            note: intervention.note,
            created_by: intervention.created_by,
            created_at: intervention.created_at,
            status: intervention.status,
        })
    }

    async fn list_interventions(&self, student_id: Uuid) -> Result<Vec<Intervention>, StoreError> {
        let query = format!(
            "SELECT {INTERVENTION_COLUMNS} FROM early_warning.interventions \
             WHERE student_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(intervention_from_row).collect()
    }
}

fn seed_mark_row(roll: &str, subject: &str, internals: [&str; 3], upc_days: Option<&str>) -> MarkRow {
    MarkRow {
        roll: Some(roll.to_string()),
        student_id: None,
        subject: Some(subject.to_string()),
        internal1: Some(internals[0].to_string()),
        internal2: Some(internals[1].to_string()),
        internal3: Some(internals[2].to_string()),
        upc_days: upc_days.map(str::to_string),
    }
}

/// Loads a small demo cohort. Safe to run repeatedly: students are upserted
/// on roll and marks go through the regular ingestion path.
pub async fn seed(store: &PgStore, mode: ReconcileMode) -> anyhow::Result<usize> {
    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Asha Rao",
            "CS101",
            Department::Cs,
            6.4,
            68,
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Kabir Singh",
            "IT207",
            Department::It,
            8.1,
            91,
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Dev Nair",
            "ME400",
            Department::Mech,
            4.6,
            47,
        ),
    ];

    for (id, name, roll, dept, gpa, attendance) in students {
        sqlx::query(
            r#"
            INSERT INTO early_warning.students (id, name, roll, dept, gpa, attendance, risk)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (roll) DO UPDATE
            SET name = EXCLUDED.name, dept = EXCLUDED.dept, gpa = EXCLUDED.gpa,
                attendance = EXCLUDED.attendance, risk = EXCLUDED.risk
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(roll)
        .bind(dept.as_str())
        .bind(gpa)
        .bind(attendance)
        .bind(risk::profile_risk(gpa, attendance))
        .execute(store.pool())
        .await?;
    }

    let rows = vec![
        seed_mark_row("CS101", "Data Structures", ["22", "25", "19"], Some("6")),
        seed_mark_row("CS101", "Discrete Maths", ["31", "35", "33"], None),
        seed_mark_row("IT207", "Networks", ["44", "41", "46"], Some("9")),
        seed_mark_row("ME400", "Thermodynamics", ["12", "18", "15"], Some("3")),
        seed_mark_row("ME400", "Engineering Drawing", ["28", "26", "30"], None),
    ];

    let roster = store.list_students().await?;
    let report = MarksIngestor::new(store, mode)
        .ingest_bulk(&roster, &rows)
        .await?;
    Ok(report.reconciled)
}
