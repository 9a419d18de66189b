use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Highest raw score a single internal assessment is marked out of.
pub const INTERNAL_MAX: f64 = 50.0;
/// Highest number of UPC days a subject gate is scored out of.
pub const UPC_DAYS_MAX: f64 = 10.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Department {
    Cs,
    It,
    Ece,
    Mech,
}

impl Department {
    pub const ALL: [Department; 4] = [Self::Cs, Self::It, Self::Ece, Self::Mech];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cs => "CS",
            Self::It => "IT",
            Self::Ece => "ECE",
            Self::Mech => "MECH",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cs => "Computer Science",
            Self::It => "Information Technology",
            Self::Ece => "Electronics",
            Self::Mech => "Mechanical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CS" => Some(Self::Cs),
            "IT" => Some(Self::It),
            "ECE" => Some(Self::Ece),
            "MECH" => Some(Self::Mech),
            _ => None,
        }
    }
}

impl Display for Department {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl Display for RiskTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A student as held by the store. `risk` caches the profile-only score and
/// is only refreshed when the profile itself is edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub name: String,
    pub roll: String,
    pub dept: Department,
    pub gpa: f64,
    pub attendance: i32,
    pub risk: i32,
    pub created_at: DateTime<Utc>,
}

/// Editable part of a student record, as submitted by a form or a CSV row.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentProfile {
    pub name: String,
    pub roll: String,
    pub dept: Department,
    pub gpa: f64,
    pub attendance: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub student_name: String,
    pub roll: String,
    pub subject: String,
    pub internal1: f64,
    pub internal2: f64,
    pub internal3: f64,
    pub avg_internal: f64,
    pub has_upc: bool,
    pub upc_days: f64,
}

impl MarkRecord {
    /// Fixed two-decimal rendering of the stored average.
    pub fn avg_internal_display(&self) -> String {
        format!("{:.2}", self.avg_internal)
    }

    pub fn avg_percent(&self) -> f64 {
        self.avg_internal * 100.0 / INTERNAL_MAX
    }

    pub fn upc_percent(&self) -> Option<f64> {
        self.has_upc.then(|| self.upc_days * 100.0 / UPC_DAYS_MAX)
    }
}

/// Normalized fields of a mark record before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMarkRecord {
    pub student_id: Uuid,
    pub student_name: String,
    pub roll: String,
    pub subject: String,
    pub internal1: f64,
    pub internal2: f64,
    pub internal3: f64,
    pub avg_internal: f64,
    pub has_upc: bool,
    pub upc_days: f64,
}

impl NewMarkRecord {
    pub fn into_record(self, id: Uuid) -> MarkRecord {
        MarkRecord {
            id,
            student_id: self.student_id,
            student_name: self.student_name,
            roll: self.roll,
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

/// One raw incoming mark row, straight from a marks file or a manual form.
/// Numeric fields stay textual until normalization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MarkRow {
    pub roll: Option<String>,
    #[serde(alias = "studentId")]
    pub student_id: Option<String>,
    pub subject: Option<String>,
    pub internal1: Option<String>,
    pub internal2: Option<String>,
    pub internal3: Option<String>,
    pub upc_days: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    Counseling,
    ParentNotified,
    AcademicSupport,
    WarningIssued,
}

impl InterventionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counseling => "counseling",
            Self::ParentNotified => "parent_notified",
            Self::AcademicSupport => "academic_support",
            Self::WarningIssued => "warning_issued",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Counseling => "Counseling Session",
            Self::ParentNotified => "Parent Notified",
            Self::AcademicSupport => "Academic Support",
            Self::WarningIssued => "Warning Issued",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "counseling" => Some(Self::Counseling),
            "parent_notified" => Some(Self::ParentNotified),
            "academic_support" => Some(Self::AcademicSupport),
            "warning_issued" => Some(Self::WarningIssued),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Open,
    Done,
}

impl InterventionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub id: Uuid,
    pub student_id: Uuid,
    pub student_name: String,
    pub kind: InterventionType,
    pub note: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub status: InterventionStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIntervention {
    pub student_id: Uuid,
    pub student_name: String,
    pub kind: InterventionType,
    pub note: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub status: InterventionStatus,
}
