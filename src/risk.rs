use serde::Serialize;

use crate::models::{MarkRecord, RiskTier, Student};

/// Ceiling applied to the profile score. Both factors at their worst add up
/// to 80, so the ceiling is a policy limit rather than a reachable bound.
pub const PROFILE_RISK_CAP: i32 = 95;

const HIGH_TIER_FLOOR: i32 = 70;
const MEDIUM_TIER_FLOOR: i32 = 40;

const AVG_WEIGHT: f64 = 40.0;
const UPC_WEIGHT: f64 = 30.0;
const ATTENDANCE_WEIGHT: f64 = 30.0;

/// Profile-only risk used to populate the cached `Student::risk`.
pub fn profile_risk(gpa: f64, attendance: i32) -> i32 {
    let mut risk = 0;

    if gpa < 5.0 {
        risk += 40;
    } else if gpa < 7.0 {
        risk += 20;
    }

    if attendance < 50 {
        risk += 40;
    } else if attendance < 75 {
        risk += 20;
    }

    risk.min(PROFILE_RISK_CAP)
}

/// Current risk taking every mark record into account. Falls back to the
/// cached profile risk when no marks exist yet.
pub fn marks_aware_risk(student: &Student, marks: &[MarkRecord]) -> i32 {
    if marks.is_empty() {
        return student.risk;
    }

    let mut earned = 0.0;
    let mut max_possible = 0.0;

    for mark in marks {
        earned += avg_points(mark.avg_percent());
        max_possible += AVG_WEIGHT;

        if let Some(upc_pct) = mark.upc_percent() {
            earned += upc_points(upc_pct);
            max_possible += UPC_WEIGHT;
        }
    }

    earned += attendance_points(student.attendance);
    max_possible += ATTENDANCE_WEIGHT;

    (earned / max_possible * 100.0).round() as i32
}

fn avg_points(avg_pct: f64) -> f64 {
    if avg_pct < 40.0 {
        AVG_WEIGHT
    } else if avg_pct < 60.0 {
        AVG_WEIGHT / 2.0
    } else {
        0.0
    }
}

fn upc_points(upc_pct: f64) -> f64 {
    if upc_pct < 50.0 {
        UPC_WEIGHT
    } else if upc_pct < 70.0 {
        UPC_WEIGHT / 2.0
    } else {
        0.0
    }
}

fn attendance_points(attendance: i32) -> f64 {
    if attendance < 50 {
        ATTENDANCE_WEIGHT
    } else if attendance < 75 {
        ATTENDANCE_WEIGHT / 2.0
    } else {
        0.0
    }
}

pub fn tier_for_score(score: i32) -> RiskTier {
    if score >= HIGH_TIER_FLOOR {
        RiskTier::High
    } else if score >= MEDIUM_TIER_FLOOR {
        RiskTier::Medium
    } else {
        RiskTier::Low
    }
}

/// Tier of a single subject. A subject without a UPC gate is judged on its
/// internal average alone.
pub fn subject_tier(mark: &MarkRecord) -> RiskTier {
    let avg_pct = mark.avg_percent();
    let upc_pct = mark.upc_percent().unwrap_or(100.0);

    if avg_pct < 40.0 || upc_pct < 50.0 {
        RiskTier::High
    } else if avg_pct < 60.0 || upc_pct < 70.0 {
        RiskTier::Medium
    } else {
        RiskTier::Low
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectRisk {
    pub subject: String,
    pub tier: RiskTier,
    pub avg_internal: f64,
    pub avg_percent: f64,
    pub upc_days: Option<f64>,
}

impl SubjectRisk {
    pub fn from_record(mark: &MarkRecord) -> Self {
        Self {
            subject: mark.subject.clone(),
            tier: subject_tier(mark),
            avg_internal: mark.avg_internal,
            avg_percent: mark.avg_percent(),
            upc_days: mark.has_upc.then_some(mark.upc_days),
        }
    }
}

/// Subjects explaining why a student is at risk: every record whose own
/// tier is above LOW, in input order.
pub fn at_risk_subjects(marks: &[MarkRecord]) -> Vec<SubjectRisk> {
    marks
        .iter()
        .map(SubjectRisk::from_record)
        .filter(|subject| subject.tier != RiskTier::Low)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub cached_risk: i32,
    pub score: i32,
    pub tier: RiskTier,
    pub at_risk_subjects: Vec<SubjectRisk>,
}

/// Detail-view assessment for one student. Only marks belonging to the
/// student are considered.
pub fn assess_student(student: &Student, marks: &[MarkRecord]) -> RiskAssessment {
    let own: Vec<MarkRecord> = marks
        .iter()
        .filter(|mark| mark.student_id == student.id)
        .cloned()
        .collect();
    let score = marks_aware_risk(student, &own);

    RiskAssessment {
        cached_risk: student.risk,
        score,
        tier: tier_for_score(score),
        at_risk_subjects: at_risk_subjects(&own),
    }
}
