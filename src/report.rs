use std::fmt::Write;

use serde::Serialize;

use crate::models::{Department, Intervention, MarkRecord, RiskTier, Student};
use crate::risk;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl TierCounts {
    fn add(&mut self, tier: RiskTier) {
        match tier {
            RiskTier::High => self.high += 1,
            RiskTier::Medium => self.medium += 1,
            RiskTier::Low => self.low += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentSummary {
    pub dept: Department,
    pub students: usize,
    pub tiers: TierCounts,
}

/// Cohort-wide figures, all taken from the cached profile risk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CohortSummary {
    pub total: usize,
    pub tiers: TierCounts,
    pub avg_risk: i64,
    pub avg_attendance: i64,
    pub avg_gpa: f64,
    pub departments: Vec<DepartmentSummary>,
}

pub fn summarize_cohort(students: &[Student]) -> CohortSummary {
    let mut summary = CohortSummary {
        total: students.len(),
        ..CohortSummary::default()
    };
    if students.is_empty() {
        return summary;
    }

    let count = students.len() as f64;
    let mut risk_total = 0.0;
    let mut attendance_total = 0.0;
    let mut gpa_total = 0.0;

    for student in students {
        summary.tiers.add(risk::tier_for_score(student.risk));
        risk_total += f64::from(student.risk);
        attendance_total += f64::from(student.attendance);
        gpa_total += student.gpa;
    }

    summary.avg_risk = (risk_total / count).round() as i64;
    summary.avg_attendance = (attendance_total / count).round() as i64;
    summary.avg_gpa = (gpa_total / count * 10.0).round() / 10.0;

    for dept in Department::ALL {
        let mut tiers = TierCounts::default();
        let mut members = 0;
        for student in students.iter().filter(|student| student.dept == dept) {
            tiers.add(risk::tier_for_score(student.risk));
            members += 1;
        }
        if members > 0 {
            summary.departments.push(DepartmentSummary {
                dept,
                students: members,
                tiers,
            });
        }
    }

    summary
}

/// Triage listing: optional department, tier and name/roll search filters,
/// highest cached risk first.
pub fn filter_students<'a>(
    students: &'a [Student],
    dept: Option<Department>,
    tier: Option<RiskTier>,
    search: Option<&str>,
) -> Vec<&'a Student> {
    let needle = search
        .map(|term| term.trim().to_lowercase())
        .filter(|term| !term.is_empty());

    let mut matches: Vec<&Student> = students
        .iter()
        .filter(|student| dept.map_or(true, |dept| student.dept == dept))
        .filter(|student| tier.map_or(true, |tier| risk::tier_for_score(student.risk) == tier))
        .filter(|student| {
            needle.as_deref().map_or(true, |needle| {
                student.name.to_lowercase().contains(needle)
                    || student.roll.to_lowercase().contains(needle)
            })
        })
        .collect();

    matches.sort_by(|a, b| b.risk.cmp(&a.risk).then_with(|| a.roll.cmp(&b.roll)));
    matches
}

pub fn build_student_report(
    student: &Student,
    marks: &[MarkRecord],
    interventions: &[Intervention],
) -> String {
    let assessment = risk::assess_student(student, marks);
    let own_marks: Vec<&MarkRecord> = marks
        .iter()
        .filter(|mark| mark.student_id == student.id)
        .collect();

    let mut output = String::new();

    let _ = writeln!(output, "# {} ({})", student.name, student.roll);
    let _ = writeln!(
        output,
        "{} | GPA {:.1}/10 | Attendance {}%",
        student.dept.label(),
        student.gpa,
        student.attendance
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk");
    let _ = writeln!(
        output,
        "- Current risk score: {}% ({})",
        assessment.score, assessment.tier
    );
    let _ = writeln!(output, "- Profile risk at enrollment: {}%", assessment.cached_risk);
    if own_marks.is_empty() {
        let _ = writeln!(output, "- No marks recorded yet; showing the profile estimate.");
    }

    if !assessment.at_risk_subjects.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Why is this student at risk?");
        for subject in &assessment.at_risk_subjects {
            let mut line = format!(
                "- {} [{}]: avg internal {:.2}/50 ({:.0}%)",
                subject.subject,
                subject.tier,
                subject.avg_internal,
                subject.avg_percent.round()
            );
            if let Some(days) = subject.upc_days {
                let _ = write!(line, ", UPC days {days}/10");
            }
            let _ = writeln!(output, "{line}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Marks");
    if own_marks.is_empty() {
        let _ = writeln!(output, "No marks recorded.");
    } else {
        let _ = writeln!(output, "| Subject | Internals | Avg | UPC | Risk |");
        let _ = writeln!(output, "|---|---|---|---|---|");
        for mark in &own_marks {
            let upc = if mark.has_upc {
                format!("{}/10", mark.upc_days)
            } else {
                "-".to_string()
            };
            let _ = writeln!(
                output,
                "| {} | {} / {} / {} | {}/50 ({:.0}%) | {} | {} |",
                mark.subject,
                mark.internal1,
                mark.internal2,
                mark.internal3,
                mark.avg_internal_display(),
                mark.avg_percent().round(),
                upc,
                risk::subject_tier(mark)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Interventions ({} logged)", interventions.len());
    if interventions.is_empty() {
        let _ = writeln!(output, "No interventions logged.");
    } else {
        for intervention in interventions {
            let _ = writeln!(
                output,
                "- {} {} by {}: {}",
                intervention.created_at.format("%Y-%m-%d"),
                intervention.kind.label(),
                intervention.created_by,
                intervention.note
            );
        }
    }

    output
}

pub fn build_cohort_report(students: &[Student], limit: usize) -> String {
    let summary = summarize_cohort(students);
    let mut output = String::new();

    let _ = writeln!(output, "# Academic Early Warning Report");
    let _ = writeln!(output, "Generated for {} students", summary.total);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Mix");

    if summary.total == 0 {
        let _ = writeln!(output, "No students recorded.");
        return output;
    }

    let _ = writeln!(output, "- High: {}", summary.tiers.high);
    let _ = writeln!(output, "- Medium: {}", summary.tiers.medium);
    let _ = writeln!(output, "- Low: {}", summary.tiers.low);
    let _ = writeln!(
        output,
        "- Average risk {}%, attendance {}%, GPA {:.1}/10",
        summary.avg_risk, summary.avg_attendance, summary.avg_gpa
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## By Department");
    for dept in &summary.departments {
        let _ = writeln!(
            output,
            "- {}: {} students ({} high, {} medium, {} low)",
            dept.dept.label(),
            dept.students,
            dept.tiers.high,
            dept.tiers.medium,
            dept.tiers.low
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");
    for student in filter_students(students, None, None, None).iter().take(limit) {
        let _ = writeln!(
            output,
            "- {} ({}, {}) risk {}% {}",
            student.name,
            student.roll,
            student.dept,
            student.risk,
            risk::tier_for_score(student.risk)
        );
    }

    output
}
