use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use uuid::Uuid;

use early_warning::alerts;
use early_warning::config::AppConfig;
use early_warning::db::{self, PgStore};
use early_warning::ingest::{self, IngestReport, MarksIngestor};
use early_warning::interventions;
use early_warning::logging;
use early_warning::models::{Department, InterventionType, MarkRow, RiskTier, Student, StudentProfile};
use early_warning::report;
use early_warning::risk;
use early_warning::store::{InterventionStore, MarkStore, StudentStore};
use early_warning::students;

#[derive(Parser)]
#[command(name = "early-warning")]
#[command(about = "Academic early warning dashboard for faculty", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ProfileArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    roll: String,
    #[arg(long, value_parser = parse_department, default_value = "CS")]
    dept: Department,
    #[arg(long)]
    gpa: f64,
    #[arg(long)]
    attendance: i32,
}

impl ProfileArgs {
    fn into_profile(self) -> StudentProfile {
        StudentProfile {
            name: self.name,
            roll: self.roll,
            dept: self.dept,
            gpa: self.gpa,
            attendance: self.attendance,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small demo cohort
    Seed,
    /// Add a single student
    AddStudent(ProfileArgs),
    /// Edit a student's profile and refresh the cached risk
    EditStudent {
        /// Roll of the student to edit
        #[arg(long)]
        current_roll: String,
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Delete a student
    DeleteStudent {
        #[arg(long)]
        roll: String,
    },
    /// Import students from a CSV file
    ImportStudents {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import marks from a CSV file
    ImportMarks {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Delete a single mark record by id
    DeleteMark {
        #[arg(long)]
        id: Uuid,
    },
    /// Enter marks for one student, e.g. --mark "Maths:32:28:35:8"
    EnterMarks {
        #[arg(long)]
        student: Option<String>,
        #[arg(long = "mark", value_parser = parse_mark_arg, required = true)]
        marks: Vec<MarkRow>,
    },
    /// Re-score every student against their marks and list alerts
    RefreshRisk {
        /// Alert threshold, defaults to the configured one
        #[arg(long)]
        threshold: Option<i32>,
    },
    /// List students by cached risk
    Score {
        #[arg(long, value_parser = parse_department)]
        dept: Option<Department>,
        #[arg(long, value_parser = parse_tier)]
        tier: Option<RiskTier>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Write a markdown detail report for one student
    Report {
        #[arg(long)]
        roll: String,
        #[arg(long, default_value = "student-report.md")]
        out: PathBuf,
    },
    /// Write a markdown report for the whole cohort
    CohortReport {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Record an intervention for a student
    LogIntervention {
        #[arg(long)]
        roll: String,
        #[arg(long, value_parser = parse_intervention_type)]
        kind: InterventionType,
        #[arg(long)]
        note: String,
        #[arg(long)]
        by: Option<String>,
    },
    /// List interventions for a student
    Interventions {
        #[arg(long)]
        roll: String,
    },
}

fn parse_department(value: &str) -> Result<Department, String> {
    Department::parse(value).ok_or_else(|| format!("unknown department `{value}`"))
}

fn parse_tier(value: &str) -> Result<RiskTier, String> {
    RiskTier::parse(value).ok_or_else(|| format!("unknown risk tier `{value}`"))
}

fn parse_intervention_type(value: &str) -> Result<InterventionType, String> {
    InterventionType::parse(value).ok_or_else(|| format!("unknown intervention type `{value}`"))
}

/// `subject:internal1:internal2:internal3[:upc_days]`
fn parse_mark_arg(value: &str) -> Result<MarkRow, String> {
    let parts: Vec<&str> = value.split(':').collect();
    if !(4..=5).contains(&parts.len()) {
        return Err(format!(
            "expected subject:internal1:internal2:internal3[:upc_days], got `{value}`"
        ));
    }
    let field = |index: usize| parts.get(index).map(|part| part.to_string());
    Ok(MarkRow {
        roll: None,
        student_id: None,
        subject: field(0),
        internal1: field(1),
        internal2: field(2),
        internal3: field(3),
        upc_days: field(4),
    })
}

fn find_by_roll<'a>(students: &'a [Student], roll: &str) -> anyhow::Result<&'a Student> {
    students
        .iter()
        .find(|student| student.roll == roll)
        .with_context(|| format!("no student with roll `{roll}`"))
}

fn print_ingest_summary(label: &str, report: &IngestReport) {
    println!(
        "{label}: {} of {} rows saved, {} replaced, {} skipped.",
        report.reconciled,
        report.rows,
        report.deleted,
        report.skipped.len()
    );
}

#[tokio::main]
async fn main() {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };
    logging::init_tracing(&config.log_filter);

    if let Err(err) = run(config).await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let cli = Cli::parse();
    let store = PgStore::connect(&config).await?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let saved = db::seed(&store, config.reconcile_mode).await?;
            println!("Seed data inserted ({saved} mark records).");
        }
        Commands::AddStudent(profile) => {
            let student = students::create_student(&store, &profile.into_profile()).await?;
            println!("Added {} ({}) with risk {}%.", student.name, student.roll, student.risk);
        }
        Commands::EditStudent {
            current_roll,
            profile,
        } => {
            let roster = store.list_students().await?;
            let id = find_by_roll(&roster, &current_roll)?.id;
            let student = students::update_student(&store, id, &profile.into_profile()).await?;
            println!("Updated {} ({}), risk now {}%.", student.name, student.roll, student.risk);
        }
        Commands::DeleteStudent { roll } => {
            let roster = store.list_students().await?;
            let student = find_by_roll(&roster, &roll)?;
            students::delete_student(&store, student.id).await?;
            println!("Deleted {} ({}).", student.name, student.roll);
        }
        Commands::ImportStudents { csv } => {
            let file = File::open(&csv).with_context(|| format!("failed to open {}", csv.display()))?;
            let report = students::import_students_csv(&store, file).await?;
            println!(
                "Imported {} of {} students from {} ({} skipped).",
                report.created,
                report.rows,
                csv.display(),
                report.skipped
            );
        }
        Commands::ImportMarks { csv } => {
            let file = File::open(&csv).with_context(|| format!("failed to open {}", csv.display()))?;
            let rows = ingest::parse_marks_csv(file)?;
            let roster = store.list_students().await?;
            let report = MarksIngestor::new(&store, config.reconcile_mode)
                .ingest_bulk(&roster, &rows)
                .await?;
            print_ingest_summary("Marks uploaded", &report);
        }
        Commands::DeleteMark { id } => {
            ingest::delete_mark(&store, id).await?;
            println!("Mark record {id} deleted.");
        }
        Commands::EnterMarks { student, marks } => {
            let roster = store.list_students().await?;
            let selected: Option<Uuid> = match student.as_deref() {
                Some(roll) => Some(find_by_roll(&roster, roll)?.id),
                None => None,
            };
            let report = MarksIngestor::new(&store, config.reconcile_mode)
                .ingest_manual(&roster, selected, &marks)
                .await?;
            print_ingest_summary("Marks saved", &report);
        }
        Commands::RefreshRisk { threshold } => {
            let threshold = threshold.unwrap_or(config.high_risk_threshold);
            let refresh = alerts::refresh_all_risks(&store, threshold).await?;
            println!(
                "Updated {} of {} students, {} at or above {threshold}%.",
                refresh.updated,
                refresh.assessed,
                refresh.alerts.len()
            );
            for alert in &refresh.alerts {
                println!(
                    "- {} ({}, {}) risk {}% {}",
                    alert.name, alert.roll, alert.dept, alert.score, alert.tier
                );
            }
        }
        Commands::Score {
            dept,
            tier,
            search,
            limit,
            json,
        } => {
            let roster = store.list_students().await?;
            let listed = report::filter_students(&roster, dept, tier, search.as_deref());
            let listed: Vec<&Student> = listed.into_iter().take(limit).collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&listed)?);
                return Ok(());
            }
            if listed.is_empty() {
                println!("No students found matching your filters.");
                return Ok(());
            }

            println!("Students by risk:");
            for student in &listed {
                println!(
                    "- {} ({}, {}) GPA {:.1} attendance {}% risk {}% {}",
                    student.name,
                    student.roll,
                    student.dept,
                    student.gpa,
                    student.attendance,
                    student.risk,
                    risk::tier_for_score(student.risk)
                );
            }
            println!("Showing {} of {} students.", listed.len(), roster.len());
        }
        Commands::Report { roll, out } => {
            let roster = store.list_students().await?;
            let student = find_by_roll(&roster, &roll)?;
            let marks = store.list_marks().await?;
            let logged = store.list_interventions(student.id).await?;
            let output = report::build_student_report(student, &marks, &logged);
            std::fs::write(&out, output)?;
            println!("Report written to {}.", out.display());
        }
        Commands::CohortReport { limit, out } => {
            let roster = store.list_students().await?;
            let output = report::build_cohort_report(&roster, limit);
            std::fs::write(&out, output)?;
            println!("Report written to {}.", out.display());
        }
        Commands::LogIntervention {
            roll,
            kind,
            note,
            by,
        } => {
            let roster = store.list_students().await?;
            let student = find_by_roll(&roster, &roll)?;
            interventions::log_intervention(&store, student, kind, &note, by.as_deref()).await?;
            println!("Intervention saved for {}.", student.name);
        }
        Commands::Interventions { roll } => {
            let roster = store.list_students().await?;
            let student = find_by_roll(&roster, &roll)?;
            let logged = store.list_interventions(student.id).await?;
            if logged.is_empty() {
                println!("No interventions logged for {}.", student.roll);
            }
            for intervention in logged {
                println!(
                    "- {} {} by {}: {}",
                    intervention.created_at.format("%Y-%m-%d %H:%M"),
                    intervention.kind.label(),
                    intervention.created_by,
                    intervention.note
                );
            }
        }
    }

    Ok(())
}
