use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

mod averages;
mod config;
mod db;
mod error;
mod goal;
mod models;
mod ranking;
mod recompute;
mod report;
mod store;

use config::{EnrollmentPolicy, WeightConfig};
use models::{checked_goal, MarkCoordinate};

#[derive(Parser)]
#[command(name = "grade-engine")]
#[command(about = "Weighted grade averages and required-mark predictions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Weights document ({ unit: { ECTS, module: { self, type: weight } } })
    #[arg(long, global = true, env = "GRADE_WEIGHTS", default_value = "weights.json")]
    weights: PathBuf,

    /// Email domain students must enroll with
    #[arg(long, global = true, env = "GRADE_EMAIL_DOMAIN")]
    domain: Option<String>,

    /// File listing who may enroll, one address or local part per line
    #[arg(long, global = true, env = "GRADE_ROSTER")]
    roster: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo students and marks
    Seed,
    /// Import marks from a CSV file (email,mark_id,value)
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Enroll a student
    Enroll {
        #[arg(long)]
        email: String,
    },
    /// Remove a student and every mark they filed
    Unenroll {
        #[arg(long)]
        email: String,
    },
    /// Publish a mark students can file
    Publish {
        #[arg(long)]
        unit: String,
        #[arg(long)]
        module: String,
        #[arg(long = "type")]
        mark_type: String,
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        number: u32,
        #[arg(long)]
        name: String,
    },
    /// Withdraw a published mark from every student
    Retract {
        #[arg(long)]
        id: String,
    },
    /// File a mark; omit --value to file an absence
    Submit {
        #[arg(long)]
        email: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        value: Option<f64>,
    },
    /// Set unit goals
    Goals {
        #[arg(long)]
        email: String,
        /// UNIT=GOAL, goal between 10 and 20
        #[arg(long = "set", value_parser = parse_goal)]
        set: Vec<(String, f64)>,
    },
    /// Show or hide the student's name in rankings
    Anonymous {
        #[arg(long)]
        email: String,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Show a student's averages
    Averages {
        #[arg(long)]
        email: String,
    },
    /// Minimum mark needed on the next mark of a type to reach the unit goal
    Predict {
        #[arg(long)]
        email: String,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        module: String,
        #[arg(long = "type")]
        mark_type: String,
        /// Overrides the student's goal for the unit
        #[arg(long)]
        goal: Option<f64>,
    },
    /// Marks a student has filed
    Marks {
        #[arg(long)]
        email: String,
    },
    /// Published marks a student has not filed
    Missing {
        #[arg(long)]
        email: String,
    },
    /// Rank students by general average, unit average or a single mark
    #[command(group(
        ArgGroup::new("scope")
            .args(["unit", "mark"])
            .multiple(false)
    ))]
    Rankings {
        #[arg(long)]
        unit: Option<String>,
        #[arg(long)]
        mark: Option<String>,
        /// Also show where this student stands
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show weight shares of units, a unit's modules or a module's types
    Weights {
        #[arg(long)]
        unit: Option<String>,
        #[arg(long, requires = "unit")]
        module: Option<String>,
        /// Print the whole weights document instead
        #[arg(long, conflicts_with_all = ["unit", "module"])]
        json: bool,
    },
    /// Generate a markdown report for a student
    Report {
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Rebuild every student's averages and the promotion averages
    Recompute {
        /// Only rebuild this student's averages
        #[arg(long)]
        email: Option<String>,
    },
    /// Published marks, enrolled students and the next promotion update
    Stats,
    /// Refresh promotion averages on a fixed interval
    Schedule {
        #[arg(long, default_value_t = 10)]
        interval_minutes: u64,
    },
}

fn parse_goal(raw: &str) -> Result<(String, f64), String> {
    let (unit, goal) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected UNIT=GOAL, got `{raw}`"))?;
    let goal: f64 = goal
        .parse()
        .map_err(|_| format!("`{goal}` is not a number"))?;
    Ok((unit.to_string(), goal))
}

fn print_position(entries: &[models::RankedStudent], student: &models::Student) {
    match ranking::position(entries, student) {
        Some(position) => println!("{} is ranked {position} of {}.", student.email, entries.len()),
        None => println!("{} is not part of this ranking.", student.email),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = WeightConfig::load(&cli.weights)?;
    let policy = EnrollmentPolicy::load(cli.domain.clone(), cli.roster.as_deref())?;

    if let Commands::Weights { unit, module, json } = &cli.command {
        if *json {
            println!("{}", serde_json::to_string_pretty(&config.to_json())?);
            return Ok(());
        }
        for share in config.shares(unit.as_deref(), module.as_deref())? {
            println!(
                "- {}: weight {} ({:.1}%)",
                share.id,
                share.weight,
                share.share * 100.0
            );
        }
        return Ok(());
    }

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = db::PgMarkStore::new(pool.clone());

    match cli.command {
        Commands::Weights { .. } => {}
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool, &config).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &config, &policy, &csv).await?;
            println!("Inserted {inserted} marks from {}.", csv.display());
        }
        Commands::Enroll { email } => {
            let student = db::create_student(&pool, &config, &policy, &email).await?;
            println!("Enrolled {} ({}).", student.email, student.id);
        }
        Commands::Unenroll { email } => {
            if db::delete_student(&pool, &email).await? {
                println!("Removed {email} and every associated mark.");
            } else {
                println!("{email} is not enrolled.");
            }
        }
        Commands::Publish {
            unit,
            module,
            mark_type,
            number,
            name,
        } => {
            let mark_id =
                db::publish_mark(&pool, &config, &unit, &module, &mark_type, number, &name)
                    .await?;
            println!("Published [{mark_id}] {name}.");
        }
        Commands::Retract { id } => {
            let report = recompute::retract_mark(&store, &config, &id).await?;
            println!(
                "Retracted {id}; {} students and the promotion averages recomputed, {} failed.",
                report.updated,
                report.failures.len()
            );
            for (student_id, err) in &report.failures {
                eprintln!("- {student_id}: {err}");
            }
        }
        Commands::Submit { email, id, value } => {
            let student = db::require_student(&pool, &email).await?;
            let outcome = recompute::submit_mark(&store, &config, student.id, &id, value).await?;
            let filed = if outcome.mark.is_absent() {
                "an absence".to_string()
            } else {
                outcome.mark.value.to_string()
            };
            match outcome.replaced {
                Some(previous) if previous.is_absent() => {
                    println!("[{id}] {}: absence replaced by {filed}.", outcome.mark_name)
                }
                Some(previous) => println!(
                    "[{id}] {}: {} replaced by {filed}.",
                    outcome.mark_name, previous.value
                ),
                None => println!("[{id}] {}: filed {filed}.", outcome.mark_name),
            }
            println!(
                "General average: {}",
                outcome
                    .averages
                    .general
                    .map_or_else(|| "n/a".to_string(), |value| format!("{value:.2}"))
            );
        }
        Commands::Goals { email, set } => {
            let goals = db::set_goals(&pool, &config, &email, &set).await?;
            println!("Goals for {email}:");
            for (unit, goal) in goals {
                println!("- {unit}: {goal}");
            }
        }
        Commands::Anonymous { email, enabled } => {
            db::set_anonymous(&pool, &email, enabled).await?;
            println!(
                "{email} is now {} in rankings.",
                if enabled { "hidden" } else { "shown" }
            );
        }
        Commands::Averages { email } => {
            let student = db::require_student(&pool, &email).await?;
            let promotion = db::fetch_promotion_averages(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&student.averages)?);
            if let Some((tree, next_update)) = promotion {
                println!(
                    "Promotion general average: {} (next update {next_update})",
                    tree.general
                        .map_or_else(|| "n/a".to_string(), |value| format!("{value:.2}"))
                );
            }
        }
        Commands::Predict {
            email,
            unit,
            module,
            mark_type,
            goal,
        } => {
            let student = db::require_student(&pool, &email).await?;
            let goal = match goal {
                Some(goal) => checked_goal(goal)?,
                None => student.goal(&unit),
            };
            let coordinate = MarkCoordinate::new(&unit, &module, &mark_type);
            let prediction = goal::predict_required_mark(
                &student.averages,
                &student.marks,
                &config,
                goal,
                &coordinate,
            )?;
            tracing::debug!(value = prediction.value(), "solved required mark");
            println!("[{coordinate}] {}", prediction.describe(goal));
        }
        Commands::Marks { email } => {
            let student = db::require_student(&pool, &email).await?;
            let published = db::fetch_published_marks(&pool).await?;
            let lines = report::filed_marks(&student, &published);
            if lines.is_empty() {
                println!("{email} has not filed any mark yet.");
            } else {
                println!("{} marks filed by {email}:", lines.len());
                for line in lines {
                    println!("- {line}");
                }
            }
        }
        Commands::Missing { email } => {
            let student = db::require_student(&pool, &email).await?;
            let published = db::fetch_published_marks(&pool).await?;
            let missing = ranking::missing_marks(&published, &student);
            if missing.is_empty() {
                println!("Every published mark is filed.");
            } else {
                println!("{} published marks not filed:", missing.len());
                for mark in missing {
                    println!("- {} {}", mark.id, mark.name);
                }
            }
        }
        Commands::Rankings {
            unit,
            mark,
            email,
            limit,
        } => {
            let students = db::fetch_students(&pool).await?;
            let viewer = match email.as_deref() {
                Some(email) => Some(
                    students
                        .iter()
                        .find(|student| student.email == email)
                        .with_context(|| format!("{email} is not enrolled"))?,
                ),
                None => None,
            };

            if let Some(mark_id) = mark {
                let ranking = ranking::mark_ranking(&students, &mark_id);
                if ranking.entries.is_empty() {
                    println!("No graded results for {mark_id}.");
                    return Ok(());
                }
                println!("Ranking for {}:", ranking.mark_id);
                for (index, entry) in ranking.entries.iter().take(limit).enumerate() {
                    println!("{} - {} with {}", index + 1, entry.display_name, entry.value);
                }
                if let Some(viewer) = viewer {
                    print_position(&ranking.entries, viewer);
                }
                if let Some(mean) = ranking.promotion_mean {
                    println!(
                        "Promotion mean: {mean} over {} students",
                        ranking.entries.len()
                    );
                }
                return Ok(());
            }

            let published = db::fetch_published_marks(&pool).await?;
            let entries = match unit.as_deref() {
                Some(unit_id) => ranking::unit_ranking(&students, &published, unit_id),
                None => ranking::general_ranking(&students, &published),
            };
            if entries.is_empty() {
                println!("No student has filed every published mark yet.");
                return Ok(());
            }
            println!(
                "Ranking by {} average:",
                unit.as_deref().unwrap_or("general")
            );
            for (index, entry) in entries.iter().take(limit).enumerate() {
                println!(
                    "{} - {} with {:.2}",
                    index + 1,
                    entry.display_name,
                    entry.value
                );
            }
            if let Some(viewer) = viewer {
                print_position(&entries, viewer);
            }
        }
        Commands::Report { email, out } => {
            let student = db::require_student(&pool, &email).await?;
            let promotion = db::fetch_promotion_averages(&pool).await?;
            let published = db::fetch_published_marks(&pool).await?;
            let report = report::build_report(
                &student,
                &config,
                promotion.as_ref().map(|(tree, _)| tree),
                &published,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Recompute { email: Some(email) } => {
            let student = db::require_student(&pool, &email).await?;
            let tree = recompute::recompute_student(&store, &config, student.id).await?;
            println!(
                "Averages rebuilt for {email}: general {}.",
                tree.general
                    .map_or_else(|| "n/a".to_string(), |value| format!("{value:.2}"))
            );
        }
        Commands::Recompute { email: None } => {
            let report = recompute::recompute_all(&store, &config).await?;
            recompute::recompute_promotion(&store, &config, recompute::PROMOTION_INTERVAL).await?;
            println!(
                "{} students recomputed, {} failed.",
                report.updated,
                report.failures.len()
            );
        }
        Commands::Stats => {
            let (published, students) = db::fetch_counts(&pool).await?;
            let next_update = db::fetch_promotion_averages(&pool)
                .await?
                .map(|(_, next_update)| next_update);
            print!(
                "{}",
                report::stats_summary(
                    published,
                    students,
                    policy.roster.as_ref().map(|roster| roster.len()),
                    next_update
                )
            );
        }
        Commands::Schedule { interval_minutes } => {
            let interval = Duration::from_secs(interval_minutes.max(1) * 60);
            recompute::run_promotion_schedule(&store, &config, interval).await?;
        }
    }

    Ok(())
}
