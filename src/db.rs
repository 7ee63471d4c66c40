use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::averages::{compute_averages, AverageTree};
use crate::config::{EnrollmentPolicy, WeightConfig};
use crate::error::GradeError;
use crate::models::{
    checked_goal, Mark, MarkCoordinate, PublishedMark, Student, StudentMarks, DEFAULT_GOAL,
};
use crate::recompute;
use crate::store::{FiledMark, MarkStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed mark store.
#[derive(Clone)]
pub struct PgMarkStore {
    pool: PgPool,
}

impl PgMarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarkStore for PgMarkStore {
    async fn get_marks(&self, student_id: Uuid) -> anyhow::Result<Vec<Mark>> {
        let rows = sqlx::query(
            "SELECT mark_id, value FROM grades.marks WHERE student_id = $1 ORDER BY filed_at, mark_id",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Mark::new(row.get::<String, _>("mark_id"), row.get("value")))
            .collect())
    }

    async fn get_all_students(&self) -> anyhow::Result<Vec<StudentMarks>> {
        let ids: Vec<Uuid> = sqlx::query("SELECT id FROM grades.students ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get("id"))
            .collect();
        let mut marks = fetch_marks_by_student(&self.pool).await?;

        Ok(ids
            .into_iter()
            .map(|id| StudentMarks {
                id,
                marks: marks.remove(&id).unwrap_or_default(),
            })
            .collect())
    }

    async fn save_averages(&self, student_id: Uuid, tree: &AverageTree) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE grades.students SET averages = $2 WHERE id = $1")
            .bind(student_id)
            .bind(Json(tree))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("student {student_id} does not exist");
        }
        Ok(())
    }

    async fn save_promotion_averages(
        &self,
        tree: &AverageTree,
        next_update: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO grades.promotion (id, averages, next_update)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE
            SET averages = EXCLUDED.averages, next_update = EXCLUDED.next_update
            "#,
        )
        .bind(Json(tree))
        .bind(next_update)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn file_mark(
        &self,
        student_id: Uuid,
        mark: &Mark,
        config: &WeightConfig,
    ) -> anyhow::Result<FiledMark> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT id FROM grades.students WHERE id = $1 FOR UPDATE")
            .bind(student_id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("student {student_id} does not exist"))?;

        let replaced = upsert_mark(&mut *tx, student_id, mark).await?;
        let averages = rebuild_averages(&mut *tx, config, student_id).await?;

        tx.commit().await?;
        Ok(FiledMark { replaced, averages })
    }

    async fn published_mark(&self, mark_id: &str) -> anyhow::Result<Option<String>> {
        Ok(
            sqlx::query("SELECT name FROM grades.published_marks WHERE id = $1")
                .bind(mark_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.get("name")),
        )
    }

    async fn remove_mark_everywhere(&self, mark_id: &str) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let pulled = sqlx::query("DELETE FROM grades.marks WHERE mark_id = $1")
            .bind(mark_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM grades.published_marks WHERE id = $1")
            .bind(mark_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(pulled)
    }
}

/// Files a mark inside an open transaction. Returns the mark it replaced.
async fn upsert_mark(
    conn: &mut PgConnection,
    student_id: Uuid,
    mark: &Mark,
) -> anyhow::Result<Option<Mark>> {
    let previous: Option<f64> = sqlx::query(
        "SELECT value FROM grades.marks WHERE student_id = $1 AND mark_id = $2 FOR UPDATE",
    )
    .bind(student_id)
    .bind(&mark.id)
    .fetch_optional(&mut *conn)
    .await?
    .map(|row| row.get("value"));

    sqlx::query(
        r#"
        INSERT INTO grades.marks (student_id, mark_id, value)
        VALUES ($1, $2, $3)
        ON CONFLICT (student_id, mark_id) DO UPDATE
        SET value = EXCLUDED.value, filed_at = NOW()
        "#,
    )
    .bind(student_id)
    .bind(&mark.id)
    .bind(mark.value)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to file {} for {student_id}", mark.id))?;

    Ok(previous.map(|value| Mark::new(mark.id.clone(), value)))
}

/// Rebuilds a student's tree from the marks visible to `conn` and stores it.
async fn rebuild_averages(
    conn: &mut PgConnection,
    config: &WeightConfig,
    student_id: Uuid,
) -> anyhow::Result<AverageTree> {
    let marks: Vec<Mark> = sqlx::query(
        "SELECT mark_id, value FROM grades.marks WHERE student_id = $1 ORDER BY filed_at, mark_id",
    )
    .bind(student_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|row| Mark::new(row.get::<String, _>("mark_id"), row.get("value")))
    .collect();

    let averages = compute_averages(&marks, config);
    let result = sqlx::query("UPDATE grades.students SET averages = $2 WHERE id = $1")
        .bind(student_id)
        .bind(Json(&averages))
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        anyhow::bail!("student {student_id} does not exist");
    }
    tracing::debug!(%student_id, marks = marks.len(), general = ?averages.general, "averages saved");
    Ok(averages)
}

async fn fetch_marks_by_student(pool: &PgPool) -> anyhow::Result<HashMap<Uuid, Vec<Mark>>> {
    let rows = sqlx::query(
        "SELECT student_id, mark_id, value FROM grades.marks ORDER BY filed_at, mark_id",
    )
    .fetch_all(pool)
    .await?;

    let mut marks: HashMap<Uuid, Vec<Mark>> = HashMap::new();
    for row in rows {
        marks
            .entry(row.get("student_id"))
            .or_default()
            .push(Mark::new(row.get::<String, _>("mark_id"), row.get("value")));
    }
    Ok(marks)
}

fn student_from_row(row: &sqlx::postgres::PgRow, marks: Vec<Mark>) -> Student {
    let goals: Json<BTreeMap<String, f64>> = row.get("goals");
    let averages: Json<AverageTree> = row.get("averages");
    Student {
        id: row.get("id"),
        email: row.get("email"),
        anonymous: row.get("anonymous"),
        goals: goals.0,
        marks,
        averages: averages.0,
    }
}

pub async fn fetch_student(pool: &PgPool, email: &str) -> anyhow::Result<Option<Student>> {
    let row = sqlx::query(
        "SELECT id, email, anonymous, goals, averages FROM grades.students WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let id: Uuid = row.get("id");
    let marks = PgMarkStore::new(pool.clone()).get_marks(id).await?;
    Ok(Some(student_from_row(&row, marks)))
}

pub async fn require_student(pool: &PgPool, email: &str) -> anyhow::Result<Student> {
    fetch_student(pool, email)
        .await?
        .with_context(|| format!("{email} is not enrolled"))
}

pub async fn fetch_students(pool: &PgPool) -> anyhow::Result<Vec<Student>> {
    let rows = sqlx::query(
        "SELECT id, email, anonymous, goals, averages FROM grades.students ORDER BY created_at",
    )
    .fetch_all(pool)
    .await?;
    let mut marks = fetch_marks_by_student(pool).await?;

    Ok(rows
        .iter()
        .map(|row| {
            let id: Uuid = row.get("id");
            student_from_row(row, marks.remove(&id).unwrap_or_default())
        })
        .collect())
}

/// Enrolls a student with no marks, empty averages and the default goal in every unit.
pub async fn create_student(
    pool: &PgPool,
    config: &WeightConfig,
    policy: &EnrollmentPolicy,
    email: &str,
) -> anyhow::Result<Student> {
    policy.check(email)?;
    let mut conn = pool.acquire().await?;
    insert_student(&mut *conn, config, email).await
}

async fn insert_student(
    conn: &mut PgConnection,
    config: &WeightConfig,
    email: &str,
) -> anyhow::Result<Student> {
    let goals: BTreeMap<String, f64> = config
        .units
        .iter()
        .map(|unit| (unit.id.clone(), DEFAULT_GOAL))
        .collect();
    let averages = compute_averages(&[], config);

    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO grades.students (id, email, goals, averages)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(Json(&goals))
    .bind(Json(&averages))
    .fetch_optional(&mut *conn)
    .await?
    .map(|row| row.get("id"))
    .with_context(|| format!("{email} is already enrolled"))?;

    tracing::info!(%id, email, "student enrolled");
    Ok(Student {
        id,
        email: email.to_string(),
        anonymous: false,
        goals,
        marks: Vec::new(),
        averages,
    })
}

async fn student_id_by_email(conn: &mut PgConnection, email: &str) -> anyhow::Result<Option<Uuid>> {
    Ok(sqlx::query("SELECT id FROM grades.students WHERE email = $1")
        .bind(email)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| row.get("id")))
}

/// Removes a student along with their marks and averages.
pub async fn delete_student(pool: &PgPool, email: &str) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM grades.students WHERE email = $1")
        .bind(email)
        .execute(pool)
        .await?;
    let deleted = result.rows_affected() > 0;
    if deleted {
        tracing::info!(email, "student removed");
    }
    Ok(deleted)
}

pub async fn set_goals(
    pool: &PgPool,
    config: &WeightConfig,
    email: &str,
    updates: &[(String, f64)],
) -> anyhow::Result<BTreeMap<String, f64>> {
    let student = require_student(pool, email).await?;
    let mut goals = student.goals;

    for (unit_id, goal) in updates {
        if config.unit(unit_id).is_none() {
            return Err(GradeError::UnknownUnit(unit_id.clone()).into());
        }
        goals.insert(unit_id.clone(), checked_goal(*goal)?);
    }

    sqlx::query("UPDATE grades.students SET goals = $2 WHERE id = $1")
        .bind(student.id)
        .bind(Json(&goals))
        .execute(pool)
        .await?;
    Ok(goals)
}

pub async fn set_anonymous(pool: &PgPool, email: &str, anonymous: bool) -> anyhow::Result<()> {
    let result = sqlx::query("UPDATE grades.students SET anonymous = $2 WHERE email = $1")
        .bind(email)
        .bind(anonymous)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        anyhow::bail!("{email} is not enrolled");
    }
    Ok(())
}

/// Publishes a mark so students can file it. Already published ids are refused.
pub async fn publish_mark(
    pool: &PgPool,
    config: &WeightConfig,
    unit_id: &str,
    module_id: &str,
    type_id: &str,
    number: u32,
    name: &str,
) -> anyhow::Result<String> {
    let mark_id = config.mark_id(unit_id, module_id, type_id, Some(number))?;

    let result = sqlx::query(
        "INSERT INTO grades.published_marks (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
    )
    .bind(&mark_id)
    .bind(name)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        anyhow::bail!("mark {mark_id} is already published");
    }
    tracing::info!(mark_id, name, "mark published");
    Ok(mark_id)
}

pub async fn fetch_published_marks(pool: &PgPool) -> anyhow::Result<Vec<PublishedMark>> {
    let rows = sqlx::query("SELECT id, name FROM grades.published_marks ORDER BY published_at, id")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| PublishedMark {
            id: row.get("id"),
            name: row.get("name"),
        })
        .collect())
}

pub async fn fetch_promotion_averages(
    pool: &PgPool,
) -> anyhow::Result<Option<(AverageTree, DateTime<Utc>)>> {
    let row = sqlx::query("SELECT averages, next_update FROM grades.promotion WHERE id = 1")
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| {
        let averages: Json<AverageTree> = row.get("averages");
        (averages.0, row.get("next_update"))
    }))
}

/// Number of published marks and enrolled students.
pub async fn fetch_counts(pool: &PgPool) -> anyhow::Result<(i64, i64)> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM grades.published_marks) AS published,
            (SELECT COUNT(*) FROM grades.students) AS students
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok((row.get("published"), row.get("students")))
}

/// Enrolls demo students, publishes one mark per configured type and files
/// deterministic results for each student.
pub async fn seed(pool: &PgPool, config: &WeightConfig) -> anyhow::Result<()> {
    let emails = [
        "avery.lee@etu.univ-demo.fr",
        "jules.moreno@etu.univ-demo.fr",
        "kiara.patel@etu.univ-demo.fr",
    ];

    let mut tx = pool.begin().await?;
    let mut mark_ids = Vec::new();
    for unit in &config.units {
        for module in &unit.modules {
            for mark_type in &module.types {
                let mark_id = config.mark_id(&unit.id, &module.id, &mark_type.id, Some(1))?;
                sqlx::query(
                    "INSERT INTO grades.published_marks (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
                )
                .bind(&mark_id)
                .bind(format!("{} {} n°1", module.id, mark_type.id))
                .execute(&mut *tx)
                .await?;
                mark_ids.push(mark_id);
            }
        }
    }

    for (student_index, email) in emails.iter().enumerate() {
        let student_id = match student_id_by_email(&mut *tx, email).await? {
            Some(id) => id,
            None => insert_student(&mut *tx, config, email).await?.id,
        };

        for (mark_index, mark_id) in mark_ids.iter().enumerate() {
            let value = match (student_index * 7 + mark_index * 3) % 11 {
                0 => None,
                step => Some(8.0 + step as f64 * 1.2),
            };
            upsert_mark(&mut *tx, student_id, &Mark::submitted(mark_id.as_str(), value)?).await?;
        }
        rebuild_averages(&mut *tx, config, student_id).await?;
    }
    tx.commit().await?;

    let store = PgMarkStore::new(pool.clone());
    recompute::recompute_promotion(&store, config, recompute::PROMOTION_INTERVAL).await?;
    Ok(())
}

/// A CSV row that passed every check and is ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub email: String,
    pub mark: Mark,
}

/// Reads and checks every `email,mark_id,value` row before anything is
/// written. An empty value files an absence.
pub fn parse_import<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
    config: &WeightConfig,
    policy: &EnrollmentPolicy,
    published: &BTreeSet<String>,
) -> anyhow::Result<Vec<ImportRow>> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        email: String,
        mark_id: String,
        value: Option<f64>,
    }

    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = line + 2;
        let row = result.with_context(|| format!("invalid row {line}"))?;

        policy
            .check(&row.email)
            .with_context(|| format!("row {line}"))?;
        let coordinate =
            MarkCoordinate::parse(&row.mark_id).with_context(|| format!("row {line}"))?;
        config
            .resolve_coordinate(&coordinate)
            .with_context(|| format!("row {line}"))?;
        if !published.contains(&row.mark_id) {
            anyhow::bail!("row {line}: mark {} is not published", row.mark_id);
        }
        let mark = Mark::submitted(row.mark_id.as_str(), row.value)
            .with_context(|| format!("row {line}"))?;

        rows.push(ImportRow {
            email: row.email,
            mark,
        });
    }
    Ok(rows)
}

/// Imports a CSV file in a single transaction. Unknown emails are enrolled
/// on first sight; a bad row aborts the import before any write.
pub async fn import_csv(
    pool: &PgPool,
    config: &WeightConfig,
    policy: &EnrollmentPolicy,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    let published: BTreeSet<String> = fetch_published_marks(pool)
        .await?
        .into_iter()
        .map(|mark| mark.id)
        .collect();
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let rows = parse_import(&mut reader, config, policy, &published)?;

    let mut tx = pool.begin().await?;
    let mut known: HashMap<String, Uuid> = HashMap::new();
    let mut touched = BTreeSet::new();
    let mut inserted = 0usize;

    for row in &rows {
        let student_id = match known.get(&row.email) {
            Some(id) => *id,
            None => {
                let id = match student_id_by_email(&mut *tx, &row.email).await? {
                    Some(id) => id,
                    None => insert_student(&mut *tx, config, &row.email).await?.id,
                };
                known.insert(row.email.clone(), id);
                id
            }
        };

        if upsert_mark(&mut *tx, student_id, &row.mark).await?.is_none() {
            inserted += 1;
        }
        touched.insert(student_id);
    }

    for student_id in &touched {
        rebuild_averages(&mut *tx, config, *student_id).await?;
    }
    tx.commit().await?;
    tracing::info!(rows = rows.len(), inserted, students = touched.len(), "marks imported");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::scenario_config;

    fn published(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn reader(raw: &str) -> csv::Reader<&[u8]> {
        csv::Reader::from_reader(raw.as_bytes())
    }

    #[test]
    fn parses_valid_rows_and_absences() {
        let raw = "email,mark_id,value\n\
                   avery.lee@etu.univ-demo.fr,U1_M1_A_1,12.346\n\
                   avery.lee@etu.univ-demo.fr,U1_M2_C_1,\n";
        let rows = parse_import(
            &mut reader(raw),
            &scenario_config(),
            &EnrollmentPolicy::default(),
            &published(&["U1_M1_A_1", "U1_M2_C_1"]),
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].mark, Mark::new("U1_M1_A_1", 12.35));
        assert!(rows[1].mark.is_absent());
    }

    #[test]
    fn one_bad_row_rejects_the_whole_file() {
        let config = scenario_config();
        let policy = EnrollmentPolicy {
            domain: Some("etu.univ-demo.fr".to_string()),
            roster: None,
        };
        let known = published(&["U1_M1_A_1"]);

        let cases = [
            ("avery.lee@etu.univ-demo.fr,U1_M1_B_1,12", "not published"),
            ("avery.lee@etu.univ-demo.fr,U1_M9_A_1,12", "invalid combination"),
            ("avery.lee@etu.univ-demo.fr,U1_M1_A_1,21", "outside [0, 20]"),
            ("avery.lee@gmail.com,U1_M1_A_1,12", "not a etu.univ-demo.fr address"),
        ];
        for (bad, expected) in cases {
            let raw = format!(
                "email,mark_id,value\njules.moreno@etu.univ-demo.fr,U1_M1_A_1,14\n{bad}\n"
            );
            let err = parse_import(&mut reader(&raw), &config, &policy, &known).unwrap_err();
            let message = format!("{err:#}");
            assert!(message.contains("row 3"), "{message}");
            assert!(message.contains(expected), "{message}");
        }
    }
}
