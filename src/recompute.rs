use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use uuid::Uuid;

use crate::averages::{compute_averages, AverageTree};
use crate::config::WeightConfig;
use crate::models::{Mark, MarkCoordinate};
use crate::store::{FiledMark, MarkStore};

pub const PROMOTION_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default)]
pub struct RecomputeReport {
    pub updated: usize,
    pub failures: Vec<(Uuid, String)>,
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub mark: Mark,
    pub mark_name: String,
    pub replaced: Option<Mark>,
    pub averages: AverageTree,
}

/// Rebuilds one student's tree from their full mark list and saves it.
pub async fn recompute_student(
    store: &dyn MarkStore,
    config: &WeightConfig,
    student_id: Uuid,
) -> anyhow::Result<AverageTree> {
    let marks = store.get_marks(student_id).await?;
    let tree = compute_averages(&marks, config);
    store.save_averages(student_id, &tree).await?;
    tracing::debug!(%student_id, marks = marks.len(), general = ?tree.general, "averages saved");
    Ok(tree)
}

/// Files a mark for a student, replacing any previous one with the same id.
pub async fn submit_mark(
    store: &dyn MarkStore,
    config: &WeightConfig,
    student_id: Uuid,
    mark_id: &str,
    value: Option<f64>,
) -> anyhow::Result<SubmitOutcome> {
    let coordinate = MarkCoordinate::parse(mark_id)?;
    config.resolve_coordinate(&coordinate)?;
    let mark_name = store
        .published_mark(mark_id)
        .await?
        .with_context(|| format!("mark {mark_id} is not published"))?;

    let mark = Mark::submitted(mark_id, value)?;
    let FiledMark { replaced, averages } = store.file_mark(student_id, &mark, config).await?;
    tracing::info!(%student_id, mark_id, absent = mark.is_absent(), replaced = replaced.is_some(), "mark filed");

    Ok(SubmitOutcome {
        mark,
        mark_name,
        replaced,
        averages,
    })
}

/// Recomputes every student independently. One student's failure is
/// recorded and the batch moves on.
pub async fn recompute_all(
    store: &dyn MarkStore,
    config: &WeightConfig,
) -> anyhow::Result<RecomputeReport> {
    let students = store.get_all_students().await?;
    let mut report = RecomputeReport::default();

    for student in students {
        let tree = compute_averages(&student.marks, config);
        match store.save_averages(student.id, &tree).await {
            Ok(()) => report.updated += 1,
            Err(err) => {
                tracing::warn!(student_id = %student.id, error = %err, "failed to recompute averages");
                report.failures.push((student.id, format!("{err:#}")));
            }
        }
    }

    tracing::info!(
        updated = report.updated,
        failed = report.failures.len(),
        "population recomputed"
    );
    Ok(report)
}

/// Withdraws a published mark from everyone, then recomputes every student
/// and the population tree.
pub async fn retract_mark(
    store: &dyn MarkStore,
    config: &WeightConfig,
    mark_id: &str,
) -> anyhow::Result<RecomputeReport> {
    if store.published_mark(mark_id).await?.is_none() {
        anyhow::bail!("no published mark matches {mark_id}");
    }

    let affected = store.remove_mark_everywhere(mark_id).await?;
    tracing::info!(mark_id, affected, "mark retracted");
    let report = recompute_all(store, config).await?;
    recompute_promotion(store, config, PROMOTION_INTERVAL).await?;
    Ok(report)
}

/// Rebuilds the population tree from the union of every student's marks.
pub async fn recompute_promotion(
    store: &dyn MarkStore,
    config: &WeightConfig,
    interval: Duration,
) -> anyhow::Result<AverageTree> {
    let marks: Vec<Mark> = store
        .get_all_students()
        .await?
        .into_iter()
        .flat_map(|student| student.marks)
        .collect();

    let tree = compute_averages(&marks, config);
    let next_update = Utc::now() + chrono::Duration::from_std(interval)?;
    store.save_promotion_averages(&tree, next_update).await?;
    tracing::info!(marks = marks.len(), general = ?tree.general, %next_update, "promotion averages updated");
    Ok(tree)
}

/// Refreshes the population tree on a fixed interval until Ctrl-C.
pub async fn run_promotion_schedule(
    store: &dyn MarkStore,
    config: &WeightConfig,
    interval: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = recompute_promotion(store, config, interval).await {
                    tracing::warn!(error = %err, "promotion update failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("schedule stopped");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::scenario_config;
    use crate::store::memory::MemoryStore;

    fn student(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[tokio::test]
    async fn submitting_replaces_and_recomputes() {
        let config = scenario_config();
        let store = MemoryStore::default()
            .with_student(student(1), vec![Mark::new("U1_M1_A_1", 14.0)])
            .with_published("U1_M1_A_1", "Quiz 1")
            .with_published("U1_M1_B_1", "Exam");

        let outcome = submit_mark(&store, &config, student(1), "U1_M1_B_1", Some(16.0))
            .await
            .unwrap();
        assert_eq!(outcome.mark_name, "Exam");
        assert!(outcome.replaced.is_none());
        assert_eq!(outcome.averages.general, Some(15.0));

        let outcome = submit_mark(&store, &config, student(1), "U1_M1_A_1", Some(10.0))
            .await
            .unwrap();
        assert_eq!(outcome.replaced, Some(Mark::new("U1_M1_A_1", 14.0)));
        assert_eq!(store.get_marks(student(1)).await.unwrap().len(), 2);
        assert_eq!(store.averages_of(student(1)).unwrap().general, Some(13.0));
    }

    #[tokio::test]
    async fn single_student_rebuild_saves_the_tree() {
        let config = scenario_config();
        let store = MemoryStore::default().with_student(
            student(1),
            vec![Mark::new("U1_M1_A_1", 14.0), Mark::new("U1_M2_C_1", 11.0)],
        );

        let tree = recompute_student(&store, &config, student(1)).await.unwrap();
        // (14 * 2 + 11) / 3
        assert_eq!(tree.general, Some(13.0));
        assert_eq!(store.averages_of(student(1)), Some(tree));
    }

    #[tokio::test]
    async fn absences_are_kept_but_not_averaged() {
        let config = scenario_config();
        let store = MemoryStore::default()
            .with_student(student(1), vec![Mark::new("U1_M1_A_1", 14.0)])
            .with_published("U1_M2_C_1", "Lab");

        let outcome = submit_mark(&store, &config, student(1), "U1_M2_C_1", None)
            .await
            .unwrap();
        assert!(outcome.mark.is_absent());
        assert_eq!(outcome.averages.general, Some(14.0));
        assert_eq!(store.get_marks(student(1)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refuses_unpublished_or_invalid_marks() {
        let config = scenario_config();
        let store = MemoryStore::default().with_student(student(1), vec![]);

        assert!(submit_mark(&store, &config, student(1), "U1_M1_A_1", Some(12.0))
            .await
            .is_err());
        assert!(submit_mark(&store, &config, student(1), "U1_M1_C_1", Some(12.0))
            .await
            .is_err());
        assert!(store.get_marks(student(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_recompute_survives_a_failing_student() {
        let config = scenario_config();
        let store = MemoryStore::default()
            .with_student(student(1), vec![Mark::new("U1_M1_A_1", 12.0)])
            .with_student(student(2), vec![Mark::new("U1_M1_A_1", 8.0)])
            .with_student(student(3), vec![Mark::new("U1_M2_C_1", 18.0)]);
        store.broken.lock().unwrap().insert(student(2));

        let report = recompute_all(&store, &config).await.unwrap();
        assert_eq!(report.updated, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, student(2));
        assert_eq!(store.averages_of(student(3)).unwrap().general, Some(18.0));
        assert!(store.averages_of(student(2)).is_none());
    }

    #[tokio::test]
    async fn retraction_pulls_the_mark_from_everyone() {
        let config = scenario_config();
        let store = MemoryStore::default()
            .with_student(
                student(1),
                vec![Mark::new("U1_M1_A_1", 12.0), Mark::new("U1_M2_C_1", 20.0)],
            )
            .with_student(student(2), vec![Mark::new("U1_M2_C_1", 4.0)])
            .with_published("U1_M2_C_1", "Lab");

        let report = retract_mark(&store, &config, "U1_M2_C_1").await.unwrap();
        assert_eq!(report.updated, 2);
        assert_eq!(store.averages_of(student(1)).unwrap().general, Some(12.0));
        assert_eq!(store.averages_of(student(2)).unwrap().general, None);
        assert!(store.published_mark("U1_M2_C_1").await.unwrap().is_none());

        assert!(retract_mark(&store, &config, "U1_M2_C_1").await.is_err());
    }

    #[tokio::test]
    async fn retraction_refreshes_the_promotion_tree() {
        let config = scenario_config();
        let store = MemoryStore::default()
            .with_student(
                student(1),
                vec![Mark::new("U1_M1_A_1", 12.0), Mark::new("U1_M2_C_1", 20.0)],
            )
            .with_published("U1_M2_C_1", "Lab");

        let before = recompute_promotion(&store, &config, PROMOTION_INTERVAL)
            .await
            .unwrap();
        assert_eq!(before.module_average("U1", "M2"), Some(20.0));

        retract_mark(&store, &config, "U1_M2_C_1").await.unwrap();
        let (saved, _) = store.promotion.lock().unwrap().clone().unwrap();
        assert_eq!(saved.module_average("U1", "M2"), None);
        assert_eq!(saved.general, Some(12.0));
    }

    #[tokio::test]
    async fn failed_save_leaves_marks_untouched() {
        let config = scenario_config();
        let store = MemoryStore::default()
            .with_student(student(1), vec![Mark::new("U1_M1_A_1", 12.0)])
            .with_published("U1_M1_A_1", "Quiz 1")
            .with_published("U1_M1_B_1", "Exam");
        store.broken.lock().unwrap().insert(student(1));

        assert!(submit_mark(&store, &config, student(1), "U1_M1_B_1", Some(16.0))
            .await
            .is_err());
        assert!(submit_mark(&store, &config, student(1), "U1_M1_A_1", Some(18.0))
            .await
            .is_err());
        assert_eq!(
            store.get_marks(student(1)).await.unwrap(),
            vec![Mark::new("U1_M1_A_1", 12.0)]
        );
        assert!(store.averages_of(student(1)).is_none());
    }

    #[tokio::test]
    async fn promotion_tree_uses_every_mark() {
        let config = scenario_config();
        let store = MemoryStore::default()
            .with_student(student(1), vec![Mark::new("U1_M1_A_1", 12.0)])
            .with_student(student(2), vec![Mark::new("U1_M1_A_1", 16.0)]);

        let before = Utc::now();
        let tree = recompute_promotion(&store, &config, PROMOTION_INTERVAL)
            .await
            .unwrap();
        assert_eq!(tree.type_average("U1", "M1", "A"), Some(14.0));

        let (saved, next_update) = store.promotion.lock().unwrap().clone().unwrap();
        assert_eq!(saved, tree);
        assert!(next_update >= before + chrono::Duration::minutes(10));
    }
}
