use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::averages::AverageTree;
use crate::config::WeightConfig;
use crate::goal::{predict_required_mark, Prediction};
use crate::models::{MarkCoordinate, PublishedMark, Student};
use crate::ranking;

fn fmt_average(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |value| format!("{value:.2}"))
}

fn with_promotion(value: Option<f64>, promotion: Option<f64>) -> String {
    match promotion {
        Some(promotion) => format!("{} (promotion {promotion:.2})", fmt_average(value)),
        None => fmt_average(value),
    }
}

/// One required-mark line per type the student has not graded yet.
pub fn predictions(student: &Student, config: &WeightConfig) -> Vec<(MarkCoordinate, f64, Prediction)> {
    let mut lines = Vec::new();

    for unit in &config.units {
        let goal = student.goal(&unit.id);
        for module in &unit.modules {
            for mark_type in &module.types {
                if student
                    .averages
                    .type_average(&unit.id, &module.id, &mark_type.id)
                    .is_some()
                {
                    continue;
                }

                let coordinate = MarkCoordinate::new(&unit.id, &module.id, &mark_type.id);
                if let Ok(prediction) = predict_required_mark(
                    &student.averages,
                    &student.marks,
                    config,
                    goal,
                    &coordinate,
                ) {
                    lines.push((coordinate, goal, prediction));
                }
            }
        }
    }

    lines
}

/// Filed marks in filing order, named after their published title.
pub fn filed_marks(student: &Student, published: &[PublishedMark]) -> Vec<String> {
    student
        .marks
        .iter()
        .map(|mark| {
            let name = published
                .iter()
                .find(|candidate| candidate.id == mark.id)
                .map_or("(no longer published)", |candidate| candidate.name.as_str());
            if mark.is_absent() {
                format!("`{}` {name}: absent", mark.id)
            } else {
                format!("`{}` {name}: {}", mark.id, mark.value)
            }
        })
        .collect()
}

pub fn stats_summary(
    published: i64,
    students: i64,
    roster: Option<usize>,
    next_update: Option<DateTime<Utc>>,
) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "Published marks: {published}");
    match roster {
        Some(roster) => {
            let _ = writeln!(output, "Enrolled students: {students}/{roster}");
        }
        None => {
            let _ = writeln!(output, "Enrolled students: {students}");
        }
    }
    match next_update {
        Some(next_update) => {
            let _ = writeln!(
                output,
                "Next promotion update: {}",
                next_update.format("%Y-%m-%d %H:%M UTC")
            );
        }
        None => {
            let _ = writeln!(output, "Promotion averages have never been computed.");
        }
    }
    output
}

pub fn build_report(
    student: &Student,
    config: &WeightConfig,
    promotion: Option<&AverageTree>,
    published: &[PublishedMark],
) -> String {
    let mut output = String::new();
    let averages = &student.averages;

    let _ = writeln!(output, "# Grade Report");
    let _ = writeln!(
        output,
        "Generated for {} ({})",
        ranking::name_from_email(&student.email),
        student.email
    );
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "General average: {}",
        with_promotion(averages.general, promotion.and_then(|tree| tree.general))
    );

    let missing = ranking::missing_marks(published, student);
    if !missing.is_empty() {
        let _ = writeln!(
            output,
            "Missing {} of {} published marks:",
            missing.len(),
            published.len()
        );
        for mark in missing.iter().take(10) {
            let _ = writeln!(output, "- `{}` {}", mark.id, mark.name);
        }
        if missing.len() > 10 {
            let _ = writeln!(output, "- and {} more", missing.len() - 10);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Units");

    for unit in &config.units {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "### {} ({} ECTS): {} goal {}",
            unit.id,
            unit.ects,
            with_promotion(
                averages.unit_average(&unit.id),
                promotion.and_then(|tree| tree.unit_average(&unit.id))
            ),
            student.goal(&unit.id)
        );

        for module in &unit.modules {
            let _ = writeln!(
                output,
                "- {} (weight {}): {}",
                module.id,
                module.weight,
                with_promotion(
                    averages.module_average(&unit.id, &module.id),
                    promotion.and_then(|tree| tree.module_average(&unit.id, &module.id))
                )
            );
            for mark_type in &module.types {
                let _ = writeln!(
                    output,
                    "  - {} (weight {}): {}",
                    mark_type.id,
                    mark_type.weight,
                    fmt_average(averages.type_average(&unit.id, &module.id, &mark_type.id))
                );
            }
        }
    }

    let lines = predictions(student, config);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Required Marks");

    if lines.is_empty() {
        let _ = writeln!(output, "Every type already has a graded mark.");
    } else {
        for (coordinate, goal, prediction) in lines {
            let _ = writeln!(output, "- `{}`: {}", coordinate, prediction.describe(goal));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::averages::compute_averages;
    use crate::config::tests::scenario_config;
    use crate::models::Mark;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn sample_student() -> Student {
        let config = scenario_config();
        let marks = vec![Mark::new("U1_M1_A_1", 14.0), Mark::new("U1_M1_B_1", 16.0)];
        Student {
            id: Uuid::from_u128(1),
            email: "avery.lee@etu.univ-demo.fr".to_string(),
            anonymous: false,
            goals: [("U1".to_string(), 16.0)].into_iter().collect(),
            averages: compute_averages(&marks, &config),
            marks,
        }
    }

    #[test]
    fn predicts_only_ungraded_types() {
        let lines = predictions(&sample_student(), &scenario_config());
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0.to_string(), "U1_M2_C");
        assert_eq!(lines[0].2, Prediction::Required(18.0));
    }

    #[test]
    fn report_lists_averages_missing_marks_and_predictions() {
        let config = scenario_config();
        let student = sample_student();
        let promotion = compute_averages(&[Mark::new("U1_M1_A_1", 10.0)], &config);
        let published = vec![
            PublishedMark {
                id: "U1_M1_A_1".to_string(),
                name: "Quiz".to_string(),
            },
            PublishedMark {
                id: "U1_M2_C_1".to_string(),
                name: "Lab".to_string(),
            },
        ];

        let report = build_report(&student, &config, Some(&promotion), &published);
        assert!(report.contains("Generated for Avery LEE"));
        assert!(report.contains("General average: 15.00 (promotion 10.00)"));
        assert!(report.contains("Missing 1 of 2 published marks:"));
        assert!(report.contains("- `U1_M2_C_1` Lab"));
        assert!(report.contains("- M2 (weight 1): n/a"));
        assert!(report.contains("You need at least 18 on this mark to reach your goal of 16."));
    }

    #[test]
    fn filed_marks_show_names_and_absences() {
        let mut student = sample_student();
        student.marks.push(Mark::absent("U1_M2_C_1"));
        let published = vec![
            PublishedMark {
                id: "U1_M1_A_1".to_string(),
                name: "Quiz".to_string(),
            },
            PublishedMark {
                id: "U1_M2_C_1".to_string(),
                name: "Lab".to_string(),
            },
        ];

        assert_eq!(
            filed_marks(&student, &published),
            vec![
                "`U1_M1_A_1` Quiz: 14".to_string(),
                "`U1_M1_B_1` (no longer published): 16".to_string(),
                "`U1_M2_C_1` Lab: absent".to_string(),
            ]
        );
    }

    #[test]
    fn stats_summary_counts_against_the_roster() {
        let next_update = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
        let summary = stats_summary(12, 40, Some(45), Some(next_update));
        assert!(summary.contains("Published marks: 12"));
        assert!(summary.contains("Enrolled students: 40/45"));
        assert!(summary.contains("Next promotion update: 2026-03-02 14:30 UTC"));

        let summary = stats_summary(0, 3, None, None);
        assert!(summary.contains("Enrolled students: 3\n"));
        assert!(summary.contains("never been computed"));
    }
}
