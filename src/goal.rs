use crate::averages::AverageTree;
use crate::config::WeightConfig;
use crate::error::GradeError;
use crate::models::{round2, Mark, MarkCoordinate, MAX_MARK, MIN_MARK};

/// Outcome of a required-mark prediction. Every variant keeps the solved value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    /// The goal holds even with a 0.
    Guaranteed(f64),
    /// The minimum mark needed.
    Required(f64),
    /// The goal is out of reach even with a 20.
    Unreachable(f64),
}

impl Prediction {
    pub fn from_value(value: f64) -> Self {
        if value < MIN_MARK {
            Prediction::Guaranteed(value)
        } else if value > MAX_MARK {
            Prediction::Unreachable(value)
        } else {
            Prediction::Required(value)
        }
    }

    pub fn value(&self) -> f64 {
        match *self {
            Prediction::Guaranteed(value)
            | Prediction::Required(value)
            | Prediction::Unreachable(value) => value,
        }
    }

    pub fn describe(&self, goal: f64) -> String {
        match self {
            Prediction::Guaranteed(_) => {
                format!("Goal of {goal} is guaranteed even with a 0 on this mark.")
            }
            Prediction::Unreachable(_) => {
                format!("Goal of {goal} is unreachable even with a 20 on this mark.")
            }
            Prediction::Required(value) => {
                format!("You need at least {value} on this mark to reach your goal of {goal}.")
            }
        }
    }
}

/// Solves `(known_sum + x * weight) / (known_weights + weight) = goal` for `x`.
fn invert_weighted_mean(goal: f64, known_sum: f64, known_weights: f64, weight: f64) -> f64 {
    (goal * (known_weights + weight) - known_sum) / weight
}

/// Minimum value of one more mark filed under `coordinate` for the unit
/// average to reach `goal`.
pub fn predict_required_mark(
    tree: &AverageTree,
    marks: &[Mark],
    config: &WeightConfig,
    goal: f64,
    coordinate: &MarkCoordinate,
) -> Result<Prediction, GradeError> {
    let target = config.resolve_coordinate(coordinate)?;

    let (module_sum, module_weights) = target
        .unit
        .modules
        .iter()
        .filter(|module| module.id != target.module.id)
        .filter_map(|module| {
            tree.module_average(&target.unit.id, &module.id)
                .map(|average| (average, module.weight))
        })
        .fold((0.0, 0.0), |(sum, weights), (average, weight)| {
            (sum + average * weight, weights + weight)
        });
    let module_goal =
        invert_weighted_mean(goal, module_sum, module_weights, target.module.weight);

    let (type_sum, type_weights) = target
        .module
        .types
        .iter()
        .filter(|mark_type| mark_type.id != target.mark_type.id)
        .filter_map(|mark_type| {
            tree.type_average(&target.unit.id, &target.module.id, &mark_type.id)
                .map(|average| (average, mark_type.weight))
        })
        .fold((0.0, 0.0), |(sum, weights), (average, weight)| {
            (sum + average * weight, weights + weight)
        });
    let type_goal =
        invert_weighted_mean(module_goal, type_sum, type_weights, target.mark_type.weight);

    let (mark_sum, mark_count) = marks
        .iter()
        .filter(|mark| !mark.is_absent())
        .filter(|mark| {
            MarkCoordinate::parse(&mark.id)
                .map(|filed| filed.same_type(coordinate))
                .unwrap_or(false)
        })
        .fold((0.0, 0usize), |(sum, count), mark| (sum + mark.value, count + 1));

    let required = if mark_count == 0 {
        round2(type_goal)
    } else {
        round2(type_goal * (mark_count + 1) as f64 - mark_sum)
    };

    tracing::debug!(
        coordinate = %coordinate,
        goal,
        module_goal,
        type_goal,
        required,
        "required mark solved"
    );
    Ok(Prediction::from_value(required))
}
