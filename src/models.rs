use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::averages::AverageTree;
use crate::error::GradeError;

pub const MIN_MARK: f64 = 0.0;
pub const MAX_MARK: f64 = 20.0;
pub const MIN_GOAL: f64 = 10.0;
pub const DEFAULT_GOAL: f64 = 10.0;

/// Rounds to 2 decimals, halves rounding up.
pub fn round2(value: f64) -> f64 {
    (value * 100.0 + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub id: String,
    pub value: f64,
}

impl Mark {
    pub const ABSENT: f64 = -1.0;

    pub fn new(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    pub fn absent(id: impl Into<String>) -> Self {
        Self::new(id, Self::ABSENT)
    }

    /// Builds a mark from user input: `None` files an absence.
    pub fn submitted(id: impl Into<String>, value: Option<f64>) -> Result<Self, GradeError> {
        match value {
            None => Ok(Self::absent(id)),
            Some(value) => {
                let rounded = round2(value);
                if !(MIN_MARK..=MAX_MARK).contains(&rounded) {
                    return Err(GradeError::MarkOutOfRange(value));
                }
                Ok(Self::new(id, rounded))
            }
        }
    }

    pub fn is_absent(&self) -> bool {
        self.value < 0.0
    }
}

/// Structured form of a composite mark id `unit_module_type[_sequence]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkCoordinate {
    pub unit: String,
    pub module: String,
    pub mark_type: String,
    pub sequence: Option<u32>,
}

impl MarkCoordinate {
    pub fn new(unit: &str, module: &str, mark_type: &str) -> Self {
        Self {
            unit: unit.to_string(),
            module: module.to_string(),
            mark_type: mark_type.to_string(),
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn parse(id: &str) -> Result<Self, GradeError> {
        let parts: Vec<&str> = id.split('_').collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(GradeError::MalformedMarkId(id.to_string()));
        }

        match parts.as_slice() {
            [unit, module, mark_type] => Ok(Self::new(unit, module, mark_type)),
            [unit, module, mark_type, sequence] => {
                let sequence = sequence
                    .parse::<u32>()
                    .map_err(|_| GradeError::MalformedMarkId(id.to_string()))?;
                Ok(Self::new(unit, module, mark_type).with_sequence(sequence))
            }
            _ => Err(GradeError::MalformedMarkId(id.to_string())),
        }
    }

    /// True when both coordinates file marks under the same type.
    pub fn same_type(&self, other: &MarkCoordinate) -> bool {
        self.unit == other.unit && self.module == other.module && self.mark_type == other.mark_type
    }
}

impl fmt::Display for MarkCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.unit, self.module, self.mark_type)?;
        if let Some(sequence) = self.sequence {
            write!(f, "_{sequence}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Student {
    pub id: Uuid,
    pub email: String,
    pub anonymous: bool,
    pub goals: BTreeMap<String, f64>,
    pub marks: Vec<Mark>,
    pub averages: AverageTree,
}

impl Student {
    pub fn goal(&self, unit: &str) -> f64 {
        self.goals.get(unit).copied().unwrap_or(DEFAULT_GOAL)
    }

    pub fn mark(&self, id: &str) -> Option<&Mark> {
        self.marks.iter().find(|mark| mark.id == id)
    }
}

/// Validates and rounds a unit goal.
pub fn checked_goal(goal: f64) -> Result<f64, GradeError> {
    let rounded = round2(goal);
    if !(MIN_GOAL..=MAX_MARK).contains(&rounded) {
        return Err(GradeError::GoalOutOfRange(goal));
    }
    Ok(rounded)
}

#[derive(Debug, Clone)]
pub struct StudentMarks {
    pub id: Uuid,
    pub marks: Vec<Mark>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMark {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RankedStudent {
    pub student_id: Uuid,
    pub display_name: String,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct MarkRanking {
    pub mark_id: String,
    pub entries: Vec<RankedStudent>,
    pub promotion_mean: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ids_with_and_without_sequence() {
        let coordinate = MarkCoordinate::parse("MATH_ALG_CC_2").unwrap();
        assert_eq!(coordinate.unit, "MATH");
        assert_eq!(coordinate.module, "ALG");
        assert_eq!(coordinate.mark_type, "CC");
        assert_eq!(coordinate.sequence, Some(2));
        assert_eq!(coordinate.to_string(), "MATH_ALG_CC_2");

        let coordinate = MarkCoordinate::parse("MATH_ALG_DS").unwrap();
        assert_eq!(coordinate.sequence, None);
        assert_eq!(coordinate.to_string(), "MATH_ALG_DS");
    }

    #[test]
    fn rejects_malformed_ids() {
        for id in ["MATH", "MATH_ALG", "MATH__CC", "MATH_ALG_CC_x", "A_B_C_1_2"] {
            assert!(
                matches!(MarkCoordinate::parse(id), Err(GradeError::MalformedMarkId(_))),
                "{id} should not parse"
            );
        }
    }

    #[test]
    fn submitted_marks_are_rounded_and_bounded() {
        assert_eq!(Mark::submitted("A_B_C", Some(12.346)).unwrap().value, 12.35);
        assert!(Mark::submitted("A_B_C", None).unwrap().is_absent());
        assert_eq!(
            Mark::submitted("A_B_C", Some(20.5)),
            Err(GradeError::MarkOutOfRange(20.5))
        );
        assert!(Mark::submitted("A_B_C", Some(-0.5)).is_err());
    }

    #[test]
    fn goals_are_bounded() {
        assert_eq!(checked_goal(14.256).unwrap(), 14.26);
        assert!(checked_goal(9.5).is_err());
        assert!(checked_goal(20.01).is_err());
    }

    #[test]
    fn round2_rounds_halves_up() {
        assert_eq!(round2(15.0), 15.0);
        assert_eq!(round2(2.0 / 3.0), 0.67);
        assert_eq!(round2(-0.125), -0.12);
    }
}
