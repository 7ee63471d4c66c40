use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::WeightConfig;
use crate::models::{round2, Mark, MarkCoordinate};

/// Averages at every level of the hierarchy. Serializes to
/// `{ general, [unit]: { self, [module]: { self, [type]: avg } } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageTree {
    pub general: Option<f64>,
    #[serde(flatten)]
    pub units: BTreeMap<String, UnitAverages>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitAverages {
    #[serde(rename = "self")]
    pub own: Option<f64>,
    #[serde(flatten)]
    pub modules: BTreeMap<String, ModuleAverages>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleAverages {
    #[serde(rename = "self")]
    pub own: Option<f64>,
    #[serde(flatten)]
    pub types: BTreeMap<String, Option<f64>>,
}

impl AverageTree {
    pub fn unit(&self, unit_id: &str) -> Option<&UnitAverages> {
        self.units.get(unit_id)
    }

    pub fn module(&self, unit_id: &str, module_id: &str) -> Option<&ModuleAverages> {
        self.unit(unit_id)?.modules.get(module_id)
    }

    pub fn unit_average(&self, unit_id: &str) -> Option<f64> {
        self.unit(unit_id)?.own
    }

    pub fn module_average(&self, unit_id: &str, module_id: &str) -> Option<f64> {
        self.module(unit_id, module_id)?.own
    }

    pub fn type_average(&self, unit_id: &str, module_id: &str, type_id: &str) -> Option<f64> {
        self.module(unit_id, module_id)?
            .types
            .get(type_id)
            .copied()
            .flatten()
    }
}

/// Weighted mean over the non-null entries, renormalized by their weights only.
pub fn weighted_mean<I>(entries: I) -> Option<f64>
where
    I: IntoIterator<Item = (Option<f64>, f64)>,
{
    let mut sum = 0.0;
    let mut weights = 0.0;
    for (average, weight) in entries {
        if let Some(average) = average {
            sum += average * weight;
            weights += weight;
        }
    }

    if weights > 0.0 {
        Some(round2(sum / weights))
    } else {
        None
    }
}

/// Rebuilds the whole tree from a flat mark list. Absences and ids that do
/// not resolve to a configured type are left out.
pub fn compute_averages(marks: &[Mark], config: &WeightConfig) -> AverageTree {
    let graded: Vec<(MarkCoordinate, f64)> = marks
        .iter()
        .filter(|mark| !mark.is_absent())
        .filter_map(|mark| {
            MarkCoordinate::parse(&mark.id)
                .ok()
                .map(|coordinate| (coordinate, mark.value))
        })
        .collect();

    let mut tree = AverageTree::default();

    for unit in &config.units {
        let mut unit_averages = UnitAverages::default();

        for module in &unit.modules {
            let mut module_averages = ModuleAverages::default();

            for mark_type in &module.types {
                let (sum, count) = graded
                    .iter()
                    .filter(|(coordinate, _)| {
                        coordinate.unit == unit.id
                            && coordinate.module == module.id
                            && coordinate.mark_type == mark_type.id
                    })
                    .fold((0.0_f64, 0usize), |(sum, count), (_, value)| (sum + *value, count + 1));

                let average = (count > 0).then(|| round2(sum / count as f64));
                module_averages.types.insert(mark_type.id.clone(), average);
            }

            module_averages.own = weighted_mean(
                module
                    .types
                    .iter()
                    .map(|mark_type| (module_averages.types[&mark_type.id], mark_type.weight)),
            );
            unit_averages.modules.insert(module.id.clone(), module_averages);
        }

        unit_averages.own = weighted_mean(
            unit.modules
                .iter()
                .map(|module| (unit_averages.modules[&module.id].own, module.weight)),
        );
        tree.units.insert(unit.id.clone(), unit_averages);
    }

    tree.general = weighted_mean(
        config
            .units
            .iter()
            .map(|unit| (tree.units[&unit.id].own, unit.ects)),
    );
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{scenario_config, two_unit_config};

    fn all_values(tree: &AverageTree) -> Vec<Option<f64>> {
        let mut values = vec![tree.general];
        for unit in tree.units.values() {
            values.push(unit.own);
            for module in unit.modules.values() {
                values.push(module.own);
                values.extend(module.types.values().copied());
            }
        }
        values
    }

    #[test]
    fn empty_marks_give_null_everywhere() {
        let tree = compute_averages(&[], &two_unit_config());
        assert_eq!(tree.units.len(), 2);
        assert!(all_values(&tree).iter().all(Option::is_none));
        assert_eq!(tree.module("INFO", "WEB").unwrap().types.len(), 1);
    }

    #[test]
    fn renormalizes_over_present_children() {
        let marks = vec![Mark::new("U1_M1_A", 14.0), Mark::new("U1_M1_B", 16.0)];
        let tree = compute_averages(&marks, &scenario_config());

        assert_eq!(tree.type_average("U1", "M1", "A"), Some(14.0));
        assert_eq!(tree.type_average("U1", "M1", "B"), Some(16.0));
        assert_eq!(tree.module_average("U1", "M1"), Some(15.0));
        assert_eq!(tree.module_average("U1", "M2"), None);
        assert_eq!(tree.type_average("U1", "M2", "C"), None);
        assert_eq!(tree.unit_average("U1"), Some(15.0));
        assert_eq!(tree.general, Some(15.0));
    }

    #[test]
    fn averages_repeated_marks_of_a_type() {
        let marks = vec![
            Mark::new("MATH_ALG_CC_1", 10.0),
            Mark::new("MATH_ALG_CC_2", 13.0),
            Mark::new("MATH_ALG_CC_3", 14.0),
        ];
        let tree = compute_averages(&marks, &two_unit_config());
        assert_eq!(tree.type_average("MATH", "ALG", "CC"), Some(12.33));
        assert_eq!(tree.module_average("MATH", "ALG"), Some(12.33));
    }

    #[test]
    fn weights_every_level() {
        let marks = vec![
            Mark::new("MATH_ALG_CC_1", 12.0),
            Mark::new("MATH_ALG_DS_1", 9.0),
            Mark::new("MATH_ANA_DS_1", 15.0),
            Mark::new("INFO_PROG_TP_1", 18.0),
            Mark::new("INFO_WEB_TP_1", 14.0),
        ];
        let tree = compute_averages(&marks, &two_unit_config());

        // (12 + 9 * 2) / 3
        assert_eq!(tree.module_average("MATH", "ALG"), Some(10.0));
        assert_eq!(tree.module_average("MATH", "ANA"), Some(15.0));
        // (10 * 2 + 15) / 3
        assert_eq!(tree.unit_average("MATH"), Some(11.67));
        // (18 * 3 + 14) / 4
        assert_eq!(tree.unit_average("INFO"), Some(17.0));
        // (11.67 * 6 + 17 * 4) / 10
        assert_eq!(tree.general, Some(13.8));
    }

    #[test]
    fn absences_and_unknown_ids_do_not_count() {
        let config = two_unit_config();
        let marks = vec![Mark::new("MATH_ALG_CC_1", 12.0)];
        let baseline = compute_averages(&marks, &config);

        let mut with_noise = marks.clone();
        with_noise.push(Mark::absent("MATH_ANA_DS_1"));
        with_noise.push(Mark::new("BIO_CELL_TP_1", 3.0));
        with_noise.push(Mark::new("not-a-mark", 3.0));

        assert_eq!(compute_averages(&with_noise, &config), baseline);
        assert_eq!(with_noise.len(), 4);
    }

    #[test]
    fn averages_stay_within_mark_bounds() {
        let config = two_unit_config();
        let ids = [
            "MATH_ALG_CC_1",
            "MATH_ALG_DS_1",
            "MATH_ANA_CC_1",
            "MATH_ANA_DS_1",
            "INFO_PROG_TP_1",
            "INFO_PROG_PROJ_1",
            "INFO_WEB_TP_1",
        ];

        let mut seed = 7u64;
        for round in 0..50 {
            let marks: Vec<Mark> = ids
                .iter()
                .take(1 + round % ids.len())
                .map(|id| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    Mark::new(*id, ((seed >> 33) % 2001) as f64 / 100.0)
                })
                .collect();

            let tree = compute_averages(&marks, &config);
            for value in all_values(&tree).into_iter().flatten() {
                assert!((0.0..=20.0).contains(&value), "{value} out of bounds");
            }
        }
    }

    #[test]
    fn serializes_to_the_nested_document_shape() {
        let marks = vec![Mark::new("U1_M1_A", 14.0), Mark::new("U1_M1_B", 16.0)];
        let tree = compute_averages(&marks, &scenario_config());
        let json = serde_json::to_value(&tree).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "general": 15.0,
                "U1": {
                    "self": 15.0,
                    "M1": { "self": 15.0, "A": 14.0, "B": 16.0 },
                    "M2": { "self": null, "C": null }
                }
            })
        );

        let back: AverageTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }
}
