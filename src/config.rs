use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use serde_json::{Map, Value};

use crate::error::{ConfigError, GradeError};
use crate::models::MarkCoordinate;

/// Key holding a unit's weight in the general average.
pub const UNIT_WEIGHT_KEY: &str = "ECTS";
/// Key holding a module's weight within its unit.
pub const MODULE_WEIGHT_KEY: &str = "self";

/// Static weighting hierarchy, loaded once at startup and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightConfig {
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub id: String,
    pub ects: f64,
    pub modules: Vec<Module>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub id: String,
    pub weight: f64,
    pub types: Vec<MarkType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkType {
    pub id: String,
    pub weight: f64,
}

/// A validated `(unit, module, type)` triple.
#[derive(Debug, Clone, Copy)]
pub struct TypeRef<'a> {
    pub unit: &'a Unit,
    pub module: &'a Module,
    pub mark_type: &'a MarkType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightShare {
    pub id: String,
    pub weight: f64,
    pub share: f64,
}

impl WeightConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read weights from {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("invalid weights document {}", path.display()))?;
        tracing::debug!(units = config.units.len(), path = %path.display(), "weights loaded");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let document: Value = serde_json::from_str(raw)?;
        let root = as_object(&document, "weights")?;
        let mut units = Vec::new();

        for (unit_id, unit_value) in root {
            check_id(unit_id)?;
            let unit_object = as_object(unit_value, unit_id)?;
            let ects = weight(unit_object, unit_id, UNIT_WEIGHT_KEY)?;
            let mut modules = Vec::new();

            for (module_id, module_value) in unit_object {
                if module_id == UNIT_WEIGHT_KEY {
                    continue;
                }
                check_id(module_id)?;
                let path = format!("{unit_id}.{module_id}");
                let module_object = as_object(module_value, &path)?;
                let module_weight = weight(module_object, &path, MODULE_WEIGHT_KEY)?;
                let mut types = Vec::new();

                for (type_id, type_value) in module_object {
                    if type_id == MODULE_WEIGHT_KEY {
                        continue;
                    }
                    check_id(type_id)?;
                    let type_path = format!("{path}.{type_id}");
                    types.push(MarkType {
                        id: type_id.clone(),
                        weight: positive(type_value, &type_path)?,
                    });
                }

                if types.is_empty() {
                    return Err(ConfigError::Empty { path });
                }
                modules.push(Module {
                    id: module_id.clone(),
                    weight: module_weight,
                    types,
                });
            }

            if modules.is_empty() {
                return Err(ConfigError::Empty {
                    path: unit_id.clone(),
                });
            }
            units.push(Unit {
                id: unit_id.clone(),
                ects,
                modules,
            });
        }

        if units.is_empty() {
            return Err(ConfigError::Empty {
                path: "weights".to_string(),
            });
        }
        Ok(Self { units })
    }

    /// Serializes back to the `{ unit: { ECTS, module: { self, type } } }` document.
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for unit in &self.units {
            let mut unit_object = Map::new();
            unit_object.insert(UNIT_WEIGHT_KEY.to_string(), Value::from(unit.ects));
            for module in &unit.modules {
                let mut module_object = Map::new();
                module_object.insert(MODULE_WEIGHT_KEY.to_string(), Value::from(module.weight));
                for mark_type in &module.types {
                    module_object.insert(mark_type.id.clone(), Value::from(mark_type.weight));
                }
                unit_object.insert(module.id.clone(), Value::Object(module_object));
            }
            root.insert(unit.id.clone(), Value::Object(unit_object));
        }
        Value::Object(root)
    }

    pub fn unit(&self, unit_id: &str) -> Option<&Unit> {
        self.units.iter().find(|unit| unit.id == unit_id)
    }

    pub fn resolve(
        &self,
        unit_id: &str,
        module_id: &str,
        type_id: &str,
    ) -> Result<TypeRef<'_>, GradeError> {
        let invalid = || GradeError::InvalidCoordinate {
            unit: unit_id.to_string(),
            module: module_id.to_string(),
            mark_type: type_id.to_string(),
        };

        let unit = self.unit(unit_id).ok_or_else(invalid)?;
        let module = unit.module(module_id).ok_or_else(invalid)?;
        let mark_type = module.mark_type(type_id).ok_or_else(invalid)?;
        Ok(TypeRef {
            unit,
            module,
            mark_type,
        })
    }

    pub fn resolve_coordinate(&self, coordinate: &MarkCoordinate) -> Result<TypeRef<'_>, GradeError> {
        self.resolve(&coordinate.unit, &coordinate.module, &coordinate.mark_type)
    }

    /// Builds the composite id of a mark after validating its triple.
    pub fn mark_id(
        &self,
        unit_id: &str,
        module_id: &str,
        type_id: &str,
        sequence: Option<u32>,
    ) -> Result<String, GradeError> {
        self.resolve(unit_id, module_id, type_id)?;
        let mut coordinate = MarkCoordinate::new(unit_id, module_id, type_id);
        coordinate.sequence = sequence;
        Ok(coordinate.to_string())
    }

    /// Relative weights of units, of a unit's modules, or of a module's types.
    pub fn shares(
        &self,
        unit_id: Option<&str>,
        module_id: Option<&str>,
    ) -> Result<Vec<WeightShare>, GradeError> {
        let weights: Vec<(String, f64)> = match (unit_id, module_id) {
            (None, _) => self
                .units
                .iter()
                .map(|unit| (unit.id.clone(), unit.ects))
                .collect(),
            (Some(unit_id), None) => self
                .unit(unit_id)
                .ok_or_else(|| GradeError::UnknownUnit(unit_id.to_string()))?
                .modules
                .iter()
                .map(|module| (module.id.clone(), module.weight))
                .collect(),
            (Some(unit_id), Some(module_id)) => {
                let module = self
                    .unit(unit_id)
                    .and_then(|unit| unit.module(module_id))
                    .ok_or_else(|| GradeError::InvalidCoordinate {
                        unit: unit_id.to_string(),
                        module: module_id.to_string(),
                        mark_type: String::new(),
                    })?;
                module
                    .types
                    .iter()
                    .map(|mark_type| (mark_type.id.clone(), mark_type.weight))
                    .collect()
            }
        };

        let total: f64 = weights.iter().map(|(_, weight)| weight).sum();
        Ok(weights
            .into_iter()
            .map(|(id, weight)| WeightShare {
                id,
                weight,
                share: weight / total,
            })
            .collect())
    }
}

impl Unit {
    pub fn module(&self, module_id: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.id == module_id)
    }
}

impl Module {
    pub fn mark_type(&self, type_id: &str) -> Option<&MarkType> {
        self.types.iter().find(|mark_type| mark_type.id == type_id)
    }
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, ConfigError> {
    value.as_object().ok_or_else(|| ConfigError::NotAnObject {
        path: path.to_string(),
    })
}

fn weight(object: &Map<String, Value>, path: &str, key: &'static str) -> Result<f64, ConfigError> {
    let value = object.get(key).ok_or_else(|| ConfigError::MissingWeight {
        path: path.to_string(),
        key,
    })?;
    positive(value, &format!("{path}.{key}"))
}

fn positive(value: &Value, path: &str) -> Result<f64, ConfigError> {
    let weight = value.as_f64().ok_or_else(|| ConfigError::InvalidWeight {
        path: path.to_string(),
        weight: f64::NAN,
    })?;
    if !weight.is_finite() || weight <= 0.0 {
        return Err(ConfigError::InvalidWeight {
            path: path.to_string(),
            weight,
        });
    }
    Ok(weight)
}

fn check_id(id: &str) -> Result<(), ConfigError> {
    if id.is_empty() || id.contains('_') || id == UNIT_WEIGHT_KEY || id == MODULE_WEIGHT_KEY {
        return Err(ConfigError::InvalidId { id: id.to_string() });
    }
    Ok(())
}

/// Who may enroll: an optional email domain and an optional roster of
/// address local parts. With neither set, any well-formed address is accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrollmentPolicy {
    pub domain: Option<String>,
    pub roster: Option<BTreeSet<String>>,
}

impl EnrollmentPolicy {
    pub fn load(domain: Option<String>, roster: Option<&Path>) -> anyhow::Result<Self> {
        let roster = match roster {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read roster {}", path.display()))?;
                let roster = parse_roster(&raw);
                tracing::debug!(entries = roster.len(), path = %path.display(), "roster loaded");
                Some(roster)
            }
            None => None,
        };
        Ok(Self {
            domain: domain.map(|domain| domain.trim_start_matches('@').to_lowercase()),
            roster,
        })
    }

    pub fn check(&self, email: &str) -> Result<(), GradeError> {
        let (local, domain) = email
            .split_once('@')
            .filter(|(local, domain)| !local.is_empty() && !domain.is_empty() && !domain.contains('@'))
            .ok_or_else(|| GradeError::InvalidEmail(email.to_string()))?;

        if let Some(expected) = &self.domain {
            if !domain.eq_ignore_ascii_case(expected) {
                return Err(GradeError::ForeignDomain {
                    email: email.to_string(),
                    domain: expected.clone(),
                });
            }
        }
        if let Some(roster) = &self.roster {
            if !roster.contains(&local.to_lowercase()) {
                return Err(GradeError::NotOnRoster(email.to_string()));
            }
        }
        Ok(())
    }
}

/// One entry per line, either a local part or a full address. `#` starts a comment.
fn parse_roster(raw: &str) -> BTreeSet<String> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once('@')
                .map_or(line, |(local, _)| local)
                .to_lowercase()
        })
        .collect()
}
