//! Parameter catalog of the target system.
//!
//! The catalog is the static description of every configuration parameter the
//! target accepts: its declared type, its default value, the enum domain where
//! one exists and the parameters it constrains. Everything the mutation engine
//! reads as fixed input for a campaign is derived from it once at startup.

use crate::dependency::{ConstraintKind, DependencyModel, MutationCounters, Relation};
use crate::input::{ConfItem, ConfType, Input, Seed};
use crate::value::ValueGenerator;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Parameter '{0}' is declared more than once")]
    DuplicateParameter(String),
    #[error("Enum parameter '{0}' declares no values")]
    EmptyEnum(String),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DependsOn {
    pub target: String,
    pub kind: ConstraintKind,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ConfType,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub values: Vec<String>,
    /// Parameters left out of the baseline seed are still known to the
    /// dependency model and the counters.
    #[serde(default = "default_in_baseline")]
    pub in_baseline: bool,
    #[serde(default)]
    pub depends: Vec<DependsOn>,
}

fn default_in_baseline() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ParamCatalog {
    #[serde(default, rename = "param")]
    params: Vec<ParamSpec>,
}

impl ParamCatalog {
    pub fn load_from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        content.parse()
    }

    pub fn from_params(params: Vec<ParamSpec>) -> Result<Self, CatalogError> {
        let catalog = Self { params };
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for param in &self.params {
            if !seen.insert(param.name.as_str()) {
                return Err(CatalogError::DuplicateParameter(param.name.clone()));
            }
            if param.ty == ConfType::Enum && param.values.is_empty() {
                return Err(CatalogError::EmptyEnum(param.name.clone()));
            }
        }
        for param in &self.params {
            for dep in &param.depends {
                if !seen.contains(dep.target.as_str()) {
                    warn!(
                        source = %param.name,
                        target = %dep.target,
                        "Relation targets a parameter missing from the catalog"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn dependency_model(&self) -> DependencyModel {
        self.params
            .iter()
            .flat_map(|param| {
                param.depends.iter().map(move |dep| {
                    (param.name.clone(), Relation::new(dep.target.clone(), dep.kind))
                })
            })
            .collect()
    }

    pub fn mutation_counters(&self) -> MutationCounters {
        MutationCounters::new(self.params.iter().map(|param| param.name.clone()))
    }

    pub fn default_values(&self) -> HashMap<String, String> {
        self.params
            .iter()
            .map(|param| (param.name.clone(), param.default.clone()))
            .collect()
    }

    pub fn value_generator(&self) -> ValueGenerator {
        self.params
            .iter()
            .filter(|param| param.ty == ConfType::Enum)
            .fold(ValueGenerator::new(), |generator, param| {
                generator.with_enum_domain(param.name.clone(), param.values.clone())
            })
    }

    /// The seed made of every baseline parameter at its default value.
    pub fn baseline_seed(&self) -> Seed {
        let seed = Seed::from_items(
            self.params
                .iter()
                .filter(|param| param.in_baseline)
                .map(|param| ConfItem::new(param.name.clone(), param.ty, param.default.clone())),
        );
        debug!(items = seed.len(), "Built baseline seed from catalog");
        seed
    }

    /// Declared type of `name`, used to type items coming from injected seeds.
    pub fn type_of(&self, name: &str) -> Option<ConfType> {
        self.params
            .iter()
            .find(|param| param.name == name)
            .map(|param| param.ty)
    }
}

impl std::str::FromStr for ParamCatalog {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let catalog: ParamCatalog = toml::from_str(s)?;
        catalog.validate()?;
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [[param]]
        name = "hbase.rootdir"
        type = "DIRPATH"
        default = "/data/hbase"
        [[param.depends]]
        target = "hbase.wal.dir"
        kind = "sub-path"

        [[param]]
        name = "hbase.wal.dir"
        type = "DIRPATH"
        default = "/data/hbase/wal"

        [[param]]
        name = "hbase.regionserver.handler.count"
        type = "int"
        default = "30"

        [[param]]
        name = "hbase.balancer.policy"
        type = "enum"
        default = "simple"
        values = ["simple", "stochastic"]

        [[param]]
        name = "hbase.master.port"
        type = "PORT"
        default = "16000"
        in-baseline = false
    "#;

    #[test]
    fn catalog_builds_every_derived_table() {
        let catalog: ParamCatalog = CATALOG.parse().unwrap();
        assert_eq!(catalog.params().len(), 5);

        let model = catalog.dependency_model();
        assert_eq!(model.relations("hbase.rootdir").len(), 1);
        assert_eq!(
            model.relations("hbase.rootdir")[0],
            Relation::new("hbase.wal.dir", ConstraintKind::SubPath)
        );

        let counters = catalog.mutation_counters();
        assert_eq!(counters.get("hbase.master.port"), Some(0));

        let defaults = catalog.default_values();
        assert_eq!(defaults["hbase.regionserver.handler.count"], "30");

        let seed = catalog.baseline_seed();
        assert_eq!(seed.len(), 4, "parameters outside the baseline are skipped");
        assert!(seed.find("hbase.master.port").is_none());

        let generator = catalog.value_generator();
        assert_eq!(generator.enum_domain("hbase.balancer.policy").unwrap().len(), 2);
        assert_eq!(catalog.type_of("hbase.wal.dir"), Some(ConfType::DirPath));
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let raw = r#"
            [[param]]
            name = "a"
            type = "INT"
            [[param]]
            name = "a"
            type = "INT"
        "#;
        let err = raw.parse::<ParamCatalog>().unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateParameter(name) if name == "a"));
    }

    #[test]
    fn enum_without_values_is_rejected() {
        let raw = r#"
            [[param]]
            name = "mode"
            type = "ENUM"
        "#;
        assert!(matches!(
            raw.parse::<ParamCatalog>(),
            Err(CatalogError::EmptyEnum(_))
        ));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"
            [[param]]
            name = "x"
            type = "widget"
        "#;
        assert!(matches!(raw.parse::<ParamCatalog>(), Err(CatalogError::Parse(_))));
    }
}
