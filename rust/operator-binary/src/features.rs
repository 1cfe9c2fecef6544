//! Feature gates, parsed once from `--feature-gates` and read-only afterwards.

use std::collections::BTreeMap;

use snafu::{OptionExt, Snafu};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{info, warn};

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("invalid feature gate syntax {entry:?}, expected name=bool"))]
    InvalidSyntax { entry: String },

    #[snafu(display("invalid boolean value in feature gate {entry:?}"))]
    InvalidValue { entry: String },

    #[snafu(display("unknown feature {name:?}"))]
    UnknownFeature { name: String },
}

#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[strum(serialize_all = "camelCase")]
pub enum FeatureName {
    EnableOpenKruise,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum FeatureStage {
    Alpha,
    Beta,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Feature {
    pub name: FeatureName,
    pub description: &'static str,
    pub enabled: bool,
    pub default_enabled: bool,
    pub stage: FeatureStage,
}

impl FeatureName {
    fn definition(self) -> Feature {
        match self {
            FeatureName::EnableOpenKruise => Feature {
                name: self,
                description: "Enables OpenKruise as an optional workload provider",
                enabled: false,
                default_enabled: false,
                stage: FeatureStage::Beta,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureGates {
    features: BTreeMap<FeatureName, Feature>,
}

impl Default for FeatureGates {
    fn default() -> Self {
        let features = FeatureName::iter()
            .map(|name| {
                let mut feature = name.definition();
                feature.enabled = feature.default_enabled;
                (name, feature)
            })
            .collect();
        Self { features }
    }
}

impl FeatureGates {
    /// Parses a comma separated list of `name=bool` entries. Unknown names are ignored.
    pub fn parse(gates: &str) -> Result<Self, Error> {
        let mut result = Self::default();
        for entry in gates.split(',').filter(|e| !e.trim().is_empty()) {
            let (name, value) = entry.split_once('=').context(InvalidSyntaxSnafu { entry })?;
            let enabled = parse_bool(value.trim()).context(InvalidValueSnafu { entry })?;
            let name = name.trim();

            match name.parse::<FeatureName>() {
                Ok(feature) => {
                    info!(feature = name, enabled, "feature gate set");
                    if let Some(f) = result.features.get_mut(&feature) {
                        f.enabled = enabled;
                    }
                }
                Err(_) => warn!(feature = name, "ignoring unsupported feature gate"),
            }
        }
        Ok(result)
    }

    pub fn is_enabled(&self, name: FeatureName) -> bool {
        self.features.get(&name).is_some_and(|f| f.enabled)
    }

    pub fn list(&self) -> Vec<Feature> {
        self.features.values().cloned().collect()
    }

    pub fn list_enabled(&self) -> Vec<Feature> {
        self.features.values().filter(|f| f.enabled).cloned().collect()
    }

    pub fn list_disabled(&self) -> Vec<Feature> {
        self.features.values().filter(|f| !f.enabled).cloned().collect()
    }

    pub fn get(&self, name: &str) -> Result<Feature, Error> {
        name.parse::<FeatureName>()
            .ok()
            .and_then(|n| self.features.get(&n))
            .cloned()
            .context(UnknownFeatureSnafu { name })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults() {
        let gates = FeatureGates::default();
        assert!(!gates.is_enabled(FeatureName::EnableOpenKruise));
        assert_eq!(gates.list().len(), 1);
        assert!(gates.list_enabled().is_empty());

        let feature = gates.get("enableOpenKruise").unwrap();
        assert_eq!(feature.stage, FeatureStage::Beta);
        assert!(!feature.default_enabled);
    }

    #[rstest]
    #[case("", false)]
    #[case("enableOpenKruise=true", true)]
    #[case(" enableOpenKruise = T ", true)]
    #[case("enableOpenKruise=true,enableOpenKruise=0", false)]
    #[case("somethingElse=true,enableOpenKruise=1", true)]
    fn test_parse(#[case] input: &str, #[case] enabled: bool) {
        let gates = FeatureGates::parse(input).unwrap();
        assert_eq!(gates.is_enabled(FeatureName::EnableOpenKruise), enabled);
        assert_eq!(gates.list_enabled().len(), usize::from(enabled));
        assert_eq!(gates.list_disabled().len(), usize::from(!enabled));
    }

    #[rstest]
    #[case("enableOpenKruise", Error::InvalidSyntax { entry: "enableOpenKruise".to_string() })]
    #[case("enableOpenKruise=yes", Error::InvalidValue { entry: "enableOpenKruise=yes".to_string() })]
    fn test_parse_errors(#[case] input: &str, #[case] expected: Error) {
        assert_eq!(FeatureGates::parse(input), Err(expected));
    }

    #[test]
    fn test_get_unknown() {
        assert_eq!(
            FeatureGates::default().get("nope"),
            Err(Error::UnknownFeature {
                name: "nope".to_string()
            })
        );
    }
}
