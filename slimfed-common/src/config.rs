//! Run configuration for slimfed
//!
//! Configuration is loaded from YAML and describes the federation: how many
//! clients exist, how many participate per round, each client's architecture
//! identifier, and which aggregation scheme drives the round.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Error;

/// How slim ratios are encoded in architecture identifiers.
///
/// Pruned-style identifiers carry the ratio directly (`stack_0.5` trains half
/// width); width-style identifiers carry a divisor (`stack_2` trains `1/2`
/// width), so the ratio decreases as the suffix grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArchStyle {
    /// Suffix is the ratio itself, e.g. `stack_0.25` -> 0.25
    #[default]
    Pruned,
    /// Suffix is a width divisor, e.g. `stack_4` -> 0.25
    Width,
}

/// Aggregation scheme selected once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationScheme {
    /// Plain weighted averaging of full-shape contributions.
    FederatedAverage,
    /// Shift-sampled slimmable aggregation (default).
    #[default]
    SlimmableMix,
}

impl std::fmt::Display for AggregationScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationScheme::FederatedAverage => write!(f, "federated_average"),
            AggregationScheme::SlimmableMix => write!(f, "slimmable_mix"),
        }
    }
}

/// Parses the slim ratio out of an architecture identifier.
///
/// The ratio is encoded in the last `_`-separated token of the identifier;
/// `style` decides how that token is interpreted. The result is validated to
/// lie in `(0, 1]`.
pub fn parse_arch_ratio(arch: &str, style: ArchStyle) -> Result<f64, Error> {
    let suffix = arch.rsplit('_').next().ok_or_else(|| Error::InvalidArch {
        arch: arch.to_string(),
        reason: "empty identifier".to_string(),
    })?;

    let value: f64 = suffix.parse().map_err(|_| Error::InvalidArch {
        arch: arch.to_string(),
        reason: format!("suffix '{suffix}' is not numeric"),
    })?;

    let ratio = match style {
        ArchStyle::Pruned => value,
        ArchStyle::Width => {
            if value <= 0.0 {
                return Err(Error::InvalidArch {
                    arch: arch.to_string(),
                    reason: "width divisor must be positive".to_string(),
                });
            }
            1.0 / value
        }
    };

    if ratio <= 0.0 || ratio > 1.0 {
        return Err(Error::InvalidArch {
            arch: arch.to_string(),
            reason: format!("ratio {ratio} outside (0, 1]"),
        });
    }
    Ok(ratio)
}

/// A single client in the federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSpec {
    /// Unique client identifier
    pub id: String,
    /// Architecture identifier, e.g. `stack_0.5`
    pub arch: String,
}

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Clients in the federation
    pub clients: Vec<ClientSpec>,
    /// Number of clients participating in each round
    pub participants_per_round: usize,
    /// Number of aggregation rounds to run
    pub rounds: usize,
    /// Aggregation scheme
    #[serde(default)]
    pub scheme: AggregationScheme,
    /// How architecture identifiers encode slim ratios
    #[serde(default)]
    pub arch_style: ArchStyle,
    /// Floor for the atomic slim ratio; the effective atomic ratio is the
    /// minimum of this and the smallest client ratio
    #[serde(default = "default_atom_ratio_floor")]
    pub atom_ratio_floor: f64,
    /// Whether finalizing before all expected contributions arrive is an error
    #[serde(default = "default_strict_finalize")]
    pub strict_finalize: bool,
    /// Parameter names kept client-local and never averaged into the server
    #[serde(default)]
    pub local_params: Vec<String>,
    /// RNG seed for shift sampling and the simulation driver
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_atom_ratio_floor() -> f64 {
    0.125
}

fn default_strict_finalize() -> bool {
    true
}

impl RunConfig {
    /// Loads a run configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parses a run configuration from a YAML string.
    pub fn from_yaml_str(text: &str) -> Result<Self, Error> {
        let config: RunConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates internal consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.clients.is_empty() {
            return Err(Error::Config("no clients configured".to_string()));
        }
        if self.participants_per_round == 0 {
            return Err(Error::Config(
                "participants_per_round must be at least 1".to_string(),
            ));
        }
        if self.participants_per_round > self.clients.len() {
            return Err(Error::Config(format!(
                "participants_per_round {} exceeds client count {}",
                self.participants_per_round,
                self.clients.len()
            )));
        }
        if self.atom_ratio_floor <= 0.0 || self.atom_ratio_floor > 1.0 {
            return Err(Error::Config(format!(
                "atom_ratio_floor {} outside (0, 1]",
                self.atom_ratio_floor
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.id.as_str()) {
                return Err(Error::Config(format!("duplicate client id '{}'", client.id)));
            }
            parse_arch_ratio(&client.arch, self.arch_style)?;
        }
        Ok(())
    }

    /// Returns the parsed slim ratio for every client, in client order.
    pub fn client_ratios(&self) -> Result<Vec<f64>, Error> {
        self.clients
            .iter()
            .map(|c| parse_arch_ratio(&c.arch, self.arch_style))
            .collect()
    }

    /// Sets the aggregation scheme.
    pub fn with_scheme(mut self, scheme: AggregationScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Sets the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> RunConfig {
        RunConfig {
            clients: vec![
                ClientSpec {
                    id: "client-1".to_string(),
                    arch: "stack_0.5".to_string(),
                },
                ClientSpec {
                    id: "client-2".to_string(),
                    arch: "stack_0.25".to_string(),
                },
            ],
            participants_per_round: 2,
            rounds: 5,
            scheme: AggregationScheme::SlimmableMix,
            arch_style: ArchStyle::Pruned,
            atom_ratio_floor: 0.25,
            strict_finalize: true,
            local_params: Vec::new(),
            seed: Some(7),
        }
    }

    #[test]
    fn test_parse_arch_ratio_pruned() {
        assert_eq!(parse_arch_ratio("stack_0.5", ArchStyle::Pruned).unwrap(), 0.5);
        assert_eq!(parse_arch_ratio("stack_1.0", ArchStyle::Pruned).unwrap(), 1.0);
        assert_eq!(
            parse_arch_ratio("deep_stack_0.125", ArchStyle::Pruned).unwrap(),
            0.125
        );
    }

    #[test]
    fn test_parse_arch_ratio_width() {
        assert_eq!(parse_arch_ratio("stack_2", ArchStyle::Width).unwrap(), 0.5);
        assert_eq!(parse_arch_ratio("stack_4", ArchStyle::Width).unwrap(), 0.25);
        assert_eq!(parse_arch_ratio("stack_1", ArchStyle::Width).unwrap(), 1.0);
    }

    #[test]
    fn test_parse_arch_ratio_invalid() {
        assert!(parse_arch_ratio("stack_abc", ArchStyle::Pruned).is_err());
        assert!(parse_arch_ratio("stack_0.0", ArchStyle::Pruned).is_err());
        assert!(parse_arch_ratio("stack_1.5", ArchStyle::Pruned).is_err());
        assert!(parse_arch_ratio("stack_0.5", ArchStyle::Width).is_err());
    }

    #[test]
    fn test_config_validate() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_too_many_participants() {
        let mut config = create_test_config();
        config.participants_per_round = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_duplicate_client() {
        let mut config = create_test_config();
        config.clients[1].id = "client-1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r"
clients:
  - id: client-1
    arch: stack_0.5
  - id: client-2
    arch: stack_0.25
participants_per_round: 2
rounds: 3
scheme: slimmable_mix
atom_ratio_floor: 0.25
";
        let config = RunConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.clients.len(), 2);
        assert_eq!(config.scheme, AggregationScheme::SlimmableMix);
        assert_eq!(config.arch_style, ArchStyle::Pruned);
        assert!(config.strict_finalize);
        assert_eq!(config.client_ratios().unwrap(), vec![0.5, 0.25]);
    }

    #[test]
    fn test_config_builders() {
        let config = create_test_config()
            .with_scheme(AggregationScheme::FederatedAverage)
            .with_seed(42);
        assert_eq!(config.scheme, AggregationScheme::FederatedAverage);
        assert_eq!(config.seed, Some(42));
    }
}
