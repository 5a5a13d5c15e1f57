use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::error::BalancerError;

use super::{LeastConnections, Policy, RoundRobin};

/// Algorithm names as they appear in config files and on the
/// configuration channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum PolicyType {
    #[default]
    RoundRobin,
    #[serde(rename = "LeastConnection")]
    LeastConnections,
}

impl PolicyType {
    pub fn name(self) -> &'static str {
        match self {
            PolicyType::RoundRobin => "RoundRobin",
            PolicyType::LeastConnections => "LeastConnection",
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyType {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RoundRobin" => Ok(PolicyType::RoundRobin),
            "LeastConnection" => Ok(PolicyType::LeastConnections),
            other => Err(BalancerError::UnknownAlgorithm(other.to_owned())),
        }
    }
}

pub struct PolicyFactory;

impl PolicyFactory {
    pub fn make(policy: PolicyType) -> Policy {
        match policy {
            PolicyType::RoundRobin => Policy::RoundRobin(RoundRobin::new()),
            PolicyType::LeastConnections => Policy::LeastConnections(LeastConnections::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        for policy in [PolicyType::RoundRobin, PolicyType::LeastConnections] {
            assert_eq!(policy.name().parse::<PolicyType>().unwrap(), policy);
            assert_eq!(PolicyFactory::make(policy).policy_type(), policy);
        }

        assert!(matches!(
            "Random".parse::<PolicyType>(),
            Err(BalancerError::UnknownAlgorithm(name)) if name == "Random"
        ));
        // names are matched exactly
        assert!("roundrobin".parse::<PolicyType>().is_err());
    }

    #[test]
    fn test_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: PolicyType,
        }

        let w: Wrapper = toml::from_str(r#"policy = "LeastConnection""#).unwrap();
        assert_eq!(w.policy, PolicyType::LeastConnections);
    }
}
