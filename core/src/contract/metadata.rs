use serde_derive::{Deserialize, Serialize};

/// Distinguishes contracts the platform ships (`submission`, metering
/// bookkeeping) from contracts submitted by users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractType {
    User,
    System,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::User => "user",
            ContractType::System => "sys",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ContractType::User),
            "sys" => Some(ContractType::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContractType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
