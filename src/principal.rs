//! Authenticated callers, as handed over by the identity collaborator
use std::fmt;
use std::str::FromStr;

use crate::error::MarketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum Role {
    #[n(0)]
    Farmer,
    #[n(1)]
    Distributor,
    #[n(2)]
    Retailer,
    #[n(3)]
    Consumer,
}

/// The caller of every core operation. Trusted as-is; the core never
/// re-authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    pub display_name: String,
    pub wallet_ref: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: display_name.into(),
            wallet_ref: None,
        }
    }
    pub fn with_wallet(mut self, wallet_ref: impl Into<String>) -> Self {
        self.wallet_ref = Some(wallet_ref.into());
        self
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Farmer => "farmer",
            Role::Distributor => "distributor",
            Role::Retailer => "retailer",
            Role::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "farmer" => Ok(Role::Farmer),
            "distributor" => Ok(Role::Distributor),
            "retailer" => Ok(Role::Retailer),
            "consumer" => Ok(Role::Consumer),
            other => Err(MarketError::Validation(format!("unknown role '{other}'"))),
        }
    }
}
