pub mod private;
pub mod public;
pub mod receipt;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

pub use alloy_primitives::{Address, Bytes, B256, U256};
pub use private::{
    AttestationKind, AttestationRequest, AttestationResult, FullState, PostAssembly, PreAssembly,
    PreparedPublicTransaction, PrivateContractDeploy, PrivateTransaction, ResolvedVerifier,
    TransactionIntent, TxStatus, VerifierRequirement,
};
pub use public::{
    EthTransaction, GasPricing, PersistedPubTx, PublicCompletion, PublicTx, PublicTxInput,
    PublicTxSubmission, SubmissionRecord, TransactionType, TxBinding,
};
pub use receipt::{StateReceipt, TransactionReceipt};

/// An identity reference of the form `member@node`. The node part is
/// optional; a bare identity is resolved against the local node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityLocator {
    pub identity: String,
    pub node: Option<String>,
}

impl IdentityLocator {
    pub fn new(identity: impl Into<String>, node: Option<String>) -> Self {
        Self {
            identity: identity.into(),
            node,
        }
    }

    pub fn is_local(&self, local_node: &str) -> bool {
        match &self.node {
            Some(node) => node == local_node,
            None => true,
        }
    }

    pub fn node_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.node.as_deref().unwrap_or(default)
    }

    /// Fully-qualified form with the node segment always present.
    pub fn qualified(&self, local_node: &str) -> String {
        format!("{}@{}", self.identity, self.node_or(local_node))
    }
}

impl FromStr for IdentityLocator {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(EngineError::InvalidInput("empty identity locator".into()));
        }
        match value.split_once('@') {
            Some((identity, node)) => {
                if identity.is_empty() || node.is_empty() {
                    return Err(EngineError::InvalidInput(format!(
                        "malformed identity locator: {value}"
                    )));
                }
                Ok(Self::new(identity, Some(node.to_string())))
            }
            None => Ok(Self::new(value, None)),
        }
    }
}

impl fmt::Display for IdentityLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{}@{}", self.identity, node),
            None => write!(f, "{}", self.identity),
        }
    }
}

impl TryFrom<String> for IdentityLocator {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IdentityLocator> for String {
    fn from(locator: IdentityLocator) -> Self {
        locator.to_string()
    }
}
