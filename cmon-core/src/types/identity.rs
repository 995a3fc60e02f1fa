//! Authenticated caller identity.

use serde::{Deserialize, Serialize};

/// Identity established by the front end before a request reaches the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub account_uuid: String,
    pub login: String,
    /// Member of the operators group.
    pub operator: bool,
}

impl Caller {
    pub fn new(account_uuid: impl Into<String>, login: impl Into<String>, operator: bool) -> Self {
        Self { account_uuid: account_uuid.into(), login: login.into(), operator }
    }
}
