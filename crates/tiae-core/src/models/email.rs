//! Email templates and rendered outbound messages.

use serde::{Deserialize, Serialize};

use super::url_token::UrlTokenPurpose;

/// A per-tenant template keyed by purpose. `subject` and `body` are
/// handlebars sources with `company`, `email` and `link` in scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailTemplate {
    pub purpose: UrlTokenPurpose,
    pub subject: String,
    pub body: String,
}

/// A fully rendered message waiting for delivery after commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}
