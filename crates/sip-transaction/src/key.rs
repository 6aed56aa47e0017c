//! Transaction key: derived from the top `Via` branch plus the method, per
//! RFC 3261 §17.1.3 / §17.2.3 matching rules.

use rand::distr::Alphanumeric;
use rand::Rng;
use sip_message::Method;
use std::fmt;

pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generates a fresh branch parameter carrying the RFC 3261 magic cookie.
pub fn generate_branch() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();

    format!("{BRANCH_MAGIC_COOKIE}{suffix}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// INVITE and ACK share a transaction key (an ACK to a non-2xx final
/// response is part of the INVITE transaction, per RFC 3261 §17.1.1.3), so
/// both fold to `None` here.
fn fold_method(method: &Method) -> Option<Method> {
    if matches!(method, Method::Invite | Method::Ack) {
        None
    } else {
        Some(method.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TsxKey {
    branch: String,
    method: Option<Method>,
    role: Role,
}

impl fmt::Display for TsxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Client => "client",
            Role::Server => "server",
        };
        write!(f, "{role}:{}:{:?}", self.branch, self.method)
    }
}

impl TsxKey {
    /// New client-transaction key for an outbound request of `method`.
    pub fn new_client(method: &Method) -> Self {
        TsxKey {
            branch: generate_branch(),
            method: fold_method(method),
            role: Role::Client,
        }
    }

    /// Key for matching an inbound request to a server transaction, or an
    /// inbound response to a client transaction, from the wire `branch` and
    /// `method` (CSeq method for responses, request method for requests).
    pub fn from_wire(branch: &str, method: &Method, role: Role) -> Self {
        TsxKey {
            branch: branch.to_owned(),
            method: fold_method(method),
            role,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn is_invite(&self) -> bool {
        self.method.is_none()
    }
}
