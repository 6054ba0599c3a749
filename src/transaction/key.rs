use crate::message::{HeadersExt, Method, Request, Response};
use crate::{Error, Result};
use std::fmt;

/// Which side of a transaction this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Identifies a transaction for inbound matching: the branch parameter
/// of the topmost Via plus the request method and our role.
///
/// ACK and CANCEL map onto the INVITE key on the server side so they
/// reach the INVITE server transaction instead of creating one of their
/// own. A branch without the RFC 3261 magic cookie still matches, but
/// only by exact string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
}

impl TransactionKey {
    pub fn from_request(request: &Request, role: TransactionRole) -> Result<Self> {
        let branch = request
            .via_branch()
            .ok_or_else(|| Error::Error("request has no Via branch".to_string()))?;
        let method = match (role, request.method) {
            (TransactionRole::Server, Method::Ack) | (TransactionRole::Server, Method::Cancel) => {
                Method::Invite
            }
            (_, method) => method,
        };
        Ok(TransactionKey {
            role,
            branch,
            method,
        })
    }

    /// Responses are matched against client transactions using the branch
    /// we generated and the CSeq method.
    pub fn from_response(response: &Response) -> Result<Self> {
        let branch = response
            .via_branch()
            .ok_or_else(|| Error::Error("response has no Via branch".to_string()))?;
        let (_, method) = response
            .cseq()
            .ok_or_else(|| Error::Error("response has no usable CSeq".to_string()))?;
        Ok(TransactionKey {
            role: TransactionRole::Client,
            branch,
            method,
        })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            TransactionRole::Client => 'c',
            TransactionRole::Server => 's',
        };
        write!(f, "{}:{}:{}", role, self.branch, self.method)
    }
}
