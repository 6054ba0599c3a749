//! Dialog layer: dialog identity and lifecycle, digest authentication
//! and the REGISTER/INVITE flows built on top of the transaction layer.

use crate::message::{HeadersExt, Request, Response};
use crate::{Error, Result};
use std::fmt;

pub mod authenticate;
pub mod client_dialog;
#[allow(clippy::module_inception)]
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod registration;
pub mod server_dialog;

#[cfg(test)]
mod tests;

/// Dialog identity: Call-ID plus both tags. `from_tag`/`to_tag` are the
/// tags of the initial request's From and To headers, regardless of which
/// side we are; an early dialog has an empty `to_tag` until the remote
/// tag is learned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl DialogId {
    pub fn is_early(&self) -> bool {
        self.to_tag.is_empty()
    }

    /// The same dialog as identified by the peer: tags swapped. Requests
    /// arriving inside the dialog carry the peer's tag in From.
    pub fn reversed(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            from_tag: self.to_tag.clone(),
            to_tag: self.from_tag.clone(),
        }
    }
}

impl TryFrom<&Request> for DialogId {
    type Error = Error;

    fn try_from(request: &Request) -> Result<Self> {
        let call_id = request
            .call_id()
            .ok_or_else(|| Error::SipMessageError("request has no Call-ID".to_string()))?
            .to_string();
        let from_tag = request
            .from_tag()
            .ok_or_else(|| Error::SipMessageError("request From has no tag".to_string()))?;
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag: request.to_tag().unwrap_or_default(),
        })
    }
}

impl TryFrom<&Response> for DialogId {
    type Error = Error;

    fn try_from(response: &Response) -> Result<Self> {
        let call_id = response
            .call_id()
            .ok_or_else(|| Error::SipMessageError("response has no Call-ID".to_string()))?
            .to_string();
        let from_tag = response
            .from_tag()
            .ok_or_else(|| Error::SipMessageError("response From has no tag".to_string()))?;
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag: response.to_tag().unwrap_or_default(),
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
    }
}
