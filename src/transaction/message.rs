use super::{endpoint::EndpointInner, make_call_id};
use crate::message::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};

impl EndpointInner {
    /// Creates a SIP request with the mandatory header set in place:
    /// Via, Call-ID, From, To, CSeq, Max-Forwards and User-Agent.
    ///
    /// `via`, `from` and `to` are passed as complete headers so callers
    /// control tags and parameters; the Call-ID is freshly generated.
    /// Callers that need a stable Call-ID (dialogs, registrations)
    /// overwrite it with `unique_push` afterwards.
    pub fn make_request(
        &self,
        method: Method,
        req_uri: Uri,
        via: Header,
        from: Header,
        to: Header,
        seq: u32,
    ) -> Request {
        let headers = vec![
            via,
            Header::new("Call-ID", make_call_id(self.option.callid_suffix.as_deref())),
            from,
            to,
            Header::new("CSeq", format!("{seq} {method}")),
            Header::new("Max-Forwards", self.option.max_forwards.to_string()),
            Header::new("User-Agent", self.user_agent.clone()),
        ];
        Request {
            method,
            uri: req_uri,
            headers: Headers::from(headers),
            version: Version::V2,
            body: Vec::new(),
        }
    }

    /// Creates a response to `req` per RFC 3261 section 8.2.6: Via,
    /// Call-ID, From, To, CSeq and Max-Forwards are copied from the
    /// request, everything else is dropped, and the endpoint adds its
    /// Server header.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            h.is("Via")
                || h.is("Call-ID")
                || h.is("From")
                || h.is("To")
                || h.is("Max-Forwards")
                || h.is("CSeq")
        });
        headers.unique_push(Header::new("Server", self.user_agent.clone()));
        Response {
            status_code,
            reason_phrase: status_code.reason_phrase().to_string(),
            version: Version::V2,
            headers,
            body: body.unwrap_or_default(),
        }
    }
}
