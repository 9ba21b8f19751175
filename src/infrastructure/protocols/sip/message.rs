//! SIP message types and parsing

use bytes::Bytes;
use rsip::prelude::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction timeout: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

/// Incoming request classified by method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Invite,
    Register,
    Options,
    Other(String),
}

impl RequestKind {
    pub fn from_method(method: &Method) -> Self {
        match method {
            Method::Invite => RequestKind::Invite,
            Method::Register => RequestKind::Register,
            Method::Options => RequestKind::Options,
            other => RequestKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Invite => f.write_str("INVITE"),
            RequestKind::Register => f.write_str("REGISTER"),
            RequestKind::Options => f.write_str("OPTIONS"),
            RequestKind::Other(method) => f.write_str(method),
        }
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
    /// Where the request came from, for requests received off the wire
    pub source: Option<SocketAddr>,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self {
            inner,
            source: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn kind(&self) -> RequestKind {
        RequestKind::from_method(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn call_id(&self) -> Option<String> {
        call_id(&self.inner.headers)
    }

    pub fn cseq(&self) -> Option<u32> {
        cseq(&self.inner.headers).map(|(seq, _)| seq)
    }

    pub fn from_value(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::From(from) => Some(from.value().to_string()),
            _ => None,
        })
    }

    pub fn has_via(&self) -> bool {
        self.inner
            .headers
            .iter()
            .any(|h| matches!(h, Header::Via(_)))
    }

    pub fn push_header(&mut self, header: Header) {
        self.inner.headers.push(header);
    }

    /// Rewrite the CSeq number, keeping the method
    pub fn set_cseq(&mut self, seq: u32) {
        let method = self.inner.method.to_string();
        let headers: Vec<Header> = self
            .inner
            .headers
            .iter()
            .map(|h| match h {
                Header::CSeq(_) => Header::CSeq(format!("{} {}", seq, method).into()),
                other => other.clone(),
            })
            .collect();
        self.inner.headers = Headers::from(headers);
    }

    /// `Call-ID` and CSeq number that identify the client transaction
    pub fn transaction_key(&self) -> Option<String> {
        transaction_key(&self.inner.headers)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn call_id(&self) -> Option<String> {
        call_id(&self.inner.headers)
    }

    pub fn cseq(&self) -> Option<u32> {
        cseq(&self.inner.headers).map(|(seq, _)| seq)
    }

    pub fn transaction_key(&self) -> Option<String> {
        transaction_key(&self.inner.headers)
    }

    /// Value of the `Expires` header
    pub fn expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Expires(expires) => expires.value().trim().parse().ok(),
            _ => None,
        })
    }

    /// `expires` parameter of the first `Contact` carrying one
    pub fn contact_expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Contact(contact) => contact.value().split(';').skip(1).find_map(|param| {
                let (name, value) = param.split_once('=')?;
                name.trim()
                    .eq_ignore_ascii_case("expires")
                    .then(|| value.trim().trim_matches('"').parse().ok())
                    .flatten()
            }),
            _ => None,
        })
    }

    /// `WWW-Authenticate` challenge
    pub fn www_authenticate(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::WwwAuthenticate(value) => Some(value.value().to_string()),
            Header::Other(name, value) if name.eq_ignore_ascii_case("WWW-Authenticate") => {
                Some(value.clone())
            }
            _ => None,
        })
    }

    /// `Proxy-Authenticate` challenge
    pub fn proxy_authenticate(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::ProxyAuthenticate(value) => Some(value.value().to_string()),
            Header::Other(name, value) if name.eq_ignore_ascii_case("Proxy-Authenticate") => {
                Some(value.clone())
            }
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        // Try parsing as response
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

fn call_id(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::CallId(cid) => Some(cid.value().trim().to_string()),
        _ => None,
    })
}

fn cseq(headers: &Headers) -> Option<(u32, String)> {
    headers.iter().find_map(|h| match h {
        Header::CSeq(cseq) => {
            let mut parts = cseq.value().split_whitespace();
            let seq = parts.next()?.parse().ok()?;
            let method = parts.next()?.to_string();
            Some((seq, method))
        }
        _ => None,
    })
}

fn transaction_key(headers: &Headers) -> Option<String> {
    let call_id = call_id(headers)?;
    let (seq, method) = cseq(headers)?;
    Some(format!("{}/{}/{}", call_id, seq, method.to_ascii_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invite_request() {
        let data = b"INVITE sip:alice@192.168.1.100:5060 SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 203.0.113.5:5060;branch=z9hG4bK776asdhds\r\n\
                     From: \"Jane Doe\" <sip:+15551234567@sip.example.com>;tag=1928301774\r\n\
                     To: <sip:alice@sip.example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 INVITE\r\n\
                     Contact: <sip:+15551234567@203.0.113.5:5060>\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.kind(), RequestKind::Invite);
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com".to_string()));
        assert_eq!(req.cseq(), Some(314159));
        assert!(req.from_value().unwrap().contains("+15551234567"));
        assert_eq!(
            req.transaction_key(),
            Some("a84b4c76e66710@pc33.example.com/314159/INVITE".to_string())
        );
    }

    #[test]
    fn test_parse_register_response() {
        let data = b"SIP/2.0 200 OK\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: <sip:alice@example.com>;tag=1928301774\r\n\
                     To: <sip:alice@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 2 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>;expires=600\r\n\
                     Expires: 1200\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_response());

        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.cseq(), Some(2));
        assert_eq!(resp.expires(), Some(1200));
        assert_eq!(resp.contact_expires(), Some(600));
    }

    #[test]
    fn test_request_kind_dispatch() {
        assert_eq!(RequestKind::from_method(&Method::Options), RequestKind::Options);
        assert_eq!(RequestKind::from_method(&Method::Register), RequestKind::Register);
        assert_eq!(
            RequestKind::from_method(&Method::Bye),
            RequestKind::Other("BYE".to_string())
        );
    }

    #[test]
    fn test_set_cseq_keeps_method() {
        let data = b"REGISTER sip:sip.example.com:5060 SIP/2.0\r\n\
                     From: <sip:alice@sip.example.com>;tag=1\r\n\
                     To: <sip:alice@sip.example.com>\r\n\
                     Call-ID: abc\r\n\
                     CSeq: 1 REGISTER\r\n\
                     Content-Length: 0\r\n\r\n";
        let mut req = SipRequest::parse(data).unwrap();
        req.set_cseq(2);

        assert_eq!(req.cseq(), Some(2));
        assert_eq!(req.transaction_key(), Some("abc/2/REGISTER".to_string()));
    }
}
