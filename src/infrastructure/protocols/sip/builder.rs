//! SIP message builder utilities

use super::message::{SipError, SipRequest, SipResponse};
use rand::Rng;
use rsip::prelude::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response, StatusCode, Version};

/// `User-Agent` sent on every outbound request
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build a simple SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Vec<Header>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Tag added to `To` unless the request already carries one
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    /// Reason phrase for the status line, when it differs from the standard one
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => {
                    let value = to.value();
                    match &self.to_tag {
                        Some(tag) if !value.contains(";tag=") => {
                            headers.push(Header::To(format!("{};tag={}", value, tag).into()));
                        }
                        _ => headers.push(header.clone()),
                    }
                }
                _ => {}
            }
        }

        if !headers.iter().any(|h| matches!(h, Header::CallId(_))) {
            return Err(SipError::InvalidMessage(
                "Request has no Call-ID header".to_string(),
            ));
        }

        headers.extend(self.headers);

        headers.push(Header::ContentLength("0".into()));

        let response = Response {
            status_code: status_line(self.status_code, self.reason),
            headers: Headers::from(headers),
            body: Vec::new(),
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

fn status_line(code: u16, reason: Option<String>) -> StatusCode {
    let standard = StatusCode::from(code);
    match reason {
        Some(reason) if standard.to_string() != format!("{} {}", code, reason) => {
            StatusCode::Other(code, reason)
        }
        _ => standard,
    }
}

/// Parameters of one REGISTER attempt
#[derive(Debug, Clone)]
pub struct RegisterParams {
    /// `scheme:host:port` of the registrar
    pub request_uri: String,
    /// Address of record, used for `To`, `From` and `Contact`
    pub identity_uri: String,
    pub display_name: Option<String>,
    pub expires: u32,
    pub cseq: u32,
}

/// Build a REGISTER with a fresh `Call-ID` and `From` tag
pub fn build_register_request(params: &RegisterParams) -> Result<SipRequest, SipError> {
    let uri = rsip::Uri::try_from(params.request_uri.as_str())?;
    let address = name_addr(params.display_name.as_deref(), &params.identity_uri);

    let headers: Vec<Header> = vec![
        Header::MaxForwards("70".into()),
        Header::From(format!("{};tag={}", address, generate_tag()).into()),
        Header::To(address.into()),
        Header::CallId(generate_call_id().into()),
        Header::CSeq(format!("{} REGISTER", params.cseq).into()),
        Header::Contact(format!("<{}>", params.identity_uri).into()),
        Header::Expires(params.expires.to_string().into()),
        Header::UserAgent(USER_AGENT.into()),
        Header::ContentLength("0".into()),
    ];

    let request = Request {
        method: Method::Register,
        uri,
        version: Version::V2,
        headers: Headers::from(headers),
        body: Vec::new(),
    };

    Ok(SipRequest::new(request))
}

fn name_addr(display_name: Option<&str>, uri: &str) -> String {
    match display_name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => format!("\"{}\" <{}>", name.replace('"', ""), uri),
        None => format!("<{}>", uri),
    }
}

/// Random tag for `From`/`To`
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

pub fn generate_call_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Via branch with the RFC 3261 magic cookie
pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    format!("z9hG4bK{:x}", rng.gen::<u64>())
}
