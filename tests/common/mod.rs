//! In-memory collaborators for driving `SipManager` end to end

#![allow(dead_code)]

use async_trait::async_trait;
use rsip::{Header, Headers, Method, Request, Version};
use sipwatch::config::{SipAccountConfig, TimerConfig};
use sipwatch::infrastructure::dns::Resolver;
use sipwatch::infrastructure::protocols::sip::{
    RequestHandler, ResponseBuilder, SipError, SipRequest, SipResponse, Transport, TransportOptions,
};
use sipwatch::{ConnectionState, SipManager, StatusEvent};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// How the registrar answers one REGISTER
pub enum Reply {
    Status(u16, Vec<Header>),
    /// Never answers
    Hang,
}

impl Reply {
    pub fn ok(expires: u32) -> Self {
        Reply::Status(200, vec![Header::Expires(expires.to_string().into())])
    }

    pub fn challenge(realm: &str) -> Self {
        Reply::Status(
            401,
            vec![Header::WwwAuthenticate(
                format!(r#"Digest realm="{}", nonce="dcd98b7102dd2f0e", qop="auth""#, realm).into(),
            )],
        )
    }

    pub fn status(code: u16) -> Self {
        Reply::Status(code, Vec::new())
    }
}

/// Transport answering REGISTERs from a script and recording everything
#[derive(Default)]
pub struct ScriptedTransport {
    active: AtomicBool,
    starts: AtomicUsize,
    script: Mutex<VecDeque<Reply>>,
    sent: Mutex<Vec<SipRequest>>,
    responses: Mutex<Vec<u16>>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Reply>) -> Arc<Self> {
        let transport = Self::default();
        *transport.script.lock().unwrap() = script.into();
        Arc::new(transport)
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn sent(&self) -> Vec<SipRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<u16> {
        self.responses.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Simulate the link going away underneath the manager
    pub fn drop_link(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Hand a request to the registered handler as if it came off the wire
    pub async fn deliver(&self, request: SipRequest) {
        let handler = self.handler.lock().unwrap().clone();
        handler
            .expect("transport not started")
            .handle_request(request)
            .await;
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn start(
        &self,
        _options: TransportOptions,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), SipError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.handler.lock().unwrap() = Some(handler);
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SipError> {
        self.active.store(false, Ordering::SeqCst);
        self.handler.lock().unwrap().take();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn send(&self, request: SipRequest) -> Result<SipResponse, SipError> {
        self.sent.lock().unwrap().push(request.clone());
        let reply = self.script.lock().unwrap().pop_front();

        match reply {
            Some(Reply::Status(code, headers)) => {
                let mut builder = ResponseBuilder::new(code);
                for header in headers {
                    builder = builder.header(header);
                }
                builder.build_for_request(&request)
            }
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(SipError::Timeout("script exhausted".to_string())),
        }
    }

    async fn respond(&self, _request: &SipRequest, response: SipResponse) -> Result<(), SipError> {
        self.responses.lock().unwrap().push(response.status_code());
        Ok(())
    }
}

pub enum Lookup {
    Resolve,
    Hang,
    Fail,
}

pub struct FakeResolver(pub Lookup);

#[async_trait]
impl Resolver for FakeResolver {
    async fn resolve(&self, _host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        match self.0 {
            Lookup::Resolve => Ok(vec![SocketAddr::from(([203, 0, 113, 10], port))]),
            Lookup::Hang => std::future::pending().await,
            Lookup::Fail => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such host",
            )),
        }
    }
}

pub fn alice() -> SipAccountConfig {
    SipAccountConfig::new("sip.example.com", "alice", "secret")
}

pub fn manager(account: SipAccountConfig, transport: Arc<ScriptedTransport>, lookup: Lookup) -> SipManager {
    SipManager::with_resolver(
        account,
        TimerConfig::default(),
        transport,
        Arc::new(FakeResolver(lookup)),
    )
}

pub async fn next_event(events: &mut broadcast::Receiver<StatusEvent>) -> StatusEvent {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("no status event")
        .expect("status channel closed")
}

pub async fn wait_for_state(
    events: &mut broadcast::Receiver<StatusEvent>,
    state: ConnectionState,
) -> StatusEvent {
    loop {
        let event = next_event(events).await;
        if event.state == state {
            return event;
        }
    }
}

pub async fn wait_for_cause(events: &mut broadcast::Receiver<StatusEvent>, cause: &str) -> StatusEvent {
    loop {
        let event = next_event(events).await;
        if event.cause() == Some(cause) {
            return event;
        }
    }
}

pub fn invite_from(from: &str) -> SipRequest {
    let headers = vec![
        Header::Via("SIP/2.0/UDP 203.0.113.10:5060;branch=z9hG4bK74bf9".into()),
        Header::From(from.into()),
        Header::To("<sip:alice@sip.example.com>".into()),
        Header::CallId("3848276298220188511@sip.example.com".into()),
        Header::CSeq("1 INVITE".into()),
        Header::ContentLength("0".into()),
    ];
    SipRequest::new(Request {
        method: Method::Invite,
        uri: rsip::Uri::try_from("sip:alice@192.0.2.10:5060").unwrap(),
        version: Version::V2,
        headers: Headers::from(headers),
        body: Vec::new(),
    })
}

pub fn has_authorization(request: &SipRequest) -> bool {
    request
        .headers()
        .iter()
        .any(|h| matches!(h, Header::Authorization(_)))
}
