//! SIP transport layer - client side UDP and TCP links to the registrar

use super::builder::{generate_branch, ResponseBuilder};
use super::handler::RequestHandler;
use super::message::{SipError, SipMessage, SipRequest, SipResponse};
use crate::config::TransportKind;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rsip::{Header, Headers};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where and how to reach the registrar
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    /// Address the host resolved to
    pub remote: SocketAddr,
}

/// Transport collaborator used by the signaling core.
///
/// Wire framing and client transactions live behind this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link and route unsolicited requests to `handler`
    async fn start(
        &self,
        options: TransportOptions,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), SipError>;

    /// Close the link. Safe to call when not started.
    async fn stop(&self) -> Result<(), SipError>;

    fn is_active(&self) -> bool;

    /// Send a request and wait for its final response
    async fn send(&self, request: SipRequest) -> Result<SipResponse, SipError>;

    /// Send a response to a request received through `handler`
    async fn respond(&self, request: &SipRequest, response: SipResponse) -> Result<(), SipError>;

    fn make_response(
        &self,
        request: &SipRequest,
        code: u16,
        reason: &str,
    ) -> Result<SipResponse, SipError> {
        debug!("Building {} {} for {}", code, reason, request.method());
        let mut builder = ResponseBuilder::new(code).reason(reason);
        if code > 100 {
            if let Some(call_id) = request.call_id() {
                builder = builder.to_tag(local_tag(&call_id));
            }
        }
        builder.build_for_request(request)
    }
}

/// Stable local tag so every response to one request carries the same `To` tag
pub fn local_tag(call_id: &str) -> String {
    let digest = format!("{:x}", md5::compute(call_id.as_bytes()));
    digest[..10].to_string()
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
        }
    }
}

impl SipTimers {
    /// Timer F: Non-INVITE transaction timeout (64*T1)
    pub fn timer_f(&self) -> Duration {
        self.t1 * 64
    }
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<SipResponse>>>;

enum Link {
    Udp(Arc<UdpSocket>),
    Tcp(tokio::sync::Mutex<OwnedWriteHalf>),
}

struct Session {
    kind: TransportKind,
    link: Link,
    local: SocketAddr,
    remote: SocketAddr,
    pending: PendingMap,
    active: AtomicBool,
}

impl Session {
    async fn write(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError> {
        match &self.link {
            Link::Udp(socket) => {
                debug!("Sending {} bytes to {} via UDP", data.len(), destination);
                socket.send_to(data, destination).await.map_err(|e| {
                    SipError::TransportError(format!("Failed to send UDP packet: {}", e))
                })?;
            }
            Link::Tcp(writer) => {
                debug!("Sending {} bytes to {} via TCP", data.len(), self.remote);
                let mut writer = writer.lock().await;
                writer
                    .write_all(data)
                    .await
                    .map_err(|e| SipError::TransportError(format!("Failed to send TCP data: {}", e)))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| SipError::TransportError(format!("Failed to flush TCP stream: {}", e)))?;
            }
        }
        Ok(())
    }

    fn is_reliable(&self) -> bool {
        matches!(self.link, Link::Tcp(_))
    }

    fn take_pending(&self, key: &str) -> Option<oneshot::Sender<SipResponse>> {
        self.pending.lock().ok()?.remove(key)
    }

    fn route(&self, message: SipMessage, source: SocketAddr, handler: &Arc<dyn RequestHandler>) {
        match message {
            SipMessage::Response(response) => {
                if response.is_provisional() {
                    debug!("Provisional {} from {}", response.status_code(), source);
                    return;
                }
                let Some(key) = response.transaction_key() else {
                    warn!("Response from {} without Call-ID/CSeq", source);
                    return;
                };
                match self.take_pending(&key) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("Stray response for {} from {}", key, source),
                }
            }
            SipMessage::Request(request) => {
                // ACKs to our non-2xx finals are absorbed by the server transaction
                if matches!(request.method(), rsip::Method::Ack) {
                    debug!("Absorbed ACK from {}", source);
                    return;
                }
                let handler = handler.clone();
                let request = request.with_source(source);
                tokio::spawn(async move {
                    handler.handle_request(request).await;
                });
            }
        }
    }

    fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            // Dropping the senders fails every waiting `send`
            pending.clear();
        }
    }
}

/// Removes a pending transaction entry however `send` exits
struct PendingEntry<'a> {
    session: &'a Session,
    key: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.session.take_pending(self.key);
    }
}

/// Client transport over UDP or TCP.
///
/// TLS is not built in; supply another [`Transport`] for `sips`.
pub struct NetworkTransport {
    timers: SipTimers,
    state: Mutex<Option<(Arc<Session>, JoinHandle<()>)>>,
}

impl NetworkTransport {
    pub fn new() -> Self {
        Self::with_timers(SipTimers::default())
    }

    pub fn with_timers(timers: SipTimers) -> Self {
        Self {
            timers,
            state: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<Arc<Session>, SipError> {
        let state = self
            .state
            .lock()
            .map_err(|_| SipError::Internal("transport state poisoned".to_string()))?;
        match state.as_ref() {
            Some((session, _)) if session.active.load(Ordering::SeqCst) => Ok(session.clone()),
            _ => Err(SipError::TransportError("Transport not started".to_string())),
        }
    }

    async fn udp_receive_loop(session: Arc<Session>, socket: Arc<UdpSocket>, handler: Arc<dyn RequestHandler>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLFs carry no message
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => session.route(message, source, &handler),
                        Err(e) => warn!("Failed to parse SIP message from {}: {}", source, e),
                    }
                }
                Err(e) if is_transient(&e) => {
                    debug!("Ignoring UDP receive error: {}", e);
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }

        session.shutdown();
    }

    async fn tcp_receive_loop(session: Arc<Session>, mut reader: OwnedReadHalf, handler: Arc<dyn RequestHandler>) {
        let mut buf = BytesMut::with_capacity(8192);
        let source = session.remote;

        loop {
            while let Some(frame) = next_frame(&mut buf) {
                match SipMessage::parse(&frame) {
                    Ok(message) => session.route(message, source, &handler),
                    Err(e) => warn!("Failed to parse SIP message from {}: {}", source, e),
                }
            }

            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    info!("TCP connection closed by {}", source);
                    break;
                }
                Ok(size) => debug!("Received {} bytes from {} via TCP", size, source),
                Err(e) => {
                    error!("Failed to read from TCP connection: {}", e);
                    break;
                }
            }
        }

        session.shutdown();
    }
}

impl Default for NetworkTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn start(
        &self,
        options: TransportOptions,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), SipError> {
        self.stop().await?;

        info!(
            "Starting {} transport towards {}:{} ({})",
            options.kind, options.host, options.port, options.remote
        );

        let (session, task) = match options.kind {
            TransportKind::Udp => {
                let bind_addr: SocketAddr = if options.remote.is_ipv6() {
                    "[::]:0".parse().map_err(|e| SipError::Internal(format!("{}", e)))?
                } else {
                    "0.0.0.0:0".parse().map_err(|e| SipError::Internal(format!("{}", e)))?
                };
                let socket = UdpSocket::bind(bind_addr)
                    .await
                    .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
                let local = socket.local_addr()?;
                let socket = Arc::new(socket);

                let session = Arc::new(Session {
                    kind: options.kind,
                    link: Link::Udp(socket.clone()),
                    local,
                    remote: options.remote,
                    pending: Mutex::new(HashMap::new()),
                    active: AtomicBool::new(true),
                });
                let task = tokio::spawn(Self::udp_receive_loop(session.clone(), socket, handler));
                (session, task)
            }
            TransportKind::Tcp => {
                let stream = TcpStream::connect(options.remote).await.map_err(|e| {
                    SipError::TransportError(format!("Failed to connect to {}: {}", options.remote, e))
                })?;
                let local = stream.local_addr()?;
                let (reader, writer) = stream.into_split();

                let session = Arc::new(Session {
                    kind: options.kind,
                    link: Link::Tcp(tokio::sync::Mutex::new(writer)),
                    local,
                    remote: options.remote,
                    pending: Mutex::new(HashMap::new()),
                    active: AtomicBool::new(true),
                });
                let task = tokio::spawn(Self::tcp_receive_loop(session.clone(), reader, handler));
                (session, task)
            }
            TransportKind::Tls => {
                return Err(SipError::Configuration(
                    "TLS is not supported by the built-in transport".to_string(),
                ))
            }
        };

        info!("{} transport bound to {}", options.kind, session.local);

        let mut state = self
            .state
            .lock()
            .map_err(|_| SipError::Internal("transport state poisoned".to_string()))?;
        *state = Some((session, task));
        Ok(())
    }

    async fn stop(&self) -> Result<(), SipError> {
        let previous = self
            .state
            .lock()
            .map_err(|_| SipError::Internal("transport state poisoned".to_string()))?
            .take();

        if let Some((session, task)) = previous {
            info!("Stopping {} transport", session.kind);
            task.abort();
            session.shutdown();
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.session().is_ok()
    }

    async fn send(&self, request: SipRequest) -> Result<SipResponse, SipError> {
        let session = self.session()?;
        let request = with_via(request, &session);

        let key = request
            .transaction_key()
            .ok_or_else(|| SipError::InvalidMessage("Request without Call-ID/CSeq".to_string()))?;
        let data = request.to_bytes();

        let (tx, mut rx) = oneshot::channel();
        session
            .pending
            .lock()
            .map_err(|_| SipError::Internal("pending table poisoned".to_string()))?
            .insert(key.clone(), tx);
        let _entry = PendingEntry {
            session: &session,
            key: &key,
        };

        session.write(&data, session.remote).await?;

        let deadline = tokio::time::sleep(self.timers.timer_f());
        tokio::pin!(deadline);
        let mut interval = self.timers.t1;

        loop {
            tokio::select! {
                response = &mut rx => {
                    return response.map_err(|_| {
                        SipError::TransportError("Transport stopped before a response arrived".to_string())
                    });
                }
                _ = &mut deadline => {
                    return Err(SipError::Timeout(format!("No final response for {}", key)));
                }
                // Timer E: retransmit over unreliable links only
                _ = tokio::time::sleep(interval), if !session.is_reliable() => {
                    debug!("Retransmitting {}", key);
                    session.write(&data, session.remote).await?;
                    interval = std::cmp::min(interval * 2, self.timers.t2);
                }
            }
        }
    }

    async fn respond(&self, request: &SipRequest, response: SipResponse) -> Result<(), SipError> {
        let session = self.session()?;
        let destination = request.source.unwrap_or(session.remote);
        debug!("Responding {} to {}", response.status_code(), destination);
        session.write(&response.to_bytes(), destination).await
    }
}

/// Put a fresh top `Via` on requests that have none
fn with_via(mut request: SipRequest, session: &Session) -> SipRequest {
    if request.has_via() {
        return request;
    }

    let via = format!(
        "SIP/2.0/{} {};branch={};rport",
        session.kind.as_str(),
        session.local,
        generate_branch()
    );
    let mut headers = vec![Header::Via(via.into())];
    headers.extend(request.headers().iter().cloned());
    request.inner.headers = Headers::from(headers);
    request
}

/// ICMP errors for earlier datagrams surface on the next `recv_from` on some platforms
fn is_transient(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}

/// Split one message off a stream buffer, framed by `Content-Length`
fn next_frame(buf: &mut BytesMut) -> Option<Vec<u8>> {
    // Skip keep-alive CRLFs between messages
    let leading = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
    buf.advance(leading);

    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = String::from_utf8_lossy(&buf[..header_end]);
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            (name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l"))
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    let total = header_end + content_length;
    if buf.len() < total {
        return None;
    }
    Some(buf.split_to(total).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::{build_register_request, RegisterParams};

    struct NoopHandler;

    #[async_trait]
    impl RequestHandler for NoopHandler {
        async fn handle_request(&self, _request: SipRequest) {}
    }

    fn register() -> SipRequest {
        build_register_request(&RegisterParams {
            request_uri: "sip:127.0.0.1:5060".to_string(),
            identity_uri: "sip:alice@127.0.0.1".to_string(),
            display_name: None,
            expires: 3600,
            cseq: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_next_frame_splits_on_content_length() {
        let mut buf = BytesMut::from(
            &b"\r\n\r\nSIP/2.0 200 OK\r\nContent-Length: 4\r\n\r\nbodySIP/2.0 100 Trying\r\nl: 0\r\n\r\nSIP/2.0"[..],
        );

        let first = next_frame(&mut buf).unwrap();
        assert!(first.ends_with(b"\r\n\r\nbody"));

        let second = next_frame(&mut buf).unwrap();
        assert!(second.starts_with(b"SIP/2.0 100 Trying"));

        assert!(next_frame(&mut buf).is_none());
        assert_eq!(&buf[..], b"SIP/2.0");
    }

    #[test]
    fn test_make_response_uses_reason() {
        let transport = NetworkTransport::new();
        let response = transport
            .make_response(&register(), 503, "Service Unavailable")
            .unwrap();

        assert_eq!(response.status_code(), 503);
        assert!(response
            .inner
            .to_string()
            .starts_with("SIP/2.0 503 Service Unavailable\r\n"));
    }

    #[test]
    fn test_local_tag_is_stable() {
        assert_eq!(local_tag("abc@host"), local_tag("abc@host"));
        assert_ne!(local_tag("abc@host"), local_tag("def@host"));
    }

    #[tokio::test]
    async fn test_udp_register_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = server.local_addr().unwrap();

        let transport = NetworkTransport::new();
        transport
            .start(
                TransportOptions {
                    kind: TransportKind::Udp,
                    host: "127.0.0.1".to_string(),
                    port: remote.port(),
                    remote,
                },
                Arc::new(NoopHandler),
            )
            .await
            .unwrap();
        assert!(transport.is_active());

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let (size, source) = server.recv_from(&mut buf).await.unwrap();
            let request = SipRequest::parse(&buf[..size]).unwrap();
            assert!(request.has_via());
            let response = ResponseBuilder::ok().build_for_request(&request).unwrap();
            server.send_to(&response.to_bytes(), source).await.unwrap();
        });

        let response = transport.send(register()).await.unwrap();
        assert_eq!(response.status_code(), 200);
        server_task.await.unwrap();

        transport.stop().await.unwrap();
        assert!(!transport.is_active());
        assert!(transport.send(register()).await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_send_clears_pending_entry() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = server.local_addr().unwrap();

        let transport = NetworkTransport::new();
        transport
            .start(
                TransportOptions {
                    kind: TransportKind::Udp,
                    host: "127.0.0.1".to_string(),
                    port: remote.port(),
                    remote,
                },
                Arc::new(NoopHandler),
            )
            .await
            .unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), transport.send(register())).await;
        assert!(abandoned.is_err());

        let session = transport.session().unwrap();
        assert!(session.pending.lock().unwrap().is_empty());

        transport.stop().await.unwrap();
    }

    #[test]
    fn test_connection_reset_is_transient() {
        use std::io::{Error, ErrorKind};

        assert!(is_transient(&Error::from(ErrorKind::ConnectionReset)));
        assert!(is_transient(&Error::from(ErrorKind::ConnectionRefused)));
        assert!(!is_transient(&Error::from(ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_tls_is_rejected() {
        let transport = NetworkTransport::new();
        let result = transport
            .start(
                TransportOptions {
                    kind: TransportKind::Tls,
                    host: "127.0.0.1".to_string(),
                    port: 5061,
                    remote: "127.0.0.1:5061".parse().unwrap(),
                },
                Arc::new(NoopHandler),
            )
            .await;

        assert!(matches!(result, Err(SipError::Configuration(_))));
        assert!(!transport.is_active());
    }
}
