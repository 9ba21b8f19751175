//! SIP registration state machine
//!
//! [`SipManager`] is a cheap handle. The state lives in a single task that
//! owns the configuration, timers and the registration session, and
//! processes commands one at a time. Every asynchronous continuation comes
//! back to that task as a command tagged with the generation it was issued
//! under; a `start()` or `stop()` advances the generation, so anything issued
//! before it is dropped on arrival.

use super::health::{spawn_supervisor, HealthReport};
use super::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectScheduler};
use crate::config::{SipAccountConfig, TimerConfig};
use crate::domain::incoming_call::IncomingCall;
use crate::domain::registration::{
    ConnectionState, RegistrationSession, StatusEvent, StatusMeta, REASON_MISSING_CREDENTIALS,
    REASON_STOPPED,
};
use crate::domain::shared::DomainError;
use crate::infrastructure::dns::{probe, RegistrarAddress, Resolver, SystemResolver};
use crate::infrastructure::protocols::sip::{
    reregister_delay, RegistrationController, RegistrationOutcome, RegistrationVerdict,
    RequestDispatcher, SipError, Transport, TransportOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Cause of the `error` transition after the last reconnect attempt
pub const CAUSE_RECONNECT_EXHAUSTED: &str = "Reconnection failed after multiple attempts";
pub const CAUSE_CONNECTION_TIMEOUT: &str = "Connection timeout";

/// Setup failures, reported as an `error` transition
#[derive(Error, Debug)]
enum SetupError {
    #[error(transparent)]
    Config(#[from] DomainError),

    #[error(transparent)]
    Transport(#[from] SipError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOrigin {
    /// `start()` or `update_config()`
    User,
    /// The reconnect timer fired
    Reconnect,
    /// REGISTER found the transport gone
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reregister,
    ConnectionTimeout,
    Reconnect,
}

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    UpdateConfig(Box<SipAccountConfig>, oneshot::Sender<()>),
    ExchangeFinished {
        generation: u64,
        exchange: u64,
        outcome: RegistrationOutcome,
    },
    TimerFired {
        generation: u64,
        kind: TimerKind,
        token: u64,
    },
}

/// A spawned task that is aborted when dropped
struct Armed {
    token: u64,
    handle: JoinHandle<()>,
}

impl Drop for Armed {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Core fields the handle reads without a round trip
#[derive(Debug, Clone, Default)]
struct Snapshot {
    has_credentials: bool,
    dispatcher_registered: bool,
    reregister_armed: bool,
    reconnect_scheduled: bool,
}

/// Handle to the registration state machine of one SIP identity
#[derive(Clone)]
pub struct SipManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    snapshot: watch::Receiver<Snapshot>,
    transport: Arc<dyn Transport>,
    status: broadcast::Sender<StatusEvent>,
    calls: broadcast::Sender<IncomingCall>,
    health_armed: Arc<AtomicBool>,
}

impl SipManager {
    /// Create a manager resolving the registrar through the system resolver.
    ///
    /// Must be called inside a Tokio runtime. Nothing happens until `start()`.
    pub fn new(account: SipAccountConfig, timers: TimerConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_resolver(account, timers, transport, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        account: SipAccountConfig,
        timers: TimerConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let (snapshot_tx, snapshot) = watch::channel(Snapshot {
            has_credentials: account.has_credentials(),
            ..Default::default()
        });
        let (status, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (calls, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let core = Core {
            reconnect: ReconnectScheduler::new(ReconnectPolicy::from_timers(&timers)),
            account,
            timers,
            transport: transport.clone(),
            resolver,
            state: state_tx,
            snapshot: snapshot_tx,
            status: status.clone(),
            calls: calls.clone(),
            commands: commands.downgrade(),
            generation: 0,
            next_token: 0,
            session: None,
            controller: None,
            dispatcher_registered: false,
            exchange: None,
            reregister: None,
            connection_timeout: None,
            reconnect_timer: None,
        };
        tokio::spawn(core.run(receiver));

        Self {
            commands,
            state,
            snapshot,
            transport,
            status,
            calls,
            health_armed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restart registration from scratch.
    ///
    /// Returns once setup is over: the state is then `registering`, or
    /// `idle`/`error` if setup failed.
    pub async fn start(&self) {
        self.request(Command::Start).await;
    }

    /// Tear everything down and go `idle`. Safe in any state.
    pub async fn stop(&self) {
        self.request(Command::Stop).await;
    }

    /// Replace the configuration and restart
    pub async fn update_config(&self, account: SipAccountConfig) {
        self.request(|done| Command::UpdateConfig(Box::new(account), done))
            .await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn check_health(&self) -> HealthReport {
        let snapshot = self.snapshot.borrow().clone();
        HealthReport::new(
            self.state(),
            self.transport.is_active(),
            snapshot.has_credentials,
            snapshot.dispatcher_registered,
            snapshot.reregister_armed,
            snapshot.reconnect_scheduled,
        )
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<IncomingCall> {
        self.calls.subscribe()
    }

    /// Arm the process-wide health check. Only the first call has an effect.
    pub fn spawn_health_check(&self, interval: Duration) -> Option<JoinHandle<()>> {
        if self.health_armed.swap(true, Ordering::SeqCst) {
            warn!("Health check already running");
            return None;
        }
        info!("Health check every {:?}", interval);
        Some(spawn_supervisor(self.clone(), interval))
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(command(done)).is_err() {
            error!("SIP manager task is gone");
            return;
        }
        if wait.await.is_err() {
            error!("SIP manager task dropped a request");
        }
    }
}

/// State owned by the manager task
struct Core {
    account: SipAccountConfig,
    timers: TimerConfig,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn Resolver>,
    state: watch::Sender<ConnectionState>,
    snapshot: watch::Sender<Snapshot>,
    status: broadcast::Sender<StatusEvent>,
    calls: broadcast::Sender<IncomingCall>,
    commands: mpsc::WeakUnboundedSender<Command>,
    generation: u64,
    next_token: u64,
    session: Option<RegistrationSession>,
    controller: Option<Arc<RegistrationController>>,
    dispatcher_registered: bool,
    /// REGISTER exchange in flight
    exchange: Option<Armed>,
    reregister: Option<Armed>,
    connection_timeout: Option<Armed>,
    reconnect_timer: Option<Armed>,
    reconnect: ReconnectScheduler,
}

impl Core {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Start(done) => {
                    self.reconnect.reset();
                    self.start(StartOrigin::User).await;
                    let _ = done.send(());
                }
                Command::Stop(done) => {
                    self.stop().await;
                    let _ = done.send(());
                }
                Command::UpdateConfig(account, done) => {
                    info!("Configuration updated: {:?}", account);
                    self.account = *account;
                    self.session = None;
                    self.reconnect.reset();
                    self.start(StartOrigin::User).await;
                    let _ = done.send(());
                }
                Command::ExchangeFinished {
                    generation,
                    exchange,
                    outcome,
                } => self.on_exchange_finished(generation, exchange, outcome).await,
                Command::TimerFired {
                    generation,
                    kind,
                    token,
                } => self.on_timer(generation, kind, token).await,
            }
            self.publish_snapshot();
        }

        debug!("All SIP manager handles dropped, shutting down");
        self.teardown().await;
    }

    async fn start(&mut self, origin: StartOrigin) {
        if let Err(e) = self.try_start().await {
            error!("SIP setup failed: {}", e);
            self.transition(ConnectionState::Error, Some(StatusMeta::cause(e.to_string())));

            // A reconnect whose own setup fails keeps backing off
            if origin == StartOrigin::Reconnect && matches!(e, SetupError::Transport(_)) {
                self.on_fatal_failure();
            }
        }
    }

    async fn try_start(&mut self) -> Result<(), SetupError> {
        self.teardown().await;
        tokio::time::sleep(self.timers.settle_delay()).await;

        if !self.account.has_credentials() {
            info!("SIP account incomplete, not registering");
            self.transition(
                ConnectionState::Idle,
                Some(StatusMeta::cause(REASON_MISSING_CREDENTIALS)),
            );
            return Ok(());
        }

        let registrar = RegistrarAddress::parse(&self.account.server, self.account.port)
            .ok_or_else(|| DomainError::InvalidServerAddress(self.account.server.clone()))?;
        let controller = RegistrationController::new(
            self.transport.clone(),
            &self.account,
            &registrar,
            self.timers.register_expires_secs,
        )?;

        let reachability = probe(self.resolver.as_ref(), &registrar, self.timers.dns_timeout()).await;
        let remote = match reachability.addresses.first() {
            Some(remote) if reachability.reachable => *remote,
            _ => {
                let cause = reachability
                    .error
                    .unwrap_or_else(|| format!("Server {} is not reachable", registrar.hostname));
                warn!("{}", cause);
                // No reconnect here, unlike REGISTER failures
                self.transition(ConnectionState::Error, Some(StatusMeta::cause(cause)));
                return Ok(());
            }
        };

        let dispatcher = Arc::new(RequestDispatcher::new(
            self.transport.clone(),
            self.state.subscribe(),
            self.calls.clone(),
            self.timers.busy_delay(),
        ));
        let options = TransportOptions {
            kind: self.account.transport,
            host: registrar.hostname.clone(),
            port: registrar.port,
            remote,
        };
        self.transport.start(options, dispatcher).await?;
        self.dispatcher_registered = true;

        self.controller = Some(Arc::new(controller));

        self.transition(ConnectionState::Registering, None);
        self.begin_exchange();
        Ok(())
    }

    async fn stop(&mut self) {
        self.teardown().await;
        self.session = None;
        self.reconnect.reset();
        self.transition(ConnectionState::Idle, Some(StatusMeta::cause(REASON_STOPPED)));
    }

    /// Drop timers, the exchange in flight and the transport
    async fn teardown(&mut self) {
        self.generation += 1;
        self.exchange = None;
        self.reregister = None;
        self.connection_timeout = None;
        self.reconnect_timer = None;
        self.reconnect.clear_pending();
        self.controller = None;
        self.dispatcher_registered = false;

        if self.transport.is_active() {
            if let Err(e) = self.transport.stop().await {
                warn!("Failed to stop transport: {}", e);
            }
        }
        debug!("Torn down, generation {}", self.generation);
    }

    /// Spawn one REGISTER exchange, bounded by the connection timeout
    fn begin_exchange(&mut self) {
        let Some(controller) = self.controller.clone() else {
            debug!("No registration controller, skipping REGISTER");
            return;
        };
        if self.exchange.is_some() {
            debug!("REGISTER already in flight");
            return;
        }

        let token = self.token();
        let generation = self.generation;
        let session = self.session.clone();
        let commands = self.commands.clone();

        let handle = tokio::spawn(async move {
            let outcome = controller.register(session).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::ExchangeFinished {
                    generation,
                    exchange: token,
                    outcome,
                });
            }
        });
        self.exchange = Some(Armed { token, handle });
        self.connection_timeout =
            Some(self.arm_timer(TimerKind::ConnectionTimeout, self.timers.connection_timeout()));
    }

    async fn on_exchange_finished(&mut self, generation: u64, exchange: u64, outcome: RegistrationOutcome) {
        if generation != self.generation || !is_current(&self.exchange, exchange) {
            debug!("Ignoring stale REGISTER outcome {:?}", outcome.verdict);
            return;
        }
        self.exchange = None;

        if let Some(realm) = outcome.realm {
            self.session = Some(RegistrationSession::new(realm));
        }

        match outcome.verdict {
            RegistrationVerdict::Registered { expires } => {
                self.connection_timeout = None;
                self.reconnect.reset();

                let delay = reregister_delay(expires, Duration::from_secs(self.timers.min_reregister_secs));
                info!("Registered for {}s, refreshing in {:?}", expires, delay);
                self.reregister = Some(self.arm_timer(TimerKind::Reregister, delay));

                let refreshed = *self.state.borrow() == ConnectionState::Registered;
                if !refreshed {
                    self.transition(ConnectionState::Registered, None);
                }
            }
            RegistrationVerdict::Failed(meta) => {
                self.connection_timeout = None;
                self.reregister = None;
                self.transition(ConnectionState::Error, Some(meta));
                self.on_fatal_failure();
            }
            RegistrationVerdict::TransportInactive => {
                info!("Transport lost, restarting");
                self.start(StartOrigin::Recovery).await;
            }
        }
    }

    async fn on_timer(&mut self, generation: u64, kind: TimerKind, token: u64) {
        if generation != self.generation {
            return;
        }
        let slot = match kind {
            TimerKind::Reregister => &mut self.reregister,
            TimerKind::ConnectionTimeout => &mut self.connection_timeout,
            TimerKind::Reconnect => &mut self.reconnect_timer,
        };
        if !is_current(slot, token) {
            debug!("Ignoring cleared {:?} timer", kind);
            return;
        }
        *slot = None;

        match kind {
            TimerKind::Reregister => {
                debug!("Re-registration due");
                self.begin_exchange();
            }
            TimerKind::ConnectionTimeout => {
                warn!("No REGISTER verdict within {:?}", self.timers.connection_timeout());
                self.exchange = None;
                self.reregister = None;
                self.transition(
                    ConnectionState::Error,
                    Some(StatusMeta::cause(CAUSE_CONNECTION_TIMEOUT)),
                );
                self.on_fatal_failure();
            }
            TimerKind::Reconnect => {
                self.reconnect.clear_pending();
                info!("Reconnecting (attempt {})", self.reconnect.failures() + 1);
                self.start(StartOrigin::Reconnect).await;
            }
        }
    }

    fn on_fatal_failure(&mut self) {
        match self.reconnect.on_failure() {
            ReconnectDecision::Schedule { attempt, delay } => {
                info!("Reconnect {} scheduled in {:?}", attempt, delay);
                self.reconnect_timer = Some(self.arm_timer(TimerKind::Reconnect, delay));
            }
            ReconnectDecision::AlreadyPending => debug!("Reconnect already scheduled"),
            ReconnectDecision::Exhausted => {
                warn!("Giving up after {} failures", self.reconnect.failures());
                self.transition(
                    ConnectionState::Error,
                    Some(StatusMeta::cause(CAUSE_RECONNECT_EXHAUSTED)),
                );
            }
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, delay: Duration) -> Armed {
        let token = self.token();
        let generation = self.generation;
        let commands = self.commands.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::TimerFired {
                    generation,
                    kind,
                    token,
                });
            }
        });
        Armed { token, handle }
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn transition(&mut self, state: ConnectionState, meta: Option<StatusMeta>) {
        let previous = self.state.send_replace(state);
        match meta.as_ref().and_then(|meta| meta.cause.as_deref()) {
            Some(cause) => info!("SIP state {} -> {} ({})", previous, state, cause),
            None => info!("SIP state {} -> {}", previous, state),
        }

        if self.status.send(StatusEvent::new(state, meta)).is_err() {
            debug!("No status subscribers");
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(Snapshot {
            has_credentials: self.account.has_credentials(),
            dispatcher_registered: self.dispatcher_registered,
            reregister_armed: self.reregister.is_some(),
            reconnect_scheduled: self.reconnect.is_pending(),
        });
    }
}

fn is_current(slot: &Option<Armed>, token: u64) -> bool {
    slot.as_ref().map(|armed| armed.token == token).unwrap_or(false)
}
