//! Master Session
//!
//! Game-server side of the master protocol. One driver task owns the
//! connection to the master: it registers, relays auth traffic for the
//! embedded [`RemoteAuthProvider`], applies global bans, optionally escalates
//! to admin, and reconnects with linear backoff when the connection drops.
//!
//! ```text
//!   SessionHandle ──────┐
//!   RemoteAuthProvider ─┴──► mpsc<Command> ──► driver ◄──► LineConn ◄──► master
//!                                                │
//!                                                └──► mpsc<SessionEvent> ──► caller
//! ```
//!
//! The driver only holds a weak reference to the provider, so the session
//! ends once every handle and every provider clone is dropped.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::bans::{BanList, Subnet};
use super::provider::RemoteAuthProvider;
use crate::auth::{solve, Challenge, PrivateKey, PublicKey};
use crate::network::framing::LineConn;
use crate::network::ledger::{IdCycle, Ledger};
use crate::network::protocol::{reason, Batch, PlayerStats, Reply, Request, RequestId, StatsReport};

/// Commands buffered between handles and the driver.
const COMMAND_CAPACITY: usize = 64;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Reconnect schedule. Attempt `n` waits `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Delay unit.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Identity used to escalate the session to admin.
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    /// Admin user name known to the master.
    pub name: String,
    /// Matching private key.
    pub key: PrivateKey,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Master server `host:port`.
    pub master_addr: String,
    /// Game port announced with `regserv`.
    pub listen_port: u16,
    /// Deadline for writing one line.
    pub write_timeout: Duration,
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
    /// Escalate to admin after registering.
    pub admin: Option<AdminCredentials>,
}

impl SessionConfig {
    /// Defaults for a game server on `listen_port`.
    pub fn new(master_addr: impl Into<String>, listen_port: u16) -> Self {
        Self {
            master_addr: master_addr.into(),
            listen_port,
            write_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            admin: None,
        }
    }
}

// =============================================================================
// EVENTS AND ERRORS
// =============================================================================

/// What happened on the session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The master accepted `regserv`.
    Registered,
    /// The master refused `regserv`.
    RegistrationFailed(String),
    /// Admin escalation succeeded.
    AdminGranted,
    /// Admin escalation failed. It is not retried for the rest of the session.
    AdminDenied(String),
    /// Stats for a player were stored.
    StatsAccepted {
        /// Player's auth request ID.
        request_id: RequestId,
        /// Player name.
        name: String,
    },
    /// Stats for a player were refused.
    StatsRejected {
        /// Player's auth request ID.
        request_id: RequestId,
        /// Player name.
        name: String,
        /// Why.
        reason: String,
    },
    /// The connection dropped.
    Disconnected,
    /// Waiting before a reconnect attempt.
    Reconnecting {
        /// Attempt number, from 1.
        attempt: u32,
        /// Wait before dialing.
        delay: Duration,
    },
    /// A reconnect attempt succeeded and `regserv` was resent.
    Reconnected,
    /// The session ended for good.
    Terminated(SessionError),
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Could not reach the master server.
    #[error("failed to connect to master server {addr}: {source}")]
    Connect {
        /// Master address.
        addr: String,
        /// Underlying error.
        source: io::Error,
    },
    /// Every reconnect attempt failed.
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
    /// The master could not reach the game server, so reconnecting is pointless.
    #[error("reconnecting disabled: master server failed pinging the game server")]
    ReconnectDisabled,
    /// The session task is gone.
    #[error("session closed")]
    Closed,
}

/// Admin call errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// The session is not admin.
    #[error("session is not admin")]
    NotAdmin,
    /// The connection dropped before the reply arrived.
    #[error("master server disconnected")]
    Disconnected,
    /// The master refused the request.
    #[error("rejected by master server: {0}")]
    Rejected(String),
}

type AdminReply = oneshot::Sender<Result<(), AdminError>>;

/// Work sent to the driver task.
pub(crate) enum Command {
    /// Write a line as is.
    Send(String),
    AddAuth {
        name: String,
        public_key: PublicKey,
        reply: AdminReply,
    },
    DelAuth {
        name: String,
        reply: AdminReply,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminProgress {
    Idle,
    Requested(RequestId),
    Granted,
}

enum Exit {
    Disconnected,
    Shutdown,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Caller side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    provider: Arc<RemoteAuthProvider>,
}

impl SessionHandle {
    /// Auth provider for this session's players.
    pub fn auth(&self) -> Arc<RemoteAuthProvider> {
        self.provider.clone()
    }

    /// Add a user on the master. Requires admin.
    pub async fn add_auth(&self, name: &str, public_key: &PublicKey) -> Result<(), AdminError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::AddAuth {
            name: name.to_string(),
            public_key: public_key.clone(),
            reply,
        };
        self.admin_call(command, rx).await
    }

    /// Delete a user on the master. Requires admin.
    pub async fn del_auth(&self, name: &str) -> Result<(), AdminError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::DelAuth {
            name: name.to_string(),
            reply,
        };
        self.admin_call(command, rx).await
    }

    async fn admin_call(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<(), AdminError>>,
    ) -> Result<(), AdminError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AdminError::Disconnected)?;
        rx.await.map_err(|_| AdminError::Disconnected)?
    }

    /// Submit match stats. Results arrive as [`SessionEvent::StatsAccepted`] / [`SessionEvent::StatsRejected`].
    pub async fn send_stats(&self, mode: i64, map: &str, players: Vec<PlayerStats>) -> Result<(), SessionError> {
        let request = Request::Stats(StatsReport {
            mode,
            map: map.to_string(),
            players: Batch::new(players),
        });
        self.commands
            .send(Command::Send(request.to_string()))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Close the connection and stop the session.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// Driver task state for one master session.
pub struct MasterSession {
    config: SessionConfig,
    bans: Arc<dyn BanList>,
    provider: Weak<RemoteAuthProvider>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    ids: IdCycle,
    admin: AdminProgress,
    admin_calls: Ledger<AdminReply>,
    admin_disabled: bool,
    reconnect_disabled: bool,
}

impl MasterSession {
    /// Dial the master, send `regserv`, and start the driver task.
    ///
    /// Only the first dial is reported here; later connection problems arrive
    /// as [`SessionEvent`]s.
    pub async fn connect(
        config: SessionConfig,
        bans: Arc<dyn BanList>,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events, events_rx) = mpsc::unbounded_channel();
        let provider = Arc::new(RemoteAuthProvider::new(commands_tx.clone()));

        let (conn, incoming) = dial(&config).await?;

        let session = MasterSession {
            config,
            bans,
            provider: Arc::downgrade(&provider),
            commands,
            events,
            ids: IdCycle::new(),
            admin: AdminProgress::Idle,
            admin_calls: Ledger::new(),
            admin_disabled: false,
            reconnect_disabled: false,
        };
        tokio::spawn(session.drive(conn, incoming));

        let handle = SessionHandle {
            commands: commands_tx,
            provider,
        };
        Ok((handle, events_rx))
    }

    async fn drive(mut self, mut conn: LineConn, mut incoming: mpsc::Receiver<String>) {
        loop {
            let exit = self.serve(&mut conn, &mut incoming).await;
            self.fail_pending();

            if let Exit::Shutdown = exit {
                info!("master ({}): session shut down", self.config.master_addr);
                return;
            }
            self.emit(SessionEvent::Disconnected);

            if self.reconnect_disabled {
                warn!("master ({}): not reconnecting, master cannot ping us", self.config.master_addr);
                self.emit(SessionEvent::Terminated(SessionError::ReconnectDisabled));
                return;
            }

            match self.reconnect().await {
                Some((next_conn, next_incoming)) => {
                    conn = next_conn;
                    incoming = next_incoming;
                }
                None => return,
            }
        }
    }

    async fn serve(&mut self, conn: &mut LineConn, incoming: &mut mpsc::Receiver<String>) -> Exit {
        loop {
            tokio::select! {
                line = incoming.recv() => match line {
                    Some(line) => self.handle_line(conn, &line).await,
                    None => {
                        warn!("master ({}): connection lost", self.config.master_addr);
                        return Exit::Disconnected;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) => {
                        conn.close().await;
                        return Exit::Shutdown;
                    }
                    None => {
                        debug!("master ({}): every handle dropped", self.config.master_addr);
                        conn.close().await;
                        return Exit::Shutdown;
                    }
                    Some(command) => self.handle_command(conn, command).await,
                },
            }
        }
    }

    async fn handle_line(&mut self, conn: &mut LineConn, line: &str) {
        let addr = self.config.master_addr.clone();
        let reply = match Reply::parse(line) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("master ({}): unparsable reply '{}': {}", addr, line, e);
                return;
            }
        };

        if let Some(provider) = self.provider.upgrade() {
            if provider.handle_reply(&reply) {
                return;
            }
        }

        match reply {
            Reply::SuccReg => {
                info!("master ({}): registered", addr);
                self.emit(SessionEvent::Registered);
                self.request_admin(conn).await;
            }
            Reply::FailReg { reason: why } => {
                warn!("master ({}): registration failed: {}", addr, why);
                if why == reason::FAILED_PINGING_SERVER {
                    self.reconnect_disabled = true;
                }
                self.emit(SessionEvent::RegistrationFailed(why));
            }
            Reply::ChalAdmin { request_id, challenge } => {
                self.answer_admin(conn, request_id, &challenge).await;
            }
            Reply::SuccAdmin { request_id } => {
                if self.admin == AdminProgress::Requested(request_id) {
                    info!("master ({}): admin access granted", addr);
                    self.admin = AdminProgress::Granted;
                    self.emit(SessionEvent::AdminGranted);
                } else {
                    debug!("master ({}): unexpected succadmin {}", addr, request_id);
                }
            }
            Reply::FailAdmin { request_id, reason: why } => {
                warn!("master ({}): admin request {} denied: {}", addr, request_id, why);
                self.deny_admin(why);
            }
            Reply::SuccAddAuth { request_id } | Reply::SuccDelAuth { request_id } => {
                self.resolve_admin_call(request_id, Ok(()));
            }
            Reply::FailAddAuth { request_id, reason: why } | Reply::FailDelAuth { request_id, reason: why } => {
                self.resolve_admin_call(request_id, Err(AdminError::Rejected(why)));
            }
            Reply::SuccStats { request_id, name } => {
                self.emit(SessionEvent::StatsAccepted { request_id, name });
            }
            Reply::FailStats { request_id, name, reason: why } => {
                self.emit(SessionEvent::StatsRejected {
                    request_id,
                    name,
                    reason: why,
                });
            }
            Reply::AddBan { ip } => match ip.parse::<Subnet>() {
                Ok(subnet) => {
                    let why = format!("banned by master server ({})", addr);
                    self.bans.add_global_ban(subnet, &why);
                }
                Err(e) => warn!("master ({}): ignoring addgban: {}", addr, e),
            },
            Reply::ClearBans => self.bans.clear_global_bans(),
            other => debug!("master ({}): ignoring {}", addr, other.verb()),
        }
    }

    async fn handle_command(&mut self, conn: &mut LineConn, command: Command) {
        match command {
            Command::Send(line) => {
                let _ = conn.send(line).await;
            }
            Command::AddAuth { name, public_key, reply } => {
                if let Some(request_id) = self.start_admin_call(reply) {
                    info!("master ({}): addauth {} (request {})", self.config.master_addr, name, request_id);
                    let request = Request::AddAuth {
                        request_id,
                        name,
                        public_key: public_key.to_string(),
                    };
                    let _ = conn.send(request).await;
                }
            }
            Command::DelAuth { name, reply } => {
                if let Some(request_id) = self.start_admin_call(reply) {
                    info!("master ({}): delauth {} (request {})", self.config.master_addr, name, request_id);
                    let _ = conn.send(Request::DelAuth { request_id, name }).await;
                }
            }
            Command::Shutdown => {}
        }
    }

    // =========================================================================
    // ADMIN
    // =========================================================================

    async fn request_admin(&mut self, conn: &mut LineConn) {
        if self.admin_disabled || self.admin != AdminProgress::Idle {
            return;
        }
        let Some(name) = self.config.admin.as_ref().map(|admin| admin.name.clone()) else {
            return;
        };

        let request_id = self.ids.next_id();
        self.admin = AdminProgress::Requested(request_id);
        debug!("master ({}): requesting admin as {}", self.config.master_addr, name);
        let _ = conn.send(Request::ReqAdmin { request_id, name }).await;
    }

    async fn answer_admin(&mut self, conn: &mut LineConn, request_id: RequestId, challenge: &str) {
        if self.admin != AdminProgress::Requested(request_id) {
            debug!("master ({}): unexpected chaladmin {}", self.config.master_addr, request_id);
            return;
        }

        let challenge = match challenge.parse::<Challenge>() {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!("master ({}): bad admin challenge: {}", self.config.master_addr, e);
                self.deny_admin(format!("unparsable challenge: {}", e));
                return;
            }
        };
        let Some(admin) = self.config.admin.as_ref() else {
            return;
        };

        let answer = solve(&challenge, &admin.key).to_string();
        let request = Request::ConfAdmin {
            request_id,
            answer: Some(answer),
        };
        let _ = conn.send(request).await;
    }

    fn deny_admin(&mut self, why: String) {
        self.admin = AdminProgress::Idle;
        self.admin_disabled = true;
        self.emit(SessionEvent::AdminDenied(why));
    }

    fn start_admin_call(&mut self, reply: AdminReply) -> Option<RequestId> {
        if self.admin != AdminProgress::Granted {
            let _ = reply.send(Err(AdminError::NotAdmin));
            return None;
        }
        let request_id = self.ids.next_id();
        self.admin_calls.insert(request_id, reply);
        Some(request_id)
    }

    fn resolve_admin_call(&mut self, request_id: RequestId, result: Result<(), AdminError>) {
        match self.admin_calls.take(request_id) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => debug!("master ({}): reply for unknown admin request {}", self.config.master_addr, request_id),
        }
    }

    // =========================================================================
    // RECONNECT
    // =========================================================================

    fn fail_pending(&mut self) {
        self.fail_auth_calls();
        for (_, reply) in self.admin_calls.drain() {
            let _ = reply.send(Err(AdminError::Disconnected));
        }
        self.admin = AdminProgress::Idle;
    }

    async fn reconnect(&mut self) -> Option<(LineConn, mpsc::Receiver<String>)> {
        let policy = self.config.reconnect;

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay(attempt);
            info!(
                "master ({}): reconnecting in {:?} (attempt {}/{})",
                self.config.master_addr, delay, attempt, policy.max_attempts
            );
            self.emit(SessionEvent::Reconnecting { attempt, delay });

            if !self.wait_offline(delay).await {
                info!("master ({}): shut down while reconnecting", self.config.master_addr);
                return None;
            }

            match dial(&self.config).await {
                Ok(connection) => {
                    info!("master ({}): reconnected", self.config.master_addr);
                    self.emit(SessionEvent::Reconnected);
                    return Some(connection);
                }
                Err(e) => warn!("master ({}): {}", self.config.master_addr, e),
            }
        }

        error!(
            "master ({}): giving up after {} reconnect attempts",
            self.config.master_addr, policy.max_attempts
        );
        self.emit(SessionEvent::Terminated(SessionError::ReconnectExhausted(
            policy.max_attempts,
        )));
        None
    }

    /// Sleep for `delay` while refusing commands. False on shutdown.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => return false,
                    Some(command) => self.reject_offline(command),
                },
            }
        }
    }

    fn reject_offline(&mut self, command: Command) {
        match command {
            Command::Send(line) => {
                debug!("master ({}): dropping '{}' while offline", self.config.master_addr, line);
                self.fail_auth_calls();
            }
            Command::AddAuth { reply, .. } | Command::DelAuth { reply, .. } => {
                let _ = reply.send(Err(AdminError::Disconnected));
            }
            Command::Shutdown => {}
        }
    }

    fn fail_auth_calls(&self) {
        if let Some(provider) = self.provider.upgrade() {
            provider.fail_all();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Connect, start framing, and send `regserv`.
async fn dial(config: &SessionConfig) -> Result<(LineConn, mpsc::Receiver<String>), SessionError> {
    let addr = config.master_addr.as_str();
    let connect_error = |source: io::Error| SessionError::Connect {
        addr: addr.to_string(),
        source,
    };

    let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
    let peer = stream.peer_addr().map_err(connect_error)?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("master ({}): failed to set TCP_NODELAY: {}", addr, e);
    }

    let (mut conn, incoming) = LineConn::start(stream, peer, config.write_timeout);
    info!("master ({}): connected, registering port {}", addr, config.listen_port);
    let _ = conn.send(Request::RegServ { port: config.listen_port }).await;

    Ok((conn, incoming))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_key_pair, AuthManager, AuthProvider, Authenticated, ProviderError, Role};
    use crate::client::bans::MemoryBanList;
    use crate::config::MasterConfig;
    use crate::info::fake::FakeInfo;
    use crate::network::MasterServer;
    use crate::storage::{MemoryStore, UserStore};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// One accepted connection on a scripted master.
    struct Link {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Link {
        async fn accept(listener: &TcpListener) -> Link {
            let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            let (reader, writer) = stream.into_split();
            Link {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn recv(&mut self) -> String {
            timeout(WAIT, self.lines.next_line()).await.unwrap().unwrap().unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        }
    }

    async fn scripted_master() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    async fn real_master(store: Arc<MemoryStore>) -> (Arc<MasterServer>, String) {
        let config = MasterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = Arc::new(MasterServer::new(config, store, Arc::new(FakeInfo::reachable("test"))));
        let running = server.clone();
        tokio::spawn(async move { running.run().await });
        let addr = server.local_addr().await.unwrap().to_string();
        (server, addr)
    }

    fn fast_config(addr: &str) -> SessionConfig {
        SessionConfig {
            reconnect: ReconnectPolicy {
                max_attempts: 10,
                base_delay: Duration::from_millis(1),
            },
            ..SessionConfig::new(addr, 28785)
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_backoff_grows_linearly() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(3), Duration::from_secs(90));
        for attempt in 1..policy.max_attempts {
            assert!(policy.delay(attempt) < policy.delay(attempt + 1));
        }
    }

    #[tokio::test]
    async fn test_initial_connect_failure() {
        let (listener, addr) = scripted_master().await;
        drop(listener);

        let result = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new())).await;
        assert!(matches!(result, Err(SessionError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_registers_on_connect() {
        let (listener, addr) = scripted_master().await;
        let (_handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        assert_eq!(link.recv().await, "regserv 28785");
        link.send("succreg").await;
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));
    }

    #[tokio::test]
    async fn test_ping_failure_disables_reconnect() {
        let (listener, addr) = scripted_master().await;
        let (_handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        link.recv().await;
        link.send("failreg failed pinging server").await;
        match next_event(&mut events).await {
            SessionEvent::RegistrationFailed(why) => assert_eq!(why, "failed pinging server"),
            other => panic!("unexpected {:?}", other),
        }

        drop(link);
        assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Terminated(SessionError::ReconnectDisabled)
        ));
        assert!(timeout(Duration::from_millis(100), listener.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion() {
        let (listener, addr) = scripted_master().await;
        let (_handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let link = Link::accept(&listener).await;
        drop(listener);
        drop(link);

        assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));

        let mut last_delay = Duration::ZERO;
        for expected in 1..=10 {
            match next_event(&mut events).await {
                SessionEvent::Reconnecting { attempt, delay } => {
                    assert_eq!(attempt, expected);
                    assert!(delay > last_delay);
                    last_delay = delay;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Terminated(SessionError::ReconnectExhausted(10))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_registers_again() {
        let (listener, addr) = scripted_master().await;
        let (_handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        link.recv().await;
        link.send("succreg").await;
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));
        drop(link);

        assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Reconnecting { attempt: 1, .. }
        ));

        let mut link = Link::accept(&listener).await;
        assert_eq!(link.recv().await, "regserv 28785");
        assert!(matches!(next_event(&mut events).await, SessionEvent::Reconnected));
    }

    #[tokio::test]
    async fn test_global_bans_applied() {
        let (listener, addr) = scripted_master().await;
        let bans = Arc::new(MemoryBanList::new());
        let (_handle, mut events) = MasterSession::connect(fast_config(&addr), bans.clone()).await.unwrap();

        let mut link = Link::accept(&listener).await;
        link.recv().await;
        link.send("addgban 10.1.2").await;
        link.send("addgban not-an-ip").await;
        link.send("succreg").await;
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));

        assert_eq!(bans.bans().len(), 1);
        assert!(bans.is_banned("10.1.2.200".parse().unwrap()));
        assert!(bans.bans()[0].reason.contains(&addr));

        link.send("cleargbans").await;
        link.send("succreg").await;
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));
        assert!(bans.bans().is_empty());
    }

    #[tokio::test]
    async fn test_stats_round_trip() {
        let (listener, addr) = scripted_master().await;
        let (handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        link.recv().await;

        let alice = PlayerStats {
            request_id: 3,
            name: "alice".to_string(),
            frags: 10,
            deaths: 2,
            damage: 900,
            shot_damage: 1200,
            flags: 1,
        };
        handle.send_stats(0, "complex", vec![alice]).await.unwrap();
        assert_eq!(link.recv().await, "stats 0 complex 3 alice 10 2 900 1200 1");

        link.send("succstats 3 alice").await;
        link.send("failstats 4 bob user not authenticated").await;
        match next_event(&mut events).await {
            SessionEvent::StatsAccepted { request_id, name } => assert_eq!((request_id, name.as_str()), (3, "alice")),
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut events).await {
            SessionEvent::StatsRejected { request_id, name, reason } => {
                assert_eq!(request_id, 4);
                assert_eq!(name, "bob");
                assert_eq!(reason, "user not authenticated");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admin_calls_require_admin() {
        let (listener, addr) = scripted_master().await;
        let (handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        link.recv().await;
        link.send("succreg").await;
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));

        let (_, key) = generate_key_pair().unwrap();
        assert_eq!(handle.add_auth("bob", &key).await, Err(AdminError::NotAdmin));
        assert_eq!(handle.del_auth("bob").await, Err(AdminError::NotAdmin));
    }

    #[tokio::test]
    async fn test_pending_auth_fails_on_disconnect() {
        let (listener, addr) = scripted_master().await;
        let (handle, _events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        link.recv().await;

        let provider = handle.auth();
        let pending = tokio::spawn(async move { provider.generate_challenge("alice").await });
        assert_eq!(link.recv().await, "reqauth 0 alice");
        drop(link);

        let result = timeout(WAIT, pending).await.unwrap().unwrap();
        assert_eq!(result, Err(ProviderError::Disconnected));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let (listener, addr) = scripted_master().await;
        let (handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        link.recv().await;

        handle.shutdown().await;
        let closed = timeout(WAIT, link.lines.next_line()).await.unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
        assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropping_handles_ends_session() {
        let (listener, addr) = scripted_master().await;
        let (handle, events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        assert_eq!(link.recv().await, "regserv 28785");

        drop(handle);
        drop(events);
        let closed = timeout(WAIT, link.lines.next_line()).await.unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_provider_clone_keeps_session_alive() {
        let (listener, addr) = scripted_master().await;
        let (handle, _events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();

        let mut link = Link::accept(&listener).await;
        link.recv().await;

        let provider = handle.auth();
        drop(handle);
        let pending = tokio::spawn(async move { provider.generate_challenge("alice").await });
        assert_eq!(link.recv().await, "reqauth 0 alice");
        link.send("chalauth 0 +abc").await;
        assert_eq!(timeout(WAIT, pending).await.unwrap().unwrap(), Ok((0, "+abc".to_string())));

        let closed = timeout(WAIT, link.lines.next_line()).await.unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_auth_manager_over_session() {
        let store = Arc::new(MemoryStore::new());
        let (alice_key, alice_pub) = generate_key_pair().unwrap();
        store.add_user("alice", &alice_pub, false).unwrap();
        let (server, addr) = real_master(store).await;

        let (handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));

        let manager = AuthManager::new().with_provider("", handle.auth(), Role::Auth);
        let (request_id, challenge) = manager.try_authentication("", "alice").await.unwrap();
        let answer = solve(&challenge.parse().unwrap(), &alice_key);
        assert_eq!(
            manager.check_answer(request_id, "", answer.as_str()).await,
            Ok(Authenticated {
                name: "alice".to_string(),
                role: Role::Auth
            })
        );
        assert_eq!(manager.pending_count(), 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_player_auth_through_master() {
        let store = Arc::new(MemoryStore::new());
        let (alice_key, alice_pub) = generate_key_pair().unwrap();
        store.add_user("alice", &alice_pub, false).unwrap();
        let (server, addr) = real_master(store).await;

        let (handle, mut events) = MasterSession::connect(fast_config(&addr), Arc::new(MemoryBanList::new()))
            .await
            .unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));

        let provider = handle.auth();
        let (request_id, challenge) = provider.generate_challenge("alice").await.unwrap();
        let answer = solve(&challenge.parse().unwrap(), &alice_key);
        assert_eq!(provider.confirm_answer(request_id, answer.as_str()).await, Ok(true));

        let (request_id, _) = provider.generate_challenge("alice").await.unwrap();
        assert_eq!(provider.confirm_answer(request_id, "123").await, Ok(false));

        assert!(matches!(
            provider.generate_challenge("nobody").await,
            Err(ProviderError::Rejected(_))
        ));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_admin_escalation_manages_users() {
        let store = Arc::new(MemoryStore::new());
        let (root_key, root_pub) = generate_key_pair().unwrap();
        store.add_user("root", &root_pub, false).unwrap();
        let (server, addr) = real_master(store.clone()).await;

        let config = SessionConfig {
            admin: Some(AdminCredentials {
                name: "root".to_string(),
                key: root_key,
            }),
            ..fast_config(&addr)
        };
        let (handle, mut events) = MasterSession::connect(config, Arc::new(MemoryBanList::new())).await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));
        assert!(matches!(next_event(&mut events).await, SessionEvent::AdminGranted));

        let (_, bob_pub) = generate_key_pair().unwrap();
        assert_eq!(handle.add_auth("bob", &bob_pub).await, Ok(()));
        assert!(store.user_exists("bob").unwrap());
        assert_eq!(
            handle.add_auth("bob", &bob_pub).await,
            Err(AdminError::Rejected("user already exists".to_string()))
        );

        assert_eq!(handle.del_auth("bob").await, Ok(()));
        assert!(!store.user_exists("bob").unwrap());
        assert_eq!(
            handle.del_auth("bob").await,
            Err(AdminError::Rejected("no such user".to_string()))
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_admin_denial_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let (_, root_pub) = generate_key_pair().unwrap();
        store.add_user("root", &root_pub, false).unwrap();
        let (server, addr) = real_master(store).await;

        let (wrong_key, _) = generate_key_pair().unwrap();
        let config = SessionConfig {
            admin: Some(AdminCredentials {
                name: "root".to_string(),
                key: wrong_key,
            }),
            ..fast_config(&addr)
        };
        let (_handle, mut events) = MasterSession::connect(config, Arc::new(MemoryBanList::new())).await.unwrap();

        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));
        match next_event(&mut events).await {
            SessionEvent::AdminDenied(why) => assert_eq!(why, "wrong answer"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Reconnecting { attempt: 1, .. }
        ));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Reconnected));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Registered));
        assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());

        server.shutdown();
    }
}
