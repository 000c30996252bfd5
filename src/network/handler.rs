//! Connection Handler
//!
//! One handler per accepted connection. It owns all of the connection's
//! state and processes messages strictly in arrival order.
//!
//! Trust levels:
//!
//! ```text
//!   anonymous ──regserv──► registered server
//!       │
//!       └──reqadmin/confadmin──► admin
//! ```
//!
//! Registration and admin status are independent axes. Anonymous peers may
//! only send `regserv`, `reqadmin` or `confadmin`; anything else closes the
//! connection. Player auth failures produce `fail*` replies, admin auth
//! failures close the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::framing::LineConn;
use super::ledger::Ledger;
use super::protocol::{
    reason, AuthAnswer, AuthRequest, Batch, ProtocolError, Reply, Request, RequestId, StatsReport, Verb,
};
use crate::auth::{self, Challenge, CryptoError, PublicKey, Solution};
use crate::info::{InfoError, InfoQuery};
use crate::storage::{ServerId, Store, StoreError};

// =============================================================================
// STATE
// =============================================================================

/// A challenge waiting for its answer.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Request ID chosen by the peer.
    pub request_id: RequestId,
    /// Name the challenge was issued for.
    pub name: String,
    /// Expected answer.
    pub solution: Solution,
}

/// Registration axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Registration {
    /// No successful `regserv` yet.
    #[default]
    Unregistered,
    /// Registered as this game server.
    Registered(ServerId),
}

/// Admin axis.
#[derive(Debug, Clone, Default)]
pub enum AdminStatus {
    /// No admin challenge issued.
    #[default]
    NotAdmin,
    /// Admin challenge issued, waiting for `confadmin`.
    Pending(PendingRequest),
    /// Admin authenticated for the rest of the connection.
    Admin {
        /// Admin name, used in audit logs.
        name: String,
        /// Request ID of the successful `confadmin`.
        request_id: RequestId,
    },
}

/// Everything one connection knows about its peer.
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Registration status.
    pub registration: Registration,
    /// Admin status.
    pub admin: AdminStatus,
    /// Player challenges waiting for `confauth`.
    pub pending: Ledger<PendingRequest>,
    /// Names authenticated by `confauth`, by request ID.
    pub authenticated: HashMap<RequestId, String>,
}

impl ConnectionState {
    /// Whether the peer is neither registered nor admin.
    pub fn is_anonymous(&self) -> bool {
        self.registration == Registration::Unregistered && !self.is_admin()
    }

    /// Whether the admin challenge was passed.
    pub fn is_admin(&self) -> bool {
        matches!(self.admin, AdminStatus::Admin { .. })
    }
}

/// What the read loop does after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Close the connection.
    Close,
}

#[derive(Debug, Error)]
enum ChallengeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// =============================================================================
// HANDLER
// =============================================================================

/// Drives one connection from accept to close.
pub struct ConnectionHandler {
    conn: LineConn,
    store: Arc<dyn Store>,
    info: Arc<dyn InfoQuery>,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// Create a handler for a freshly accepted connection.
    pub fn new(conn: LineConn, store: Arc<dyn Store>, info: Arc<dyn InfoQuery>) -> Self {
        Self {
            conn,
            store,
            info,
            state: ConnectionState::default(),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Process messages until the feed closes, the handler decides to close, or shutdown.
    pub async fn run(mut self, mut incoming: mpsc::Receiver<String>, mut shutdown: broadcast::Receiver<()>) {
        let peer = self.peer();

        loop {
            tokio::select! {
                message = incoming.recv() => match message {
                    Some(line) => {
                        if self.handle(&line).await == Flow::Close {
                            break;
                        }
                    }
                    None => {
                        info!("{} closed the connection", peer);
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("closing connection to {}", peer);
                    break;
                }
            }
        }

        self.conn.close().await;
    }

    /// Process one message.
    pub async fn handle(&mut self, line: &str) -> Flow {
        let peer = self.peer();
        let parsed = Request::parse(line);

        if let Err(e @ (ProtocolError::Empty | ProtocolError::MissingArguments(_))) = &parsed {
            warn!("{}: protocol violation: {}", peer, e);
            return Flow::Close;
        }

        let verb = match &parsed {
            Ok(request) => Some(request.verb()),
            Err(e) => e.verb(),
        };
        if self.state.is_anonymous()
            && !matches!(verb, Some(Verb::RegServ | Verb::ReqAdmin | Verb::ConfAdmin))
        {
            warn!("{}: unregistered peer sent disallowed message '{}'", peer, line);
            return Flow::Close;
        }

        let request = match parsed {
            Ok(request) => request,
            Err(e) => return self.handle_malformed(e).await,
        };

        match request {
            Request::RegServ { port } => self.handle_register(port).await,
            Request::ReqAuth(batch) => self.handle_request_auth(batch).await,
            Request::ConfAuth(batch) => self.handle_confirm_auth(batch).await,
            Request::Stats(report) => self.handle_stats(report).await,
            Request::Lookup { request_id, name } => self.handle_lookup(request_id, &name).await,
            Request::ReqAdmin { request_id, name } => self.handle_request_admin(request_id, name).await,
            Request::ConfAdmin { request_id, answer } => {
                self.handle_confirm_admin(request_id, answer.as_deref()).await
            }
            Request::AddAuth { request_id, name, public_key } => {
                self.handle_add_auth(request_id, &name, &public_key).await
            }
            Request::DelAuth { request_id, name } => self.handle_del_auth(request_id, &name).await,
        }
    }

    async fn handle_malformed(&mut self, e: ProtocolError) -> Flow {
        let peer = self.peer();

        match e.verb() {
            Some(Verb::RegServ) => {
                warn!("{}: {}", peer, e);
                self.reply(Reply::FailReg { reason: reason::INVALID_PORT.to_string() }).await;
                Flow::Continue
            }
            Some(Verb::Lookup | Verb::ReqAdmin | Verb::ConfAdmin) => {
                warn!("{}: {}, closing", peer, e);
                Flow::Close
            }
            Some(Verb::AddAuth | Verb::DelAuth) if self.state.is_admin() => {
                warn!("{}: {}, closing", peer, e);
                Flow::Close
            }
            Some(Verb::AddAuth | Verb::DelAuth) => {
                debug!("{}: ignoring admin command from non-admin: {}", peer, e);
                Flow::Continue
            }
            _ => {
                warn!("{}: no handler for message: {}", peer, e);
                Flow::Continue
            }
        }
    }

    // =========================================================================
    // GAME SERVER COMMANDS
    // =========================================================================

    async fn handle_register(&mut self, port: u16) -> Flow {
        let peer = self.peer();
        let game_addr = SocketAddr::new(peer.ip(), port);

        let basic = match self.info.basic_info(game_addr).await {
            Ok(basic) => basic,
            Err(e @ InfoError::InvalidAddress(_)) => {
                warn!("{}: cannot derive info address: {}", peer, e);
                self.reply(Reply::FailReg { reason: reason::FAILED_RESOLVING_IP.to_string() }).await;
                return Flow::Continue;
            }
            Err(e) => {
                warn!("{}: error querying basic info of {}: {}", peer, game_addr, e);
                self.reply(Reply::FailReg { reason: reason::FAILED_PINGING_SERVER.to_string() }).await;
                return Flow::Continue;
            }
        };

        let server_mod = match self.info.server_mod(game_addr).await {
            Ok(server_mod) => server_mod,
            Err(e) => {
                debug!("{}: could not identify server mod of {}: {}", peer, game_addr, e);
                None
            }
        };

        let id = match self
            .store
            .server_id(peer.ip(), port, &basic.description, server_mod.as_deref())
        {
            Ok(id) => id,
            Err(e) => {
                error!("{}: failed to store server {}: {}", peer, game_addr, e);
                self.reply(Reply::FailReg { reason: reason::INTERNAL_ERROR.to_string() }).await;
                return Flow::Continue;
            }
        };

        if let Err(e) = self.store.touch_server(id) {
            warn!("{}: failed to update last activity of server {}: {}", peer, id, e);
        }

        info!(
            "{}: registered game server {} ('{}', mod {})",
            peer,
            id,
            basic.description,
            server_mod.as_deref().unwrap_or("none")
        );
        self.state.registration = Registration::Registered(id);
        self.reply(Reply::SuccReg).await;
        Flow::Continue
    }

    async fn handle_request_auth(&mut self, batch: Batch<AuthRequest>) -> Flow {
        if !self.require_registration(Verb::ReqAuth) {
            return Flow::Continue;
        }
        let peer = self.peer();

        for AuthRequest { request_id, name } in batch.items {
            debug!("{}: generating challenge for '{}' (request {})", peer, name, request_id);

            match self.issue_challenge(&name) {
                Ok((challenge, solution)) => {
                    self.state.pending.insert(request_id, PendingRequest { request_id, name, solution });
                    self.reply(Reply::ChalAuth { request_id, challenge: challenge.to_string() }).await;
                }
                Err(e) => {
                    info!("{}: no challenge for '{}' (request {}): {}", peer, name, request_id, e);
                    self.reply(Reply::FailAuth { request_id }).await;
                }
            }
        }

        if let Some(e) = batch.error {
            warn!("{}: {}", peer, e);
        }
        Flow::Continue
    }

    async fn handle_confirm_auth(&mut self, batch: Batch<AuthAnswer>) -> Flow {
        if !self.require_registration(Verb::ConfAuth) {
            return Flow::Continue;
        }
        let peer = self.peer();

        for AuthAnswer { request_id, answer } in batch.items {
            match self.state.pending.take(request_id) {
                Some(pending) if pending.solution.matches(&answer) => {
                    if let Err(e) = self.store.touch_user(&pending.name) {
                        warn!("{}: failed to record authentication of '{}': {}", peer, pending.name, e);
                    }
                    info!("{}: request {} authenticated '{}'", peer, request_id, pending.name);
                    self.state.authenticated.insert(request_id, pending.name);
                    self.reply(Reply::SuccAuth { request_id }).await;
                }
                Some(pending) => {
                    info!("{}: request {} ('{}') failed: wrong answer", peer, request_id, pending.name);
                    self.reply(Reply::FailAuth { request_id }).await;
                }
                None => {
                    info!("{}: request {} failed: unknown request", peer, request_id);
                    self.reply(Reply::FailAuth { request_id }).await;
                }
            }
        }

        if let Some(e) = batch.error {
            warn!("{}: {}", peer, e);
        }
        Flow::Continue
    }

    async fn handle_stats(&mut self, report: StatsReport) -> Flow {
        let Registration::Registered(server) = self.state.registration else {
            self.require_registration(Verb::Stats);
            return Flow::Continue;
        };
        let peer = self.peer();

        let game = match self.store.add_game(server, report.mode, &report.map) {
            Ok(game) => Some(game),
            Err(e) => {
                error!("{}: failed to create game record: {}", peer, e);
                None
            }
        };
        if let Err(e) = self.store.touch_server(server) {
            warn!("{}: failed to update last activity of server {}: {}", peer, server, e);
        }

        for player in report.players.items {
            let request_id = player.request_id;
            let name = player.name.clone();

            let Some(game) = game else {
                self.reply(Reply::FailStats { request_id, name, reason: reason::INTERNAL_ERROR.to_string() })
                    .await;
                continue;
            };

            let authenticated = self.state.authenticated.get(&request_id) == Some(&name);
            if !authenticated {
                info!("{}: ignoring stats for unauthenticated '{}' (request {})", peer, name, request_id);
                self.reply(Reply::FailStats { request_id, name, reason: reason::NOT_AUTHENTICATED.to_string() })
                    .await;
                continue;
            }

            match self.store.add_stats(game, &player) {
                Ok(()) => self.reply(Reply::SuccStats { request_id, name }).await,
                Err(e) => {
                    error!("{}: failed to store stats of '{}' (request {}): {}", peer, name, request_id, e);
                    self.reply(Reply::FailStats { request_id, name, reason: reason::INTERNAL_ERROR.to_string() })
                        .await;
                }
            }
        }

        if let Some(e) = report.players.error {
            warn!("{}: {}", peer, e);
        }
        Flow::Continue
    }

    async fn handle_lookup(&mut self, request_id: RequestId, name: &str) -> Flow {
        let reply = match self.store.user_exists(name) {
            Ok(true) => Reply::SuccLookup { request_id },
            Ok(false) => Reply::FailLookup { request_id, reason: reason::NO_SUCH_USER.to_string() },
            Err(e) => {
                error!("{}: lookup of '{}' failed: {}", self.peer(), name, e);
                Reply::FailLookup { request_id, reason: reason::INTERNAL_ERROR.to_string() }
            }
        };
        self.reply(reply).await;
        Flow::Continue
    }

    // =========================================================================
    // ADMIN COMMANDS
    // =========================================================================

    async fn handle_request_admin(&mut self, request_id: RequestId, name: String) -> Flow {
        let peer = self.peer();

        if let AdminStatus::Admin { name: current, .. } = &self.state.admin {
            info!("{}: already authenticated as admin '{}', ignoring reqadmin", peer, current);
            return Flow::Continue;
        }

        match self.issue_challenge(&name) {
            Ok((challenge, solution)) => {
                debug!("{}: issued admin challenge for '{}' (request {})", peer, name, request_id);
                self.state.admin = AdminStatus::Pending(PendingRequest { request_id, name, solution });
                self.reply(Reply::ChalAdmin { request_id, challenge: challenge.to_string() }).await;
                Flow::Continue
            }
            Err(e) => {
                warn!("{}: could not challenge '{}' as admin: {}", peer, name, e);
                self.reply(Reply::FailAdmin { request_id, reason: reason::CHALLENGE_FAILED.to_string() })
                    .await;
                Flow::Close
            }
        }
    }

    async fn handle_confirm_admin(&mut self, request_id: RequestId, answer: Option<&str>) -> Flow {
        let peer = self.peer();

        if self.state.is_admin() {
            info!("{}: already admin, ignoring confadmin {}", peer, request_id);
            return Flow::Continue;
        }

        let Some(answer) = answer else {
            warn!("{}: confadmin {} without answer", peer, request_id);
            self.reply(Reply::FailAdmin { request_id, reason: reason::UNPARSABLE_SOLUTION.to_string() })
                .await;
            return Flow::Close;
        };

        match std::mem::take(&mut self.state.admin) {
            AdminStatus::Pending(pending) if pending.request_id == request_id => {
                if pending.solution.matches(answer) {
                    info!("{}: authenticated as admin '{}'", peer, pending.name);
                    self.state.admin = AdminStatus::Admin { name: pending.name, request_id };
                    self.reply(Reply::SuccAdmin { request_id }).await;
                    Flow::Continue
                } else {
                    warn!("{}: failed to authenticate as admin '{}'", peer, pending.name);
                    self.reply(Reply::FailAdmin { request_id, reason: reason::WRONG_ANSWER.to_string() })
                        .await;
                    Flow::Close
                }
            }
            _ => {
                warn!("{}: confadmin for unknown request {}", peer, request_id);
                self.reply(Reply::FailAdmin { request_id, reason: reason::UNKNOWN_REQUEST.to_string() })
                    .await;
                Flow::Close
            }
        }
    }

    async fn handle_add_auth(&mut self, request_id: RequestId, name: &str, public_key: &str) -> Flow {
        let Some((admin, admin_request)) = self.admin_identity() else {
            debug!("{}: ignoring addauth from non-admin", self.peer());
            return Flow::Continue;
        };
        let peer = self.peer();

        let key: PublicKey = match public_key.parse() {
            Ok(key) => key,
            Err(e) => {
                info!("{}: admin '{}' sent invalid public key for '{}': {}", peer, admin, name, e);
                self.reply(Reply::FailAddAuth { request_id, reason: reason::INVALID_PUBLIC_KEY.to_string() })
                    .await;
                return Flow::Continue;
            }
        };

        let reply = match self.store.add_user(name, &key, false) {
            Ok(()) => {
                info!(
                    "admin '{}' ({}, request {}) added user '{}' with key {}",
                    admin, peer, admin_request, name, key
                );
                Reply::SuccAddAuth { request_id }
            }
            Err(e) => {
                warn!("admin '{}' ({}) failed to add user '{}': {}", admin, peer, name, e);
                Reply::FailAddAuth { request_id, reason: store_reason(&e).to_string() }
            }
        };
        self.reply(reply).await;
        Flow::Continue
    }

    async fn handle_del_auth(&mut self, request_id: RequestId, name: &str) -> Flow {
        let Some((admin, admin_request)) = self.admin_identity() else {
            debug!("{}: ignoring delauth from non-admin", self.peer());
            return Flow::Continue;
        };
        let peer = self.peer();

        let reply = match self.store.delete_user(name) {
            Ok(()) => {
                info!("admin '{}' ({}, request {}) deleted user '{}'", admin, peer, admin_request, name);
                Reply::SuccDelAuth { request_id }
            }
            Err(e) => {
                warn!("admin '{}' ({}) failed to delete user '{}': {}", admin, peer, name, e);
                Reply::FailDelAuth { request_id, reason: store_reason(&e).to_string() }
            }
        };
        self.reply(reply).await;
        Flow::Continue
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn peer(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    fn require_registration(&self, verb: Verb) -> bool {
        if let Registration::Registered(_) = self.state.registration {
            return true;
        }
        info!("{}: ignoring {} from unregistered admin connection", self.peer(), verb);
        false
    }

    fn admin_identity(&self) -> Option<(String, RequestId)> {
        match &self.state.admin {
            AdminStatus::Admin { name, request_id } => Some((name.clone(), *request_id)),
            _ => None,
        }
    }

    fn issue_challenge(&self, name: &str) -> Result<(Challenge, Solution), ChallengeError> {
        let key = self.store.public_key(name)?;
        Ok(auth::generate_challenge(&key)?)
    }

    async fn reply(&mut self, reply: Reply) {
        debug!("{}: responding with {}", self.peer(), reply);
        // Failures are logged by the connection; the read side notices dead peers.
        let _ = self.conn.send(reply).await;
    }
}

/// Reply reason for a storage failure. Backend details stay in the logs.
fn store_reason(e: &StoreError) -> &'static str {
    match e {
        StoreError::NotFound => reason::NO_SUCH_USER,
        StoreError::AlreadyExists => reason::USER_EXISTS,
        StoreError::CorruptKey(_) | StoreError::Backend(_) => reason::INTERNAL_ERROR,
    }
}

// =============================================================================
// TESTS
// =============================================================================
