//! Protocol Messages
//!
//! Wire format between game servers and the master server: one ASCII line per
//! message, `<command> <space-separated arguments>`, terminated by `\n`.
//! Numbers are base-10, names and maps are whitespace-free tokens.
//!
//! Batched requests (`reqauth`, `confauth`, `stats`) parse item by item: a
//! malformed item ends the batch, and the items before it stay valid.

use std::fmt;
use std::iter::Peekable;
use std::str::SplitAsciiWhitespace;

use thiserror::Error;

/// Caller-chosen identifier correlating a request with its reply, scoped to one connection.
pub type RequestId = u32;

/// Failure reasons carried by `fail*` replies.
pub mod reason {
    /// `regserv` port missing, zero or out of range.
    pub const INVALID_PORT: &str = "invalid port";
    /// Generic failure; storage details are never sent to peers.
    pub const INTERNAL_ERROR: &str = "internal error";
    /// Game-info address could not be derived.
    pub const FAILED_RESOLVING_IP: &str = "failed resolving ip";
    /// Game server did not answer the info query. Clients stop reconnecting on this one.
    pub const FAILED_PINGING_SERVER: &str = "failed pinging server";
    /// Stats submitted for a request without a successful `confauth` for that name.
    pub const NOT_AUTHENTICATED: &str = "user not authenticated";
    /// Admin answer did not match.
    pub const WRONG_ANSWER: &str = "wrong answer";
    /// `confadmin` for a request that is not the pending admin request.
    pub const UNKNOWN_REQUEST: &str = "unknown request";
    /// `confadmin` without an answer.
    pub const UNPARSABLE_SOLUTION: &str = "could not parse solution";
    /// Admin challenge could not be issued.
    pub const CHALLENGE_FAILED: &str = "challenge failed";
    /// Name not present in the user store.
    pub const NO_SUCH_USER: &str = "no such user";
    /// Name already present in the user store.
    pub const USER_EXISTS: &str = "user already exists";
    /// `addauth` public key did not parse.
    pub const INVALID_PUBLIC_KEY: &str = "invalid public key";
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Every command word in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// `regserv`: register a game server.
    RegServ,
    /// `succreg`: registration succeeded.
    SuccReg,
    /// `failreg`: registration failed.
    FailReg,
    /// `addgban`: propagate a ban.
    AddBan,
    /// `cleargbans`: clear the global ban list.
    ClearBans,
    /// `reqauth`: request challenges.
    ReqAuth,
    /// `chalauth`: challenge for a request.
    ChalAuth,
    /// `confauth`: answer challenges.
    ConfAuth,
    /// `succauth`: answer accepted.
    SuccAuth,
    /// `failauth`: answer rejected or no challenge issued.
    FailAuth,
    /// `stats`: submit match stats.
    Stats,
    /// `succstats`: stat line stored.
    SuccStats,
    /// `failstats`: stat line rejected.
    FailStats,
    /// `lookup`: check that a user exists.
    Lookup,
    /// `succlookup`: user exists.
    SuccLookup,
    /// `faillookup`: user missing.
    FailLookup,
    /// `reqadmin`: request an admin challenge.
    ReqAdmin,
    /// `chaladmin`: admin challenge.
    ChalAdmin,
    /// `confadmin`: answer the admin challenge.
    ConfAdmin,
    /// `succadmin`: connection upgraded to admin.
    SuccAdmin,
    /// `failadmin`: admin upgrade failed; the connection is closed.
    FailAdmin,
    /// `addauth`: add a user (admin only).
    AddAuth,
    /// `succaddauth`: user added.
    SuccAddAuth,
    /// `failaddauth`: user not added.
    FailAddAuth,
    /// `delauth`: delete a user (admin only).
    DelAuth,
    /// `succdelauth`: user deleted.
    SuccDelAuth,
    /// `faildelauth`: user not deleted.
    FailDelAuth,
}

impl Verb {
    /// All verbs, in protocol table order.
    pub const ALL: [Verb; 27] = [
        Verb::RegServ, Verb::SuccReg, Verb::FailReg, Verb::AddBan, Verb::ClearBans,
        Verb::ReqAuth, Verb::ChalAuth, Verb::ConfAuth, Verb::SuccAuth, Verb::FailAuth,
        Verb::Stats, Verb::SuccStats, Verb::FailStats,
        Verb::Lookup, Verb::SuccLookup, Verb::FailLookup,
        Verb::ReqAdmin, Verb::ChalAdmin, Verb::ConfAdmin, Verb::SuccAdmin, Verb::FailAdmin,
        Verb::AddAuth, Verb::SuccAddAuth, Verb::FailAddAuth,
        Verb::DelAuth, Verb::SuccDelAuth, Verb::FailDelAuth,
    ];

    /// Command word on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Verb::RegServ => "regserv",
            Verb::SuccReg => "succreg",
            Verb::FailReg => "failreg",
            Verb::AddBan => "addgban",
            Verb::ClearBans => "cleargbans",
            Verb::ReqAuth => "reqauth",
            Verb::ChalAuth => "chalauth",
            Verb::ConfAuth => "confauth",
            Verb::SuccAuth => "succauth",
            Verb::FailAuth => "failauth",
            Verb::Stats => "stats",
            Verb::SuccStats => "succstats",
            Verb::FailStats => "failstats",
            Verb::Lookup => "lookup",
            Verb::SuccLookup => "succlookup",
            Verb::FailLookup => "faillookup",
            Verb::ReqAdmin => "reqadmin",
            Verb::ChalAdmin => "chaladmin",
            Verb::ConfAdmin => "confadmin",
            Verb::SuccAdmin => "succadmin",
            Verb::FailAdmin => "failadmin",
            Verb::AddAuth => "addauth",
            Verb::SuccAddAuth => "succaddauth",
            Verb::FailAddAuth => "failaddauth",
            Verb::DelAuth => "delauth",
            Verb::SuccDelAuth => "succdelauth",
            Verb::FailDelAuth => "faildelauth",
        }
    }

    /// Look up a command word.
    pub fn from_wire(word: &str) -> Option<Verb> {
        Verb::ALL.iter().copied().find(|v| v.as_str() == word)
    }

    /// Whether game servers send this verb to the master server.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Verb::RegServ
                | Verb::ReqAuth
                | Verb::ConfAuth
                | Verb::Stats
                | Verb::Lookup
                | Verb::ReqAdmin
                | Verb::ConfAdmin
                | Verb::AddAuth
                | Verb::DelAuth
        )
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Blank line.
    #[error("empty message")]
    Empty,
    /// Request without an argument separator.
    #[error("no arguments in '{0}' message")]
    MissingArguments(String),
    /// Command word not in the protocol.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    /// Known command sent in the wrong direction.
    #[error("'{0}' is not accepted in this direction")]
    WrongDirection(Verb),
    /// Arguments did not parse.
    #[error("malformed {verb} message: {reason}")]
    Malformed {
        /// Command being parsed.
        verb: Verb,
        /// What was wrong.
        reason: String,
    },
}

impl ProtocolError {
    /// The verb this error belongs to, when the command word was recognised.
    pub fn verb(&self) -> Option<Verb> {
        match self {
            ProtocolError::WrongDirection(verb) => Some(*verb),
            ProtocolError::Malformed { verb, .. } => Some(*verb),
            _ => None,
        }
    }
}

/// A run of batched items, possibly cut short by a malformed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    /// Items parsed before the first error.
    pub items: Vec<T>,
    /// Error that ended the batch, if any.
    pub error: Option<ProtocolError>,
}

impl<T> Batch<T> {
    /// A complete batch.
    pub fn new(items: Vec<T>) -> Self {
        Self { items, error: None }
    }
}

/// One `(id name)` pair of a `reqauth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Request identifier.
    pub request_id: RequestId,
    /// Player name.
    pub name: String,
}

/// One `(id answer)` pair of a `confauth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAnswer {
    /// Request identifier.
    pub request_id: RequestId,
    /// Hex X coordinate computed by the player.
    pub answer: String,
}

/// One player's line in a `stats` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStats {
    /// Request ID of the player's successful `confauth`.
    pub request_id: RequestId,
    /// Player name; must match the authenticated name.
    pub name: String,
    /// Frags.
    pub frags: i64,
    /// Deaths.
    pub deaths: i64,
    /// Damage dealt.
    pub damage: i64,
    /// Potential damage of all shots fired.
    pub shot_damage: i64,
    /// Flags scored.
    pub flags: i64,
}

/// End-of-match report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    /// Game mode number.
    pub mode: i64,
    /// Map name.
    pub map: String,
    /// Per-player lines.
    pub players: Batch<PlayerStats>,
}

// =============================================================================
// GAME SERVER -> MASTER
// =============================================================================

/// Messages sent from game servers (or admin clients) to the master server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Register the sending host's game server on `port`.
    RegServ {
        /// Game port.
        port: u16,
    },
    /// Request challenges for players.
    ReqAuth(Batch<AuthRequest>),
    /// Answer challenges.
    ConfAuth(Batch<AuthAnswer>),
    /// Submit match stats.
    Stats(StatsReport),
    /// Check that a user exists.
    Lookup {
        /// Request identifier.
        request_id: RequestId,
        /// User name.
        name: String,
    },
    /// Request an admin challenge.
    ReqAdmin {
        /// Request identifier.
        request_id: RequestId,
        /// Admin name.
        name: String,
    },
    /// Answer the admin challenge.
    ConfAdmin {
        /// Request identifier.
        request_id: RequestId,
        /// Answer, `None` when missing.
        answer: Option<String>,
    },
    /// Add a user (admin only).
    AddAuth {
        /// Request identifier.
        request_id: RequestId,
        /// User name.
        name: String,
        /// Encoded public key.
        public_key: String,
    },
    /// Delete a user (admin only).
    DelAuth {
        /// Request identifier.
        request_id: RequestId,
        /// User name.
        name: String,
    },
}

impl Request {
    /// Parse one line.
    pub fn parse(line: &str) -> Result<Request, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let (command, args) = line
            .split_once(' ')
            .ok_or_else(|| ProtocolError::MissingArguments(line.to_string()))?;

        let verb = Verb::from_wire(command)
            .ok_or_else(|| ProtocolError::UnknownCommand(command.to_string()))?;
        if !verb.is_request() {
            return Err(ProtocolError::WrongDirection(verb));
        }
        let mut fields = Fields::new(verb, args);

        let request = match verb {
            Verb::RegServ => {
                let port = fields.int("port")?;
                match u16::try_from(port) {
                    Ok(port) if port > 0 => Request::RegServ { port },
                    _ => return Err(fields.malformed(format!("port {} out of range", port))),
                }
            }
            Verb::ReqAuth => Request::ReqAuth(fields.batch(|f| {
                Ok(AuthRequest {
                    request_id: f.id()?,
                    name: f.word("name")?.to_string(),
                })
            })),
            Verb::ConfAuth => Request::ConfAuth(fields.batch(|f| {
                Ok(AuthAnswer {
                    request_id: f.id()?,
                    answer: f.word("answer")?.to_string(),
                })
            })),
            Verb::Stats => {
                let mode = fields.int("mode")?;
                let map = fields.word("map")?.to_string();
                let players = fields.batch(|f| {
                    Ok(PlayerStats {
                        request_id: f.id()?,
                        name: f.word("name")?.to_string(),
                        frags: f.int("frags")?,
                        deaths: f.int("deaths")?,
                        damage: f.int("damage")?,
                        shot_damage: f.int("shot damage")?,
                        flags: f.int("flags")?,
                    })
                });
                Request::Stats(StatsReport { mode, map, players })
            }
            Verb::Lookup => Request::Lookup {
                request_id: fields.id()?,
                name: fields.word("name")?.to_string(),
            },
            Verb::ReqAdmin => Request::ReqAdmin {
                request_id: fields.id()?,
                name: fields.word("name")?.to_string(),
            },
            Verb::ConfAdmin => Request::ConfAdmin {
                request_id: fields.id()?,
                answer: fields.word("answer").ok().map(str::to_string),
            },
            Verb::AddAuth => Request::AddAuth {
                request_id: fields.id()?,
                name: fields.word("name")?.to_string(),
                public_key: fields.word("public key")?.to_string(),
            },
            Verb::DelAuth => Request::DelAuth {
                request_id: fields.id()?,
                name: fields.word("name")?.to_string(),
            },
            other => return Err(ProtocolError::WrongDirection(other)),
        };

        Ok(request)
    }

    /// Command word of this request.
    pub fn verb(&self) -> Verb {
        match self {
            Request::RegServ { .. } => Verb::RegServ,
            Request::ReqAuth(_) => Verb::ReqAuth,
            Request::ConfAuth(_) => Verb::ConfAuth,
            Request::Stats(_) => Verb::Stats,
            Request::Lookup { .. } => Verb::Lookup,
            Request::ReqAdmin { .. } => Verb::ReqAdmin,
            Request::ConfAdmin { .. } => Verb::ConfAdmin,
            Request::AddAuth { .. } => Verb::AddAuth,
            Request::DelAuth { .. } => Verb::DelAuth,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.verb())?;
        match self {
            Request::RegServ { port } => write!(f, " {}", port),
            Request::ReqAuth(batch) => {
                for item in &batch.items {
                    write!(f, " {} {}", item.request_id, item.name)?;
                }
                Ok(())
            }
            Request::ConfAuth(batch) => {
                for item in &batch.items {
                    write!(f, " {} {}", item.request_id, item.answer)?;
                }
                Ok(())
            }
            Request::Stats(report) => {
                write!(f, " {} {}", report.mode, report.map)?;
                for p in &report.players.items {
                    write!(
                        f,
                        " {} {} {} {} {} {} {}",
                        p.request_id, p.name, p.frags, p.deaths, p.damage, p.shot_damage, p.flags
                    )?;
                }
                Ok(())
            }
            Request::Lookup { request_id, name }
            | Request::ReqAdmin { request_id, name }
            | Request::DelAuth { request_id, name } => write!(f, " {} {}", request_id, name),
            Request::ConfAdmin { request_id, answer } => {
                write!(f, " {}", request_id)?;
                if let Some(answer) = answer {
                    write!(f, " {}", answer)?;
                }
                Ok(())
            }
            Request::AddAuth { request_id, name, public_key } => {
                write!(f, " {} {} {}", request_id, name, public_key)
            }
        }
    }
}

// =============================================================================
// MASTER -> GAME SERVER
// =============================================================================

/// Messages sent from the master server to game servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Registration succeeded.
    SuccReg,
    /// Registration failed.
    FailReg {
        /// Why.
        reason: String,
    },
    /// Challenge for an auth request.
    ChalAuth {
        /// Request identifier.
        request_id: RequestId,
        /// Encoded challenge point.
        challenge: String,
    },
    /// Auth answer accepted.
    SuccAuth {
        /// Request identifier.
        request_id: RequestId,
    },
    /// Auth answer rejected, or no challenge could be issued.
    FailAuth {
        /// Request identifier.
        request_id: RequestId,
    },
    /// Stat line stored.
    SuccStats {
        /// Request identifier.
        request_id: RequestId,
        /// Player name.
        name: String,
    },
    /// Stat line rejected.
    FailStats {
        /// Request identifier.
        request_id: RequestId,
        /// Player name.
        name: String,
        /// Why.
        reason: String,
    },
    /// User exists.
    SuccLookup {
        /// Request identifier.
        request_id: RequestId,
    },
    /// User does not exist or lookup failed.
    FailLookup {
        /// Request identifier.
        request_id: RequestId,
        /// Why.
        reason: String,
    },
    /// Admin challenge.
    ChalAdmin {
        /// Request identifier.
        request_id: RequestId,
        /// Encoded challenge point.
        challenge: String,
    },
    /// Connection is now an admin connection.
    SuccAdmin {
        /// Request identifier.
        request_id: RequestId,
    },
    /// Admin upgrade failed; the master closes the connection after this.
    FailAdmin {
        /// Request identifier.
        request_id: RequestId,
        /// Why.
        reason: String,
    },
    /// User added.
    SuccAddAuth {
        /// Request identifier.
        request_id: RequestId,
    },
    /// User not added.
    FailAddAuth {
        /// Request identifier.
        request_id: RequestId,
        /// Why.
        reason: String,
    },
    /// User deleted.
    SuccDelAuth {
        /// Request identifier.
        request_id: RequestId,
    },
    /// User not deleted.
    FailDelAuth {
        /// Request identifier.
        request_id: RequestId,
        /// Why.
        reason: String,
    },
    /// Ban an address or subnet.
    AddBan {
        /// Address or dotted prefix.
        ip: String,
    },
    /// Clear all global bans.
    ClearBans,
}

impl Reply {
    /// Parse one line.
    pub fn parse(line: &str) -> Result<Reply, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let (command, args) = line.split_once(' ').unwrap_or((line, ""));

        let verb = Verb::from_wire(command)
            .ok_or_else(|| ProtocolError::UnknownCommand(command.to_string()))?;
        if verb.is_request() {
            return Err(ProtocolError::WrongDirection(verb));
        }
        let mut fields = Fields::new(verb, args);

        let reply = match verb {
            Verb::SuccReg => Reply::SuccReg,
            Verb::FailReg => Reply::FailReg { reason: fields.rest() },
            Verb::ChalAuth => Reply::ChalAuth {
                request_id: fields.id()?,
                challenge: fields.word("challenge")?.to_string(),
            },
            Verb::SuccAuth => Reply::SuccAuth { request_id: fields.id()? },
            Verb::FailAuth => Reply::FailAuth { request_id: fields.id()? },
            Verb::SuccStats => Reply::SuccStats {
                request_id: fields.id()?,
                name: fields.word("name").map(str::to_string).unwrap_or_default(),
            },
            Verb::FailStats => Reply::FailStats {
                request_id: fields.id()?,
                name: fields.word("name")?.to_string(),
                reason: fields.rest(),
            },
            Verb::SuccLookup => Reply::SuccLookup { request_id: fields.id()? },
            Verb::FailLookup => Reply::FailLookup {
                request_id: fields.id()?,
                reason: fields.rest(),
            },
            Verb::ChalAdmin => Reply::ChalAdmin {
                request_id: fields.id()?,
                challenge: fields.word("challenge")?.to_string(),
            },
            Verb::SuccAdmin => Reply::SuccAdmin { request_id: fields.id()? },
            Verb::FailAdmin => Reply::FailAdmin {
                request_id: fields.id()?,
                reason: fields.rest(),
            },
            Verb::SuccAddAuth => Reply::SuccAddAuth { request_id: fields.id()? },
            Verb::FailAddAuth => Reply::FailAddAuth {
                request_id: fields.id()?,
                reason: fields.rest(),
            },
            Verb::SuccDelAuth => Reply::SuccDelAuth { request_id: fields.id()? },
            Verb::FailDelAuth => Reply::FailDelAuth {
                request_id: fields.id()?,
                reason: fields.rest(),
            },
            Verb::AddBan => Reply::AddBan {
                ip: fields.word("ip")?.to_string(),
            },
            Verb::ClearBans => Reply::ClearBans,
            other => return Err(ProtocolError::WrongDirection(other)),
        };

        Ok(reply)
    }

    /// Command word of this reply.
    pub fn verb(&self) -> Verb {
        match self {
            Reply::SuccReg => Verb::SuccReg,
            Reply::FailReg { .. } => Verb::FailReg,
            Reply::ChalAuth { .. } => Verb::ChalAuth,
            Reply::SuccAuth { .. } => Verb::SuccAuth,
            Reply::FailAuth { .. } => Verb::FailAuth,
            Reply::SuccStats { .. } => Verb::SuccStats,
            Reply::FailStats { .. } => Verb::FailStats,
            Reply::SuccLookup { .. } => Verb::SuccLookup,
            Reply::FailLookup { .. } => Verb::FailLookup,
            Reply::ChalAdmin { .. } => Verb::ChalAdmin,
            Reply::SuccAdmin { .. } => Verb::SuccAdmin,
            Reply::FailAdmin { .. } => Verb::FailAdmin,
            Reply::SuccAddAuth { .. } => Verb::SuccAddAuth,
            Reply::FailAddAuth { .. } => Verb::FailAddAuth,
            Reply::SuccDelAuth { .. } => Verb::SuccDelAuth,
            Reply::FailDelAuth { .. } => Verb::FailDelAuth,
            Reply::AddBan { .. } => Verb::AddBan,
            Reply::ClearBans => Verb::ClearBans,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.verb())?;
        match self {
            Reply::SuccReg | Reply::ClearBans => Ok(()),
            Reply::FailReg { reason } => write_reason(f, reason),
            Reply::ChalAuth { request_id, challenge }
            | Reply::ChalAdmin { request_id, challenge } => {
                write!(f, " {} {}", request_id, challenge)
            }
            Reply::SuccAuth { request_id }
            | Reply::FailAuth { request_id }
            | Reply::SuccLookup { request_id }
            | Reply::SuccAdmin { request_id }
            | Reply::SuccAddAuth { request_id }
            | Reply::SuccDelAuth { request_id } => write!(f, " {}", request_id),
            Reply::SuccStats { request_id, name } => write!(f, " {} {}", request_id, name),
            Reply::FailStats { request_id, name, reason } => {
                write!(f, " {} {}", request_id, name)?;
                write_reason(f, reason)
            }
            Reply::FailLookup { request_id, reason }
            | Reply::FailAdmin { request_id, reason }
            | Reply::FailAddAuth { request_id, reason }
            | Reply::FailDelAuth { request_id, reason } => {
                write!(f, " {}", request_id)?;
                write_reason(f, reason)
            }
            Reply::AddBan { ip } => write!(f, " {}", ip),
        }
    }
}

fn write_reason(f: &mut fmt::Formatter<'_>, reason: &str) -> fmt::Result {
    if reason.is_empty() {
        Ok(())
    } else {
        write!(f, " {}", reason)
    }
}

// =============================================================================
// FIELD SCANNER
// =============================================================================

/// Whitespace tokenizer over the argument part of a message.
struct Fields<'a> {
    verb: Verb,
    tokens: Peekable<SplitAsciiWhitespace<'a>>,
}

impl<'a> Fields<'a> {
    fn new(verb: Verb, args: &'a str) -> Self {
        Self {
            verb,
            tokens: args.split_ascii_whitespace().peekable(),
        }
    }

    fn malformed(&self, reason: String) -> ProtocolError {
        ProtocolError::Malformed { verb: self.verb, reason }
    }

    fn word(&mut self, what: &str) -> Result<&'a str, ProtocolError> {
        self.tokens
            .next()
            .ok_or_else(|| self.malformed(format!("missing {}", what)))
    }

    fn int(&mut self, what: &str) -> Result<i64, ProtocolError> {
        let token = self.word(what)?;
        token
            .parse()
            .map_err(|_| self.malformed(format!("invalid {} '{}'", what, token)))
    }

    fn id(&mut self) -> Result<RequestId, ProtocolError> {
        let token = self.word("request id")?;
        token
            .parse()
            .map_err(|_| self.malformed(format!("invalid request id '{}'", token)))
    }

    fn rest(&mut self) -> String {
        self.tokens.by_ref().collect::<Vec<_>>().join(" ")
    }

    fn batch<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ProtocolError>,
    ) -> Batch<T> {
        let mut items = Vec::new();
        while self.tokens.peek().is_some() {
            match item(self) {
                Ok(value) => items.push(value),
                Err(e) => return Batch { items, error: Some(e) },
            }
        }
        Batch::new(items)
    }
}

// =============================================================================
// TESTS
// =============================================================================
