//! Network Layer
//!
//! Server role of the master protocol: line framing, the wire messages,
//! per-connection request correlation, the connection state machine, and
//! the accept loop.

pub mod framing;
pub mod handler;
pub mod ledger;
pub mod protocol;
pub mod server;

pub use framing::{FramingError, LineConn, MAX_LINE_LEN};
pub use handler::{AdminStatus, ConnectionHandler, ConnectionState, Flow, PendingRequest, Registration};
pub use ledger::{IdCycle, Ledger};
pub use protocol::{ProtocolError, Reply, Request, RequestId, Verb};
pub use server::{MasterServer, MasterServerError};
