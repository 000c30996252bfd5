//! Remote Auth Provider
//!
//! Lets a game server authenticate its players against the master server.
//! Each call draws a request ID from an [`IdCycle`], sends the request over
//! the session's outbound channel, and waits on a oneshot that the session
//! driver resolves when the matching reply arrives.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::session::Command;
use crate::auth::{AuthProvider, ProviderError};
use crate::network::ledger::{IdCycle, Ledger};
use crate::network::protocol::{AuthAnswer, AuthRequest, Batch, Reply, Request, RequestId};

type ChallengeReply = oneshot::Sender<Result<String, ProviderError>>;
type AnswerReply = oneshot::Sender<Result<bool, ProviderError>>;

#[derive(Default)]
struct Pending {
    ids: IdCycle,
    challenges: Ledger<ChallengeReply>,
    answers: Ledger<AnswerReply>,
}

/// Auth provider backed by the master server connection.
pub struct RemoteAuthProvider {
    outbound: mpsc::Sender<Command>,
    pending: Mutex<Pending>,
}

impl RemoteAuthProvider {
    pub(crate) fn new(outbound: mpsc::Sender<Command>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Route an auth reply to its waiting caller. Returns false for replies this provider does not own.
    pub(crate) fn handle_reply(&self, reply: &Reply) -> bool {
        let mut pending = self.lock();

        match reply {
            Reply::ChalAuth { request_id, challenge } => {
                if let Some(tx) = pending.challenges.take(*request_id) {
                    let _ = tx.send(Ok(challenge.clone()));
                } else {
                    debug!("challenge for unknown request {}", request_id);
                }
            }
            Reply::SuccAuth { request_id } => {
                if let Some(tx) = pending.answers.take(*request_id) {
                    let _ = tx.send(Ok(true));
                }
            }
            Reply::FailAuth { request_id } => {
                if let Some(tx) = pending.challenges.take(*request_id) {
                    let _ = tx.send(Err(ProviderError::Rejected(*request_id)));
                } else if let Some(tx) = pending.answers.take(*request_id) {
                    let _ = tx.send(Ok(false));
                }
            }
            _ => return false,
        }
        true
    }

    /// Fail every waiting call with [`ProviderError::Disconnected`].
    pub(crate) fn fail_all(&self) {
        let mut pending = self.lock();
        for (_, tx) in pending.challenges.drain() {
            let _ = tx.send(Err(ProviderError::Disconnected));
        }
        for (_, tx) in pending.answers.drain() {
            let _ = tx.send(Err(ProviderError::Disconnected));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuthProvider for RemoteAuthProvider {
    async fn generate_challenge(&self, name: &str) -> Result<(RequestId, String), ProviderError> {
        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut pending = self.lock();
            let id = pending.ids.next_id();
            pending.challenges.insert(id, tx);
            id
        };

        let request = Request::ReqAuth(Batch::new(vec![AuthRequest {
            request_id,
            name: name.to_string(),
        }]));
        if self.outbound.send(Command::Send(request.to_string())).await.is_err() {
            self.lock().challenges.take(request_id);
            return Err(ProviderError::Disconnected);
        }

        let challenge = rx.await.map_err(|_| ProviderError::Disconnected)??;
        Ok((request_id, challenge))
    }

    async fn confirm_answer(&self, request_id: RequestId, answer: &str) -> Result<bool, ProviderError> {
        let (tx, rx) = oneshot::channel();
        self.lock().answers.insert(request_id, tx);

        let request = Request::ConfAuth(Batch::new(vec![AuthAnswer {
            request_id,
            answer: answer.to_string(),
        }]));
        if self.outbound.send(Command::Send(request.to_string())).await.is_err() {
            self.lock().answers.take(request_id);
            return Err(ProviderError::Disconnected);
        }

        rx.await.map_err(|_| ProviderError::Disconnected)?
    }
}
