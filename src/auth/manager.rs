//! Auth Manager
//!
//! A game server may accept players from several auth domains. Each domain
//! has its own [`AuthProvider`] and grants a fixed [`Role`] on success. The
//! empty domain is the master server's.
//!
//! A request ID is remembered between [`AuthManager::try_authentication`] and
//! [`AuthManager::check_answer`] and consumed by the first answer, right or
//! wrong.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::network::protocol::RequestId;

/// Provider errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider's backend went away before the reply arrived.
    #[error("auth provider disconnected")]
    Disconnected,
    /// The provider refused to issue a challenge (unknown name).
    #[error("request {0} rejected by auth provider")]
    Rejected(RequestId),
}

/// Issues challenges and checks answers for one auth domain.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Challenge `name`. Returns the provider's request ID and the encoded challenge.
    async fn generate_challenge(&self, name: &str) -> Result<(RequestId, String), ProviderError>;

    /// Whether `answer` solves the challenge issued under `request_id`.
    async fn confirm_answer(&self, request_id: RequestId, answer: &str) -> Result<bool, ProviderError>;
}

/// Privilege a successful authentication grants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Role {
    /// No privilege.
    #[default]
    None,
    /// Game master.
    Master,
    /// Authenticated player.
    Auth,
    /// Server admin.
    Admin,
}

/// A player who answered correctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// Name the challenge was issued for.
    pub name: String,
    /// Role of the domain.
    pub role: Role,
}

/// Auth manager errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthManagerError {
    /// No provider is configured for the domain.
    #[error("no auth provider for domain '{0}'")]
    NoProvider(String),
    /// The request was never issued or was already answered.
    #[error("unknown auth request {0}")]
    UnknownRequest(RequestId),
    /// The provider rejected the answer.
    #[error("wrong answer for auth request {0}")]
    WrongAnswer(RequestId),
    /// The provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Routes authentication to providers by domain.
#[derive(Default)]
pub struct AuthManager {
    providers: HashMap<String, Arc<dyn AuthProvider>>,
    roles: HashMap<String, Role>,
    pending: Mutex<HashMap<(String, RequestId), String>>,
}

impl AuthManager {
    /// Manager without providers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `domain` with `provider`, granting `role` on success.
    pub fn with_provider(mut self, domain: impl Into<String>, provider: Arc<dyn AuthProvider>, role: Role) -> Self {
        let domain = domain.into();
        self.roles.insert(domain.clone(), role);
        self.providers.insert(domain, provider);
        self
    }

    /// Start authenticating `name` in `domain`. Returns the request ID and challenge to send to the player.
    pub async fn try_authentication(&self, domain: &str, name: &str) -> Result<(RequestId, String), AuthManagerError> {
        let provider = self.provider(domain)?;
        let (request_id, challenge) = provider.generate_challenge(name).await?;

        debug!("auth: challenged '{}' in domain '{}' (request {})", name, domain, request_id);
        self.lock().insert((domain.to_string(), request_id), name.to_string());
        Ok((request_id, challenge))
    }

    /// Check a player's answer. The request is consumed whatever the outcome.
    pub async fn check_answer(
        &self,
        request_id: RequestId,
        domain: &str,
        answer: &str,
    ) -> Result<Authenticated, AuthManagerError> {
        let provider = self.provider(domain)?;
        let name = self
            .lock()
            .remove(&(domain.to_string(), request_id))
            .ok_or(AuthManagerError::UnknownRequest(request_id))?;

        if !provider.confirm_answer(request_id, answer).await? {
            info!("auth: '{}' failed in domain '{}' (request {})", name, domain, request_id);
            return Err(AuthManagerError::WrongAnswer(request_id));
        }

        let role = self.roles.get(domain).copied().unwrap_or_default();
        info!("auth: '{}' authenticated in domain '{}' as {:?}", name, domain, role);
        Ok(Authenticated { name, role })
    }

    /// Challenges waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn provider(&self, domain: &str) -> Result<Arc<dyn AuthProvider>, AuthManagerError> {
        self.providers
            .get(domain)
            .cloned()
            .ok_or_else(|| AuthManagerError::NoProvider(domain.to_string()))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, RequestId), String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_challenge, generate_key_pair, solve, PrivateKey, PublicKey, Solution};
    use crate::network::ledger::{IdCycle, Ledger};

    /// Provider over an in-memory key table.
    #[derive(Default)]
    struct LocalProvider {
        keys: HashMap<String, PublicKey>,
        state: Mutex<(IdCycle, Ledger<Solution>)>,
    }

    impl LocalProvider {
        fn with_user(name: &str) -> (Arc<Self>, PrivateKey) {
            let (private, public) = generate_key_pair().unwrap();
            let mut provider = LocalProvider::default();
            provider.keys.insert(name.to_string(), public);
            (Arc::new(provider), private)
        }
    }

    #[async_trait]
    impl AuthProvider for LocalProvider {
        async fn generate_challenge(&self, name: &str) -> Result<(RequestId, String), ProviderError> {
            let mut state = self.state.lock().unwrap();
            let request_id = state.0.next_id();
            let public = self.keys.get(name).ok_or(ProviderError::Rejected(request_id))?;
            let (challenge, solution) = generate_challenge(public).unwrap();
            state.1.insert(request_id, solution);
            Ok((request_id, challenge.to_string()))
        }

        async fn confirm_answer(&self, request_id: RequestId, answer: &str) -> Result<bool, ProviderError> {
            let solution = self.state.lock().unwrap().1.take(request_id);
            Ok(solution.is_some_and(|solution| solution.matches(answer)))
        }
    }

    fn answer(challenge: &str, key: &PrivateKey) -> String {
        solve(&challenge.parse().unwrap(), key).to_string()
    }

    #[tokio::test]
    async fn test_domain_decides_role() {
        let (players, alice) = LocalProvider::with_user("alice");
        let (admins, root) = LocalProvider::with_user("root");
        let manager = AuthManager::new()
            .with_provider("", players, Role::Auth)
            .with_provider("admins", admins, Role::Admin);

        let (id, challenge) = manager.try_authentication("", "alice").await.unwrap();
        let result = manager.check_answer(id, "", &answer(&challenge, &alice)).await.unwrap();
        assert_eq!(result, Authenticated { name: "alice".to_string(), role: Role::Auth });

        let (id, challenge) = manager.try_authentication("admins", "root").await.unwrap();
        let result = manager.check_answer(id, "admins", &answer(&challenge, &root)).await.unwrap();
        assert_eq!(result.role, Role::Admin);
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let manager = AuthManager::new();
        assert_eq!(
            manager.try_authentication("elsewhere", "alice").await,
            Err(AuthManagerError::NoProvider("elsewhere".to_string()))
        );
        assert_eq!(
            manager.check_answer(0, "elsewhere", "123").await,
            Err(AuthManagerError::NoProvider("elsewhere".to_string()))
        );
    }

    #[tokio::test]
    async fn test_answer_consumes_request() {
        let (players, alice) = LocalProvider::with_user("alice");
        let manager = AuthManager::new().with_provider("", players, Role::Auth);

        let (id, challenge) = manager.try_authentication("", "alice").await.unwrap();
        assert_eq!(manager.pending_count(), 1);

        let correct = answer(&challenge, &alice);
        assert!(manager.check_answer(id, "", &correct).await.is_ok());
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(
            manager.check_answer(id, "", &correct).await,
            Err(AuthManagerError::UnknownRequest(id))
        );
    }

    #[tokio::test]
    async fn test_wrong_answer_consumes_request() {
        let (players, _) = LocalProvider::with_user("alice");
        let manager = AuthManager::new().with_provider("", players, Role::Auth);

        let (id, _) = manager.try_authentication("", "alice").await.unwrap();
        assert_eq!(manager.check_answer(id, "", "123").await, Err(AuthManagerError::WrongAnswer(id)));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_is_scoped_to_domain() {
        let (players, alice) = LocalProvider::with_user("alice");
        let (admins, _) = LocalProvider::with_user("root");
        let manager = AuthManager::new()
            .with_provider("", players, Role::Auth)
            .with_provider("admins", admins, Role::Admin);

        let (id, challenge) = manager.try_authentication("", "alice").await.unwrap();
        let correct = answer(&challenge, &alice);
        assert_eq!(
            manager.check_answer(id, "admins", &correct).await,
            Err(AuthManagerError::UnknownRequest(id))
        );
        assert!(manager.check_answer(id, "", &correct).await.is_ok());
    }

    #[tokio::test]
    async fn test_provider_rejection_is_not_pending() {
        let (players, _) = LocalProvider::with_user("alice");
        let manager = AuthManager::new().with_provider("", players, Role::Auth);

        assert_eq!(
            manager.try_authentication("", "mallory").await,
            Err(AuthManagerError::Provider(ProviderError::Rejected(0)))
        );
        assert_eq!(manager.pending_count(), 0);
    }
}
