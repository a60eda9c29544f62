//! Session/auth state: the token pair and the identity derived from it.
//!
//! A [`Session`] is created explicitly and handed to the HTTP client and the CLI; nothing
//! reads tokens from ambient storage. Status changes are broadcast on a watch channel so
//! the view layer learns about a forced logout without polling.

pub mod token_store;

pub use token_store::{FileTokenStore, MemoryTokenStore, PersistedSession, TokenPair, TokenStore};

use crate::common::Result;
use crate::service::protocol::{Role, UserProfile};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Anonymous,
    Authenticated,
    /// Tokens were rejected and cleared; the operator has to log in again.
    LoginRequired,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    tokens: Option<TokenPair>,
    user: Option<UserProfile>,
}

pub struct Session {
    store: Box<dyn TokenStore>,
    state: watch::Sender<SessionState>,
    status: watch::Sender<SessionStatus>,
}

impl Session {
    pub fn init(store: Box<dyn TokenStore>) -> Result<Self> {
        let persisted = store.load()?;
        let (state, status) = match persisted {
            Some(p) => (
                SessionState { tokens: Some(p.tokens), user: p.user },
                SessionStatus::Authenticated,
            ),
            None => (SessionState::default(), SessionStatus::Anonymous),
        };

        Ok(Self {
            store,
            state: watch::Sender::new(state),
            status: watch::Sender::new(status),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryTokenStore::new()),
            state: watch::Sender::new(SessionState::default()),
            status: watch::Sender::new(SessionStatus::Anonymous),
        }
    }

    /// Status changes only; token rotation is not observable here.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().tokens.is_some()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.borrow().tokens.as_ref().map(|t| t.access.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.borrow().tokens.as_ref().map(|t| t.refresh.clone())
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.state.borrow().user.clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.state.borrow().user.as_ref().map(|u| u.role)
    }

    /// Stores a freshly issued token pair (login).
    pub fn establish(&self, tokens: TokenPair, user: UserProfile) -> Result<()> {
        self.store.save(&PersistedSession::new(tokens.clone(), Some(user.clone())))?;
        self.state.send_replace(SessionState { tokens: Some(tokens), user: Some(user) });
        self.status.send_replace(SessionStatus::Authenticated);
        tracing::info!("Session established");
        Ok(())
    }

    /// Replaces the access token after a successful refresh.
    pub fn rotate_access(&self, access: String) -> Result<()> {
        let current = self.state.borrow().tokens.clone();
        let Some(mut tokens) = current else {
            return Ok(());
        };
        tokens.access = access;
        let user = self.current_user();
        self.store.save(&PersistedSession::new(tokens.clone(), user))?;
        self.state.send_modify(|s| s.tokens = Some(tokens));
        Ok(())
    }

    pub fn update_user(&self, user: UserProfile) -> Result<()> {
        let current = self.state.borrow().tokens.clone();
        if let Some(tokens) = current {
            self.store.save(&PersistedSession::new(tokens, Some(user.clone())))?;
        }
        self.state.send_modify(|s| s.user = Some(user));
        Ok(())
    }

    /// Voluntary logout.
    pub fn clear(&self) -> Result<()> {
        self.store.clear()?;
        self.state.send_replace(SessionState::default());
        self.status.send_replace(SessionStatus::Anonymous);
        Ok(())
    }

    /// Forced logout after the backend rejected our credentials.
    pub fn expire(&self) {
        if let Err(e) = self.store.clear() {
            tracing::warn!("Failed to clear stored tokens: {}", e);
        }
        self.state.send_replace(SessionState::default());
        self.status.send_replace(SessionStatus::LoginRequired);
        tracing::warn!("Session expired - login required");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staff_user() -> UserProfile {
        UserProfile {
            id: 7,
            username: "mrojas".into(),
            email: String::new(),
            first_name: "Marta".into(),
            last_name: "Rojas".into(),
            role: Role::Teacher,
            school_name: None,
            phone_number: String::new(),
        }
    }

    fn pair() -> TokenPair {
        TokenPair { access: "access-1".into(), refresh: "refresh-1".into() }
    }

    #[test]
    fn init_restores_persisted_tokens() {
        let session = Session::init(Box::new(MemoryTokenStore::with_tokens(pair()))).unwrap();
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(session.access_token().as_deref(), Some("access-1"));
        assert!(session.current_user().is_none());
    }

    #[test]
    fn establish_rotate_and_clear() {
        let session = Session::in_memory();
        assert!(!session.is_authenticated());

        session.establish(pair(), staff_user()).unwrap();
        assert_eq!(session.role(), Some(Role::Teacher));

        session.rotate_access("access-2".into()).unwrap();
        assert_eq!(session.access_token().as_deref(), Some("access-2"));
        assert_eq!(session.refresh_token().as_deref(), Some("refresh-1"));

        session.clear().unwrap();
        assert_eq!(session.status(), SessionStatus::Anonymous);
        assert!(session.access_token().is_none());
    }

    #[test]
    fn expire_clears_store_and_requires_login() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let session = Session::init(Box::new(FileTokenStore::new(&path))).unwrap();
        session.establish(pair(), staff_user()).unwrap();
        assert!(path.exists());

        session.expire();
        assert_eq!(session.status(), SessionStatus::LoginRequired);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn subscribers_observe_forced_logout() {
        let session = Session::in_memory();
        session.establish(pair(), staff_user()).unwrap();
        let mut rx = session.subscribe();

        session.expire();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionStatus::LoginRequired);
    }
}
