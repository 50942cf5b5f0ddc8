//! Process-wide authentication state.
//!
//! The front end creates one [`IdentityHub`] at startup and hands
//! [`IdentityHub::subscribe`] to the controller runtime; dropping the runtime
//! releases the receiver. Credentials are validated elsewhere; the hub only
//! records who is signed in.

use shared::domain::Identity;
use tokio::sync::watch;
use tracing::info;

pub struct IdentityHub {
    current: watch::Sender<Option<Identity>>,
}

impl Default for IdentityHub {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityHub {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    pub fn signed_in(identity: Identity) -> Self {
        let hub = Self::new();
        hub.sign_in(identity);
        hub
    }

    pub fn sign_in(&self, identity: Identity) {
        info!(user_id = %identity.user_id, "identity signed in");
        self.current.send_replace(Some(identity));
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.current.send_replace(None) {
            info!(user_id = %previous.user_id, "identity signed out");
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}
