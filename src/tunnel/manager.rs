//! The single-slot session manager.
//!
//! A process holds at most one active session. Installing a new session
//! displaces and closes the previous one; the displaced session's accept
//! loop errors out and its `serve` call returns. The displaced session is
//! closed outside the slot lock — closing can rendezvous with the session
//! task, and holding the lock across that is a deadlock waiting to happen.

use super::proxy::{self, AllowAll, TargetGate};
use crate::mux::MuxSession;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct SessionManager {
    slot: Mutex<Option<MuxSession>>,
    gate: Arc<dyn TargetGate>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_gate(Arc::new(AllowAll))
    }

    /// A manager whose inbound streams are screened by `gate`.
    pub fn with_gate(gate: Arc<dyn TargetGate>) -> Self {
        SessionManager {
            slot: Mutex::new(None),
            gate,
        }
    }

    /// Make `session` the active session, closing whatever it displaces.
    pub fn install(&self, session: MuxSession) {
        let previous = { self.slot.lock().unwrap().replace(session) };
        if let Some(previous) = previous {
            info!("replacing active session");
            previous.close();
        }
    }

    /// Snapshot of the active session, if any.
    pub fn current(&self) -> Option<MuxSession> {
        self.slot.lock().unwrap().clone()
    }

    /// Serve `session` until it fails: verify it with a ping, then accept
    /// inbound streams and proxy each one. On return the session is either
    /// no longer current or the slot has been cleared.
    pub async fn serve(&self, session: MuxSession) {
        match session.ping().await {
            Ok(rtt) => info!(rtt = ?rtt, "session opened"),
            Err(e) => {
                warn!(error = %e, "session ping failed");
                session.close();
                self.clear(&session);
                return;
            }
        }

        loop {
            match session.accept().await {
                Ok(stream) => {
                    debug!(stream = stream.id(), "inbound stream");
                    tokio::spawn(proxy::serve_stream(stream, self.gate.clone()));
                }
                Err(e) => {
                    info!(error = %e, "session ended");
                    break;
                }
            }
        }

        self.clear(&session);
    }

    /// Clear the slot if it still holds this session.
    fn clear(&self, session: &MuxSession) {
        let mut slot = self.slot.lock().unwrap();
        if slot.as_ref().is_some_and(|current| current.same_session(session)) {
            *slot = None;
        }
    }
}
