//! Bounded registry of in-flight sessions
//!
//! One manager per node-agent process. The registry is keyed by request
//! name; the ceiling caps how many requests this node drives concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use portage_common::metrics;

use crate::{AsyncBr, SessionFactory, SessionParams};

/// Why a session slot was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreateError {
    /// The registry is at its configured ceiling
    #[error("concurrent session limit reached")]
    ConcurrencyLimit,

    /// A session for this request already exists
    #[error("session already exists for {0}")]
    AlreadyExists(String),
}

/// Process-wide bounded registry of data-path sessions
pub struct DataPathManager {
    ceiling: usize,
    sessions: Mutex<HashMap<String, Arc<dyn AsyncBr>>>,
}

impl DataPathManager {
    /// Create a manager allowing up to `ceiling` concurrent sessions
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Instantiate and register a session for `name`.
    ///
    /// Refuses without side effects when the ceiling is reached or a session
    /// for `name` already exists. The check and the insert happen under one
    /// lock, so concurrent callers observe exactly one acceptance per name
    /// while a slot is held.
    pub fn create(
        &self,
        name: &str,
        factory: &SessionFactory,
        params: SessionParams,
    ) -> Result<Arc<dyn AsyncBr>, CreateError> {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");

        if sessions.contains_key(name) {
            return Err(CreateError::AlreadyExists(name.to_string()));
        }
        if sessions.len() >= self.ceiling {
            return Err(CreateError::ConcurrencyLimit);
        }

        let session = factory(params);
        sessions.insert(name.to_string(), session.clone());
        metrics::set_active_sessions(sessions.len());
        debug!(request = %name, in_flight = sessions.len(), "session registered");

        Ok(session)
    }

    /// Look up the session for `name`
    pub fn get(&self, name: &str) -> Option<Arc<dyn AsyncBr>> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .get(name)
            .cloned()
    }

    /// Close and deregister the session for `name`; a no-op when absent.
    ///
    /// The entry is removed under the lock, the close runs outside it, so
    /// session teardown never blocks other slots.
    pub async fn remove(&self, name: &str) {
        let session = {
            let mut sessions = self.sessions.lock().expect("session registry poisoned");
            let session = sessions.remove(name);
            metrics::set_active_sessions(sessions.len());
            session
        };

        match session {
            Some(session) => {
                session.close().await;
                debug!(request = %name, "session closed and removed");
            }
            None => {
                debug!(request = %name, "no session to remove");
            }
        }
    }

    /// Number of sessions currently held
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session registry poisoned").len()
    }

    /// Whether no sessions are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
