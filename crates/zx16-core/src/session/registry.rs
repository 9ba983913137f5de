//! SessionRegistry - the single source of truth for live sessions.
//!
//! The map lock is held only for insert/lookup/remove. Anything that talks to
//! a process goes through the session's own command slot instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::state::{Session, SessionId, SessionState};
use crate::config::SimulatorConfig;
use crate::driver::SimulatorProcess;
use crate::error::SimError;
use crate::image::UploadedImage;
use crate::logging::Transcript;

/// Concurrency-safe table of active sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a simulator for `image` and register the session.
    ///
    /// The session is only inserted once the simulator is ready, so a failed
    /// spawn never becomes visible. The image moves into the session (or is
    /// dropped, and thereby deleted, on failure).
    pub async fn create(
        &self,
        config: Arc<SimulatorConfig>,
        image: UploadedImage,
    ) -> Result<(SessionId, String), SimError> {
        let session = Arc::new(Session::new(SessionId::new()));
        let transcript = Transcript::open(config.log_dir.as_deref(), &session.id.0);

        let (process, initial_output) = SimulatorProcess::spawn(
            session.id.clone(),
            config,
            image.path(),
            transcript,
            &session.cancel,
        )
        .await?;

        {
            let mut slot = session.slot.lock().await;
            slot.process = Some(process);
            slot.image = Some(image);
        }
        session.set_state(SessionState::Ready);
        session.touch();

        let id = session.id.clone();
        self.insert(session);
        log::info!("Session {} ready", id);
        Ok((id, initial_output))
    }

    /// Insert an already-built session.
    pub fn insert(&self, session: Arc<Session>) {
        self.map().insert(session.id.clone(), session);
    }

    /// Look up a live session.
    pub fn get(&self, session_id: &SessionId) -> Result<Arc<Session>, SimError> {
        self.map()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SimError::NotFound(session_id.clone()))
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub fn remove(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.map().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// List all live session IDs.
    pub fn ids(&self) -> Vec<SessionId> {
        self.map().keys().cloned().collect()
    }

    /// Clone out every live session, releasing the lock before returning.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.map().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod session_registry {
        use super::*;

        #[test]
        fn new_creates_empty_registry() {
            let registry = SessionRegistry::new();
            assert!(registry.is_empty());
            assert!(registry.ids().is_empty());
        }

        #[test]
        fn insert_then_get() {
            let registry = SessionRegistry::new();
            let session = Arc::new(Session::new(SessionId::new()));
            let id = session.id.clone();
            registry.insert(session);

            let found = registry.get(&id).unwrap();
            assert_eq!(found.id, id);
            assert_eq!(registry.len(), 1);
        }

        #[test]
        fn get_returns_not_found_for_unknown() {
            let registry = SessionRegistry::new();
            let fake_id = SessionId("nonexistent".to_string());
            match registry.get(&fake_id).unwrap_err() {
                SimError::NotFound(id) => assert_eq!(id, fake_id),
                other => panic!("Expected NotFound, got {:?}", other),
            }
        }

        #[test]
        fn remove_is_idempotent() {
            let registry = SessionRegistry::new();
            let session = Arc::new(Session::new(SessionId::new()));
            let id = session.id.clone();
            registry.insert(session);

            assert!(registry.remove(&id).is_some());
            assert!(registry.remove(&id).is_none());
            assert!(registry.get(&id).is_err());
        }

        #[test]
        fn ids_and_snapshot_list_all() {
            let registry = SessionRegistry::new();
            let ids: Vec<_> = (0..3)
                .map(|_| {
                    let session = Arc::new(Session::new(SessionId::new()));
                    let id = session.id.clone();
                    registry.insert(session);
                    id
                })
                .collect();

            let listed = registry.ids();
            assert_eq!(listed.len(), 3);
            for id in &ids {
                assert!(listed.contains(id));
            }
            assert_eq!(registry.snapshot().len(), 3);
        }

        #[test]
        fn concurrent_inserts_and_removes() {
            let registry = Arc::new(SessionRegistry::new());
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    std::thread::spawn(move || {
                        for _ in 0..50 {
                            let session = Arc::new(Session::new(SessionId::new()));
                            let id = session.id.clone();
                            registry.insert(session);
                            assert!(registry.get(&id).is_ok());
                            assert!(registry.remove(&id).is_some());
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert!(registry.is_empty());
        }

        #[tokio::test]
        async fn create_with_missing_executable_inserts_nothing() {
            let dir = tempfile::tempdir().unwrap();
            let image = UploadedImage::store(dir.path(), "p.bin", &[0, 0]).unwrap();
            let image_path = image.path().to_path_buf();
            let config = Arc::new(SimulatorConfig::new("/nonexistent/z16sim"));

            let registry = SessionRegistry::new();
            let err = registry.create(config, image).await.unwrap_err();
            assert_eq!(err.kind(), "spawn");
            assert!(registry.is_empty());
            assert!(!image_path.exists());
        }
    }
}
