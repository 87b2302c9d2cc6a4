use uuid::Uuid;

/// Identity used to wrap a freshly-generated FEK at create time.
///
/// Model taken from the external session/UUID accessor (S): a process-wide
/// collaborator, injected rather than reached through a singleton.
pub trait SessionAccessor: Send + Sync {
    fn current_session(&self) -> Uuid;
}

/// Session accessor that always reports the same identity.
///
/// Suitable for a TEE instance bound to a single device/session UUID for
/// its lifetime; the `SessionAccessor` trait exists so a multi-session host
/// can swap in a real accessor without touching the storage engine.
pub struct StaticSessionAccessor {
    session_id: Uuid,
}

impl StaticSessionAccessor {
    #[must_use]
    pub fn new(session_id: Uuid) -> Self {
        Self { session_id }
    }

    #[must_use]
    pub fn random() -> Self {
        Self {
            session_id: Uuid::new_v4(),
        }
    }
}

impl SessionAccessor for StaticSessionAccessor {
    fn current_session(&self) -> Uuid {
        self.session_id
    }
}
