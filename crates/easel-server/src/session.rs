use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use easel_core::{ConnectionError, ConnectionId, SessionId};
use parking_lot::{Mutex, RwLock};

/// A shared drawing session. Connections hold it through their membership
/// entries; the registry holds the canonical copy.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    owner: Option<ConnectionId>,
    members: RwLock<BTreeSet<ConnectionId>>,
}

impl Session {
    pub fn new(id: SessionId, owner: Option<ConnectionId>) -> Self {
        Self {
            id,
            owner,
            members: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Connection that created the session.
    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    pub fn add_member(&self, id: ConnectionId) -> bool {
        self.members.write().insert(id)
    }

    pub fn remove_member(&self, id: ConnectionId) -> bool {
        self.members.write().remove(&id)
    }

    pub fn is_member(&self, id: ConnectionId) -> bool {
        self.members.read().contains(&id)
    }

    /// Snapshot of the member set, in id order.
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.read().iter().copied().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }
}

/// Registry of live sessions. A session exists while it has members.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    lock: Mutex<()>,
    limit: usize,
}

impl SessionRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            lock: Mutex::new(()),
            limit,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Add `member` to a session, creating it when the session limit allows.
    pub fn join(&self, id: SessionId, member: ConnectionId) -> Result<Arc<Session>, ConnectionError> {
        let _guard = self.lock.lock();
        let session = match self.get(id) {
            Some(session) => session,
            None => {
                if self.sessions.len() >= self.limit {
                    return Err(ConnectionError::SessionLimit { limit: self.limit });
                }
                let session = Arc::new(Session::new(id, Some(member)));
                self.sessions.insert(id, Arc::clone(&session));
                tracing::info!(session_id = %id, owner = %member, "Session created");
                session
            }
        };
        session.add_member(member);
        Ok(session)
    }

    /// Remove `member`; the session is closed once nobody is left.
    /// Returns whether the session was closed.
    pub fn leave(&self, id: SessionId, member: ConnectionId) -> bool {
        let _guard = self.lock.lock();
        let Some(session) = self.get(id) else {
            return false;
        };
        session.remove_member(member);
        if session.member_count() > 0 {
            return false;
        }
        self.sessions.remove(&id);
        tracing::info!(session_id = %id, "Session closed");
        true
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sess(raw: u8) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    fn conn(raw: u8) -> ConnectionId {
        ConnectionId::new(raw).unwrap()
    }

    #[test]
    fn member_set_tracking() {
        let session = Session::new(sess(1), Some(conn(1)));
        assert!(session.add_member(conn(2)));
        assert!(session.add_member(conn(1)));
        assert!(!session.add_member(conn(1)));
        assert_eq!(session.members(), vec![conn(1), conn(2)]);

        assert!(session.remove_member(conn(1)));
        assert!(!session.is_member(conn(1)));
        assert_eq!(session.member_count(), 1);
    }

    #[test]
    fn join_reuses_existing_session() {
        let registry = SessionRegistry::new(2);
        let a = registry.join(sess(1), conn(1)).unwrap();
        let b = registry.join(sess(1), conn(2)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.owner(), Some(conn(1)));
        assert_eq!(b.members(), vec![conn(1), conn(2)]);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn session_limit_enforced() {
        let registry = SessionRegistry::new(1);
        registry.join(sess(1), conn(1)).unwrap();
        let err = registry.join(sess(2), conn(1)).unwrap_err();
        assert!(matches!(err, ConnectionError::SessionLimit { limit: 1 }));

        // Existing sessions stay joinable at the limit.
        assert!(registry.join(sess(1), conn(3)).is_ok());
    }

    #[test]
    fn last_leave_closes_session() {
        let registry = SessionRegistry::new(4);
        registry.join(sess(5), conn(1)).unwrap();
        registry.join(sess(5), conn(2)).unwrap();

        assert!(!registry.leave(sess(5), conn(1)));
        assert!(registry.get(sess(5)).is_some());
        assert!(registry.leave(sess(5), conn(2)));
        assert!(registry.get(sess(5)).is_none());
        assert!(registry.ids().is_empty());
        assert!(!registry.leave(sess(5), conn(2)));
    }
}
