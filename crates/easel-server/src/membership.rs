use std::collections::BTreeMap;
use std::sync::Arc;

use easel_core::{ConnectionError, SessionId, ToolInfo};

use crate::session::Session;

/// Per-session state held by one connection.
#[derive(Debug)]
pub struct SessionData {
    pub session: Arc<Session>,
    /// Last tool parameters this connection sent to the session.
    pub cached_tool: Option<ToolInfo>,
}

/// Sessions a connection has joined, plus its active selection.
#[derive(Debug, Default)]
pub struct Membership {
    entries: BTreeMap<SessionId, SessionData>,
    active: Option<SessionId>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &mut self,
        session_id: SessionId,
        session: Arc<Session>,
    ) -> Result<(), ConnectionError> {
        if self.entries.contains_key(&session_id) {
            return Err(ConnectionError::AlreadyMember(session_id));
        }
        self.entries.insert(
            session_id,
            SessionData {
                session,
                cached_tool: None,
            },
        );
        Ok(())
    }

    /// Remove an entry. Clears the active selection if it pointed here.
    pub fn leave(&mut self, session_id: SessionId) -> Result<SessionData, ConnectionError> {
        let data = self
            .entries
            .remove(&session_id)
            .ok_or(ConnectionError::NotMember(session_id))?;
        if self.active == Some(session_id) {
            self.active = None;
        }
        Ok(data)
    }

    pub fn lookup(&self, session_id: SessionId) -> Option<&SessionData> {
        self.entries.get(&session_id)
    }

    pub fn is_member(&self, session_id: SessionId) -> bool {
        self.entries.contains_key(&session_id)
    }

    /// Make `session_id` the active session. On a miss the previous
    /// selection is kept.
    pub fn select_active(&mut self, session_id: SessionId) -> Result<Arc<Session>, ConnectionError> {
        let data = self
            .entries
            .get(&session_id)
            .ok_or(ConnectionError::NotMember(session_id))?;
        self.active = Some(session_id);
        Ok(Arc::clone(&data.session))
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.active
    }

    pub fn active(&self) -> Option<&SessionData> {
        self.active.and_then(|id| self.entries.get(&id))
    }

    /// Store `tool` as the active session's tool snapshot.
    pub fn cache_tool(&mut self, tool: &ToolInfo) -> Result<SessionId, ConnectionError> {
        let session_id = self.active.ok_or(ConnectionError::NoActiveSession)?;
        let data = self
            .entries
            .get_mut(&session_id)
            .ok_or(ConnectionError::NoActiveSession)?;
        if data.cached_tool.as_ref() == Some(tool) {
            return Err(ConnectionError::ToolAlreadyCached(session_id));
        }
        data.cached_tool = Some(*tool);
        Ok(session_id)
    }

    pub fn cached_tool(&self, session_id: SessionId) -> Option<&ToolInfo> {
        self.entries
            .get(&session_id)
            .and_then(|data| data.cached_tool.as_ref())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.entries.keys().copied().collect()
    }

    /// Remove every entry, returning the sessions that were joined.
    pub fn drain(&mut self) -> Vec<Arc<Session>> {
        self.active = None;
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|data| data.session)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sess(raw: u8) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    fn joined(ids: &[u8]) -> Membership {
        let mut membership = Membership::new();
        for &raw in ids {
            membership
                .join(sess(raw), Arc::new(Session::new(sess(raw), None)))
                .unwrap();
        }
        membership
    }

    fn tool(size: u8) -> ToolInfo {
        ToolInfo {
            tool_id: 1,
            hi_size: size,
            ..ToolInfo::default()
        }
    }

    #[test]
    fn duplicate_join_rejected() {
        let mut membership = joined(&[1]);
        let err = membership
            .join(sess(1), Arc::new(Session::new(sess(1), None)))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyMember(_)));
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn select_active_success_updates_selection() {
        let mut membership = joined(&[1, 2]);
        let session = membership.select_active(sess(2)).unwrap();
        assert_eq!(session.id(), sess(2));
        assert_eq!(membership.active_id(), Some(sess(2)));
    }

    #[test]
    fn select_active_failure_keeps_prior_selection() {
        let mut membership = joined(&[1]);
        membership.select_active(sess(1)).unwrap();

        let err = membership.select_active(sess(9)).unwrap_err();
        assert!(matches!(err, ConnectionError::NotMember(s) if s == sess(9)));
        assert_eq!(membership.active_id(), Some(sess(1)));
    }

    #[test]
    fn leave_clears_active_selection() {
        let mut membership = joined(&[1, 2]);
        membership.select_active(sess(1)).unwrap();
        membership.leave(sess(1)).unwrap();
        assert_eq!(membership.active_id(), None);
        assert!(membership.lookup(sess(1)).is_none());
        assert!(matches!(
            membership.leave(sess(1)),
            Err(ConnectionError::NotMember(_))
        ));
    }

    #[test]
    fn cache_tool_without_active_session() {
        let mut membership = joined(&[1]);
        assert!(matches!(
            membership.cache_tool(&tool(1)),
            Err(ConnectionError::NoActiveSession)
        ));
    }

    #[test]
    fn distinct_tools_replace_cached_copy() {
        let mut membership = joined(&[1]);
        membership.select_active(sess(1)).unwrap();

        membership.cache_tool(&tool(1)).unwrap();
        membership.cache_tool(&tool(2)).unwrap();
        assert_eq!(membership.cached_tool(sess(1)), Some(&tool(2)));
    }

    #[test]
    fn identical_tool_rejected() {
        let mut membership = joined(&[1]);
        membership.select_active(sess(1)).unwrap();

        membership.cache_tool(&tool(4)).unwrap();
        let err = membership.cache_tool(&tool(4)).unwrap_err();
        assert!(matches!(err, ConnectionError::ToolAlreadyCached(s) if s == sess(1)));
        assert_eq!(membership.cached_tool(sess(1)), Some(&tool(4)));
    }

    #[test]
    fn tool_cache_is_per_session() {
        let mut membership = joined(&[1, 2]);
        membership.select_active(sess(1)).unwrap();
        membership.cache_tool(&tool(4)).unwrap();

        membership.select_active(sess(2)).unwrap();
        membership.cache_tool(&tool(4)).unwrap();
        assert_eq!(membership.cached_tool(sess(2)), Some(&tool(4)));
    }

    #[test]
    fn drain_returns_joined_sessions() {
        let mut membership = joined(&[3, 1]);
        membership.select_active(sess(3)).unwrap();
        let sessions = membership.drain();
        let ids: Vec<_> = sessions.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![sess(1), sess(3)]);
        assert!(membership.is_empty());
        assert_eq!(membership.active_id(), None);
    }
}
