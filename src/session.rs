//! Session manager: token lifecycle and per-session context.
//!
//! Credentials are accepted without validation; a login always succeeds and
//! hands back a session token plus a master token. The table is read-mostly,
//! so it sits behind a `parking_lot::RwLock` and every operation is a single
//! hash map access.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;
use uuid::Uuid;

use crate::{Result, SnowglobeError};

pub const DEFAULT_DATABASE: &str = "SNOWGLOBE";
pub const DEFAULT_SCHEMA: &str = "PUBLIC";
pub const DEFAULT_WAREHOUSE: &str = "COMPUTE_WH";
pub const DEFAULT_ROLE: &str = "ACCOUNTADMIN";

/// The naming and execution context a session carries between statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub database: String,
    pub schema: String,
    pub warehouse: String,
    pub role: String,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_owned(),
            schema: DEFAULT_SCHEMA.to_owned(),
            warehouse: DEFAULT_WAREHOUSE.to_owned(),
            role: DEFAULT_ROLE.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub user: String,
    pub context: SessionContext,
    pub master_token: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// Serializes statements within the session: one in-flight query at a
    /// time, later submissions wait their turn.
    pub gate: Arc<tokio::sync::Mutex<()>>,
}

/// What the operator surface gets to see; only a token suffix leaks out.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub user: String,
    pub database: String,
    pub schema: String,
    pub warehouse: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub token_suffix: String,
}

pub struct CreatedSession {
    pub token: String,
    pub master_token: String,
    pub session_id: Uuid,
    pub context: SessionContext,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
}

/// 256 bits of randomness, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        user: &str,
        database: Option<&str>,
        schema: Option<&str>,
        warehouse: Option<&str>,
        role: Option<&str>,
    ) -> CreatedSession {
        let fold = |v: Option<&str>, default: &str| {
            v.filter(|s| !s.is_empty())
                .map_or_else(|| default.to_owned(), str::to_ascii_uppercase)
        };
        let context = SessionContext {
            database: fold(database, DEFAULT_DATABASE),
            schema: fold(schema, DEFAULT_SCHEMA),
            warehouse: fold(warehouse, DEFAULT_WAREHOUSE),
            role: fold(role, DEFAULT_ROLE),
        };
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4(),
            user: user.to_owned(),
            context: context.clone(),
            master_token: generate_token(),
            created_at: now,
            last_used: now,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        };
        let token = generate_token();
        let created = CreatedSession {
            token: token.clone(),
            master_token: session.master_token.clone(),
            session_id: session.session_id,
            context,
        };
        self.sessions.write().insert(token, session);
        created
    }

    pub fn lookup(&self, token: &str) -> Result<Session> {
        self.sessions
            .read()
            .get(token)
            .cloned()
            .ok_or(SnowglobeError::Unauthenticated)
    }

    /// Issue a fresh token for the session behind `old_token` (which may be
    /// the session token or the master token); the old session token stops
    /// working.
    pub fn renew(&self, old_token: &str) -> Result<(String, Session)> {
        let mut sessions = self.sessions.write();
        let key = if sessions.contains_key(old_token) {
            old_token.to_owned()
        } else {
            sessions
                .iter()
                .find(|(_, s)| s.master_token == old_token)
                .map(|(k, _)| k.clone())
                .ok_or(SnowglobeError::Unauthenticated)?
        };
        let mut session = sessions.remove(&key).ok_or(SnowglobeError::Unauthenticated)?;
        session.last_used = Utc::now();
        let token = generate_token();
        sessions.insert(token.clone(), session.clone());
        Ok((token, session))
    }

    pub fn touch(&self, token: &str) {
        if let Some(s) = self.sessions.write().get_mut(token) {
            s.last_used = Utc::now();
        }
    }

    /// Write back the context after a USE statement.
    pub fn set_context(&self, token: &str, context: SessionContext) {
        if let Some(s) = self.sessions.write().get_mut(token) {
            s.context = context;
        }
    }

    pub fn close(&self, token: &str) -> Result<()> {
        self.sessions
            .write()
            .remove(token)
            .map(|_| ())
            .ok_or(SnowglobeError::Unauthenticated)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn list(&self) -> Vec<SessionDescriptor> {
        let mut out: Vec<SessionDescriptor> = self
            .sessions
            .read()
            .iter()
            .map(|(token, s)| SessionDescriptor {
                session_id: s.session_id.to_string(),
                user: s.user.clone(),
                database: s.context.database.clone(),
                schema: s.context.schema.clone(),
                warehouse: s.context.warehouse.clone(),
                role: s.context.role.clone(),
                created_at: s.created_at,
                last_used: s.last_used,
                token_suffix: token.chars().rev().take(8).collect::<Vec<_>>().into_iter().rev().collect(),
            })
            .collect();
        out.sort_by_key(|d| d.created_at);
        out
    }

    /// Drop sessions idle for longer than `idle_seconds`; returns how many
    /// were closed. A zero threshold disables expiry.
    pub fn expire_idle(&self, idle_seconds: u64) -> usize {
        if idle_seconds == 0 {
            return 0;
        }
        let cutoff = Utc::now() - chrono::TimeDelta::seconds(i64::try_from(idle_seconds).unwrap_or(i64::MAX));
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.last_used >= cutoff);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_fills_defaults_and_folds_case() {
        let m = SessionManager::new();
        let c = m.create("dev", Some("mydb"), None, None, None);
        assert_eq!(c.context.database, "MYDB");
        assert_eq!(c.context.schema, "PUBLIC");
        assert_eq!(c.context.warehouse, "COMPUTE_WH");
        assert_eq!(c.context.role, "ACCOUNTADMIN");
        assert_eq!(c.token.len(), 64);
        assert_ne!(c.token, c.master_token);
    }

    #[test]
    fn lookup_close_lifecycle() {
        let m = SessionManager::new();
        let c = m.create("dev", None, None, None, None);
        assert!(m.lookup(&c.token).is_ok());
        m.close(&c.token).unwrap();
        assert!(matches!(m.lookup(&c.token), Err(SnowglobeError::Unauthenticated)));
    }

    #[test]
    fn renew_keeps_identity_and_invalidates_old_token() {
        let m = SessionManager::new();
        let c = m.create("dev", None, None, None, None);
        let (new_token, session) = m.renew(&c.token).unwrap();
        assert_eq!(session.session_id, c.session_id);
        assert_ne!(new_token, c.token);
        assert!(m.lookup(&c.token).is_err());
        assert!(m.lookup(&new_token).is_ok());
    }

    #[test]
    fn renew_accepts_master_token() {
        let m = SessionManager::new();
        let c = m.create("dev", None, None, None, None);
        let (new_token, _) = m.renew(&c.master_token).unwrap();
        assert!(m.lookup(&new_token).is_ok());
    }

    #[test]
    fn descriptor_only_exposes_a_suffix() {
        let m = SessionManager::new();
        let c = m.create("dev", None, None, None, None);
        let list = m.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].token_suffix.len(), 8);
        assert!(c.token.ends_with(&list[0].token_suffix));
    }

    #[test]
    fn idle_expiry_disabled_at_zero() {
        let m = SessionManager::new();
        m.create("dev", None, None, None, None);
        assert_eq!(m.expire_idle(0), 0);
        assert_eq!(m.active_count(), 1);
    }
}
