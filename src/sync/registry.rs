//! Session registry: logical users bound to live transport connections.
//!
//! At most one session per user id at any instant, and the connection/user
//! mapping is bijective over live sessions. A reconnect with the same user
//! id takes the session over and force-closes the displaced socket; the
//! displaced socket's later teardown finds the mapping already rebound and
//! leaves it alone.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::protocol::{ServerMessage, UserSummary};
use super::{ConnId, UserId, MIN_USER_ID_LEN};

/// Frames delivered to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A protocol message to serialize onto the socket.
    Message(ServerMessage),
    /// Tell the writer task to close the socket.
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifyError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("user id too short")]
    UserIdTooShort,

    #[error("name must not be empty")]
    EmptyName,
}

/// Validated identification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub name: String,
    pub color: String,
}

impl Identity {
    pub fn validate(
        user_id: Option<String>,
        name: Option<String>,
        color: Option<String>,
    ) -> Result<Self, IdentifyError> {
        let user_id = user_id.ok_or(IdentifyError::MissingField("userId"))?;
        let name = name.ok_or(IdentifyError::MissingField("name"))?;
        let color = color.ok_or(IdentifyError::MissingField("color"))?;
        if user_id.chars().count() < MIN_USER_ID_LEN {
            return Err(IdentifyError::UserIdTooShort);
        }
        if name.is_empty() {
            return Err(IdentifyError::EmptyName);
        }
        Ok(Self {
            user_id,
            name,
            color,
        })
    }
}

/// A live logical user bound to exactly one connection.
pub struct Session {
    pub user_id: UserId,
    pub name: String,
    pub color: String,
    pub conn_id: ConnId,
    tx: OutboundSender,
    last_seen: Instant,
}

impl Session {
    pub fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(Outbound::Message(msg));
    }

    pub fn force_close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

pub struct SessionRegistry {
    sessions: DashMap<UserId, Session>,
    by_conn: DashMap<ConnId, UserId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            by_conn: DashMap::new(),
        }
    }

    /// Bind a connection to a logical user.
    ///
    /// An existing session for the same user on another connection is
    /// force-closed and unbound first. A connection that was previously
    /// identified as a different user sheds that stale session.
    pub fn identify(&self, conn_id: &str, identity: Identity, tx: OutboundSender) {
        let displaced = match self.sessions.get(&identity.user_id) {
            Some(prev) if prev.conn_id != conn_id => {
                prev.force_close();
                Some(prev.conn_id.clone())
            }
            _ => None,
        };
        if let Some(old_conn) = displaced {
            info!(user_id = %identity.user_id, "session takeover, closing previous connection");
            self.by_conn.remove(&old_conn);
        }

        if let Some((_, old_user)) = self.by_conn.remove(conn_id) {
            if old_user != identity.user_id {
                self.sessions.remove(&old_user);
            }
        }

        info!(user_id = %identity.user_id, name = %identity.name, "user identified");
        self.by_conn
            .insert(conn_id.to_string(), identity.user_id.clone());
        self.sessions.insert(
            identity.user_id.clone(),
            Session {
                user_id: identity.user_id,
                name: identity.name,
                color: identity.color,
                conn_id: conn_id.to_string(),
                tx,
                last_seen: Instant::now(),
            },
        );
    }

    /// Tear down whatever this connection owns.
    ///
    /// Returns the departed user id only when the stored session still
    /// points at the departing connection; after a takeover the old socket's
    /// teardown is a no-op, so no spurious `userLeft` is produced.
    pub fn on_disconnect(&self, conn_id: &str) -> Option<UserId> {
        let (_, user_id) = self.by_conn.remove(conn_id)?;
        let removed = self
            .sessions
            .remove_if(&user_id, |_, session| session.conn_id == conn_id);
        if removed.is_some() {
            info!(%user_id, "user left");
            Some(user_id)
        } else {
            debug!(%user_id, "disconnect from superseded connection, ignoring");
            None
        }
    }

    /// The user identified on this connection, if any.
    pub fn resolve(&self, conn_id: &str) -> Option<UserId> {
        self.by_conn.get(conn_id).map(|u| u.clone())
    }

    /// Record activity for liveness bookkeeping.
    pub fn touch(&self, user_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(user_id) {
            session.last_seen = Instant::now();
        }
    }

    /// Identity summary for annotating relayed events.
    pub fn summary(&self, user_id: &str) -> Option<UserSummary> {
        self.sessions.get(user_id).map(|s| UserSummary {
            name: s.name.clone(),
            color: s.color.clone(),
        })
    }

    /// Everyone but the given user, keyed by user id.
    pub fn list_others(&self, excluding: &str) -> HashMap<UserId, UserSummary> {
        self.sessions
            .iter()
            .filter(|s| s.user_id != excluding)
            .map(|s| {
                (
                    s.user_id.clone(),
                    UserSummary {
                        name: s.name.clone(),
                        color: s.color.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn send_to(&self, user_id: &str, msg: ServerMessage) {
        if let Some(session) = self.sessions.get(user_id) {
            session.send(msg);
        }
    }

    pub fn broadcast_others(&self, excluding: &str, msg: ServerMessage) {
        for session in self.sessions.iter() {
            if session.user_id != excluding {
                session.send(msg.clone());
            }
        }
    }

    pub fn broadcast_all(&self, msg: ServerMessage) {
        for session in self.sessions.iter() {
            session.send(msg.clone());
        }
    }

    /// Force-close every live connection (shutdown path).
    pub fn close_all(&self) {
        for session in self.sessions.iter() {
            session.force_close();
        }
    }

    /// Remove sessions idle past `timeout`, force-closing their sockets.
    /// Returns the reaped user ids so the caller can broadcast departures.
    pub fn reap_stale(&self, timeout: Duration) -> Vec<UserId> {
        let stale: Vec<(UserId, ConnId)> = self
            .sessions
            .iter()
            .filter(|s| s.is_stale(timeout))
            .map(|s| (s.user_id.clone(), s.conn_id.clone()))
            .collect();

        let mut reaped = Vec::new();
        for (user_id, conn_id) in stale {
            let removed = self
                .sessions
                .remove_if(&user_id, |_, session| session.conn_id == conn_id);
            if let Some((_, session)) = removed {
                session.force_close();
                self.by_conn.remove(&session.conn_id);
                reaped.push(user_id);
            }
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
