use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::burrow::access::{AccessError, AccessManager, SessionRequestEx, SessionResponseEx};
use crate::burrow::error::{ErrorCode, SessionError, SessionResult};
use crate::burrow::protocol::HelloRequest;
use crate::burrow::server::net_filter::NetFilter;
use crate::burrow::server::session::{Session, SessionOptions};
use crate::burrow::util::NamedLockRegistry;

/// Creates, recovers and retires sessions, and drives their periodic usage
/// sync. The access manager is only ever reached through here.
pub struct SessionManager {
    access: Arc<dyn AccessManager>,
    net_filter: Arc<NetFilter>,
    options: SessionOptions,
    sessions: DashMap<u64, Arc<Session>>,
    recovery_locks: NamedLockRegistry,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        access: Arc<dyn AccessManager>,
        net_filter: Arc<NetFilter>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            access,
            net_filter,
            options,
            sessions: DashMap::new(),
            recovery_locks: NamedLockRegistry::new(),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Self::maintenance_loop(manager.clone()));
        manager
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn tcp_channel_count(&self) -> usize {
        self.sessions.iter().map(|s| s.tcp_channel_count()).sum()
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    /// Hello path: ask the access manager for a session and wire it up.
    /// A non-`Ok` manager verdict (quota, redirect, maintenance) is handed
    /// back unchanged for the response.
    pub async fn create_session(
        &self,
        hello: &HelloRequest,
        client_ip: Option<IpAddr>,
        host_end_point: SocketAddr,
    ) -> SessionResult<(Option<Arc<Session>>, SessionResponseEx)> {
        let request = SessionRequestEx {
            token_id: hello.token_id,
            client_info: hello.client_info.clone(),
            encrypted_client_id: hello.encrypted_client_id.clone(),
            client_ip,
            host_end_point,
        };

        let response = match self.access.session_create(request).await {
            Ok(r) => r,
            Err(AccessError::NotFound) => {
                return Err(SessionError::new(
                    ErrorCode::AccessError,
                    "token is not recognized",
                ));
            }
            Err(AccessError::Maintenance) => {
                return Err(SessionError::new(
                    ErrorCode::Maintenance,
                    "access manager is in maintenance mode",
                ));
            }
            Err(err) => {
                return Err(SessionError::new(ErrorCode::AccessError, err.to_string()));
            }
        };

        if response.response.error_code != ErrorCode::Ok {
            return Ok((None, response));
        }

        let session = Session::new(
            response.session_id,
            response.session_key.clone(),
            client_ip,
            host_end_point,
            self.access.clone(),
            self.net_filter.clone(),
            self.options.clone(),
        );
        self.sessions.insert(response.session_id, session.clone());
        Ok((Some(session), response))
    }

    /// Channel-request path: find the session, recovering it from the access
    /// manager after a restart. The named lock keeps concurrent requests for
    /// one session id down to a single recovery call.
    pub async fn get_or_recover(
        &self,
        session_id: u64,
        session_key: &[u8],
        client_ip: Option<IpAddr>,
        host_end_point: SocketAddr,
    ) -> SessionResult<Arc<Session>> {
        if let Some(session) = self.authorized(session_id, session_key)? {
            return Ok(session);
        }

        let _guard = self.recovery_locks.lock(&session_id.to_string()).await;
        // Another request may have recovered it while we waited.
        if let Some(session) = self.authorized(session_id, session_key)? {
            return Ok(session);
        }

        let response = match self
            .access
            .session_get(session_id, host_end_point, client_ip)
            .await
        {
            Ok(r) => r,
            Err(AccessError::NotFound) => {
                return Err(SessionError::new(
                    ErrorCode::AccessError,
                    format!("session {session_id} is unknown"),
                ));
            }
            Err(err) => {
                return Err(SessionError::new(ErrorCode::AccessError, err.to_string()));
            }
        };

        if response.response.error_code != ErrorCode::Ok {
            return Err(SessionError::new(
                response.response.error_code,
                response
                    .response
                    .error_message
                    .unwrap_or_else(|| "session can not be recovered".into()),
            ));
        }
        if response.session_key != session_key {
            return Err(SessionError::new(
                ErrorCode::AccessError,
                "session key mismatch",
            ));
        }

        tracing::info!(session_id, "session manager: recovered session");
        let session = Session::new(
            session_id,
            response.session_key,
            client_ip,
            host_end_point,
            self.access.clone(),
            self.net_filter.clone(),
            self.options.clone(),
        );
        self.sessions.insert(session_id, session.clone());
        Ok(session)
    }

    fn authorized(
        &self,
        session_id: u64,
        session_key: &[u8],
    ) -> SessionResult<Option<Arc<Session>>> {
        let Some(session) = self.get(session_id) else {
            return Ok(None);
        };
        if !session.verify_key(session_key) {
            return Err(SessionError::new(
                ErrorCode::AccessError,
                "session key mismatch",
            ));
        }
        if session.is_disposed() {
            let response = session.current_response();
            return Err(SessionError::new(
                response.error_code,
                response
                    .error_message
                    .unwrap_or_else(|| "session is closed".into()),
            ));
        }
        Ok(Some(session))
    }

    pub async fn close_session(&self, session_id: u64) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            session.close().await;
        }
    }

    /// Periodic pass: sync usage, retire idle and disposed sessions.
    async fn maintenance_loop(self: Arc<Self>) {
        let interval = self.options.sync_interval;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let sessions: Vec<Arc<Session>> =
                self.sessions.iter().map(|s| s.clone()).collect();
            for session in sessions {
                if session.is_disposed() {
                    self.sessions.remove(&session.session_id());
                    continue;
                }
                if session.last_activity().elapsed() >= self.options.timeout {
                    tracing::info!(
                        session_id = session.session_id(),
                        "session manager: closing idle session"
                    );
                    session.close().await;
                    self.sessions.remove(&session.session_id());
                    continue;
                }
                let _ = session.sync(true, false).await;
            }
            self.recovery_locks.purge();
        }
    }

    /// Graceful shutdown: every session gets its final sync+bye.
    pub async fn close_all(&self) {
        self.cancel.cancel();
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|s| s.clone()).collect();
        for session in sessions {
            session.close().await;
        }
        self.sessions.clear();
    }
}
