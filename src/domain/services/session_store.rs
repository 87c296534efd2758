#[cfg(test)]
#[path = "session_store_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::now_millis;
use crate::domain::models::is_placeholder_id;
use crate::domain::models::session_cache_key;
use crate::domain::models::AgentServerBox;
use crate::domain::models::Confirmer;
use crate::domain::models::CreateSessionRequest;
use crate::domain::models::ServerEvent;
use crate::domain::models::Session;
use crate::domain::models::SessionCache;
use crate::domain::models::SessionEvent;
use crate::domain::models::SessionEventKind;
use crate::domain::models::SessionInfo;
use crate::domain::models::SessionOptions;
use crate::domain::models::SessionStatus;
use crate::domain::models::StateStoreBox;
use crate::domain::models::ACTIVE_SESSION_KEY;
use crate::domain::models::PLACEHOLDER_PREFIX;

type Writes = Vec<(String, Option<Value>)>;

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Session>,
    active_id: Option<String>,
    /// Placeholder ids that were confirmed, pointing at their real id.
    promoted: HashMap<String, String>,
}

impl Registry {
    fn resolve(&self, id: &str) -> String {
        return self
            .promoted
            .get(id)
            .cloned()
            .unwrap_or_else(|| return id.to_string());
    }
}

fn cache_write(session: &Session) -> (String, Option<Value>) {
    return (
        session_cache_key(&session.id),
        serde_json::to_value(session.cache()).ok(),
    );
}

fn active_write(active_id: &Option<String>) -> (String, Option<Value>) {
    return (
        ACTIVE_SESSION_KEY.to_string(),
        active_id.as_ref().map(|e| return Value::String(e.to_string())),
    );
}

pub fn create_placeholder_id(now: i64) -> String {
    let random = Uuid::new_v4().simple().to_string();
    return format!("{PLACEHOLDER_PREFIX}{now}_{}", &random[..8]);
}

/// Registry of every session the client knows about: confirmed sessions
/// from the server and local placeholders waiting for their first message.
/// Owns the active-session pointer and the persisted bookkeeping.
#[derive(Clone)]
pub struct SessionStore {
    server: AgentServerBox,
    state: StateStoreBox,
    registry: Arc<Mutex<Registry>>,
    confirmations: Arc<Mutex<HashMap<String, Arc<OnceCell<String>>>>>,
    events: broadcast::Sender<SessionEvent>,
    create_timeout: Duration,
}

impl SessionStore {
    pub fn new(server: AgentServerBox, state: StateStoreBox, create_timeout: Duration) -> SessionStore {
        let (events, _) = broadcast::channel(256);
        return SessionStore {
            server,
            state,
            registry: Arc::new(Mutex::new(Registry::default())),
            confirmations: Arc::new(Mutex::new(HashMap::new())),
            events,
            create_timeout,
        };
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        return self.registry.lock().unwrap_or_else(PoisonError::into_inner);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        return self.events.subscribe();
    }

    fn emit(&self, kind: SessionEventKind, session_id: &str) {
        tracing::debug!(kind = %kind, session_id, "Session event");
        // No receivers is fine.
        let _ = self.events.send(SessionEvent {
            kind,
            session_id: session_id.to_string(),
            timestamp: now_millis(),
        });
    }

    async fn persist(&self, writes: Writes) {
        for (key, value) in writes {
            if let Err(err) = self.state.set(&key, value).await {
                tracing::warn!(error = ?err, key = %key, "Failed to persist session state");
            }
        }
    }

    async fn server_create(&self, options: &SessionOptions) -> Result<SessionInfo> {
        let req = CreateSessionRequest {
            title: options.title.clone(),
            directory: options.directory.clone(),
            parent_id: options.parent_id.clone(),
        };

        let info = tokio::time::timeout(self.create_timeout, self.server.create_session(req))
            .await
            .map_err(|_| {
                return anyhow!(
                    "Session creation timed out after {}ms",
                    self.create_timeout.as_millis()
                );
            })??;

        return Ok(info);
    }

    /// Loads sessions from the server, then restores persisted bookkeeping
    /// and the active pointer from the last run.
    pub async fn load(&self) -> Result<()> {
        let infos = self
            .server
            .list_sessions()
            .await
            .context("Failed to load sessions")?;

        let mut caches = HashMap::new();
        for info in infos.iter() {
            let key = session_cache_key(&info.id);
            match self.state.get(&key).await {
                Ok(Some(value)) => match serde_json::from_value::<SessionCache>(value) {
                    Ok(cache) => {
                        caches.insert(info.id.to_string(), cache);
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, key = %key, "Ignoring unreadable session cache")
                    }
                },
                Ok(None) => {}
                Err(err) => tracing::warn!(error = ?err, key = %key, "Failed to read session cache"),
            }
        }

        let persisted_active = match self.state.get(ACTIVE_SESSION_KEY).await {
            Ok(value) => value.and_then(|e| return e.as_str().map(|e| return e.to_string())),
            Err(err) => {
                tracing::warn!(error = ?err, "Failed to read active session");
                None
            }
        };

        {
            let mut registry = self.lock();
            for info in infos {
                let mut session = Session::from_info(info);
                if let Some(cache) = caches.remove(&session.id) {
                    session.apply_cache(cache);
                }
                if session.status == SessionStatus::Active {
                    session.status = SessionStatus::Idle;
                }
                registry.sessions.insert(session.id.to_string(), session);
            }

            registry.active_id = None;
            if let Some(active_id) = persisted_active {
                if let Some(session) = registry.sessions.get_mut(&active_id) {
                    session.status = SessionStatus::Active;
                    registry.active_id = Some(active_id);
                }
            }

            tracing::info!(
                count = registry.sessions.len(),
                active = ?registry.active_id,
                "Loaded sessions"
            );
        }

        return Ok(());
    }

    /// Re-lists sessions from the server. Local bookkeeping and placeholders
    /// survive; confirmed sessions the server no longer has are dropped.
    pub async fn refresh(&self) -> Result<Vec<Session>> {
        let infos = self
            .server
            .list_sessions()
            .await
            .context("Failed to refresh sessions")?;

        let mut writes = vec![];
        let removed = {
            let mut registry = self.lock();
            let mut removed = vec![];
            let known = infos
                .iter()
                .map(|e| return e.id.to_string())
                .collect::<Vec<String>>();

            registry.sessions.retain(|id, session| {
                if session.is_placeholder() || known.contains(id) {
                    return true;
                }
                removed.push(id.to_string());
                return false;
            });

            for info in infos {
                match registry.sessions.get_mut(&info.id) {
                    Some(session) => session.merge_info(info),
                    None => {
                        let session = Session::from_info(info);
                        registry.sessions.insert(session.id.to_string(), session);
                    }
                }
            }

            if let Some(active_id) = registry.active_id.clone() {
                if removed.contains(&active_id) {
                    registry.active_id = None;
                    writes.push(active_write(&None));
                }
            }

            removed
        };

        for id in removed.iter() {
            writes.push((session_cache_key(id), None));
            self.emit(SessionEventKind::Deleted, id);
        }
        self.persist(writes).await;

        return Ok(self.list());
    }

    /// Creates a confirmed session on the server and activates it.
    pub async fn create(&self, options: SessionOptions) -> Result<Session> {
        let info = match self.server_create(&options).await {
            Ok(info) => info,
            Err(err) => {
                tracing::error!(error = ?err, "Failed to create session");
                bail!("Failed to create session: {err}");
            }
        };

        let mut session = Session::from_info(info);
        if let Some(agent) = options.agent.as_ref() {
            session.agent = agent.to_string();
        }
        session.model = options.model.clone();
        let id = session.id.to_string();

        self.lock().sessions.insert(id.to_string(), session);
        self.emit(SessionEventKind::Created, &id);
        self.set_active(&id).await?;

        return self
            .get(&id)
            .ok_or_else(|| return anyhow!("Session {id} vanished after creation"));
    }

    /// Creates and activates a local placeholder without touching the
    /// server. An untouched placeholder that is currently active is
    /// discarded first.
    pub async fn create_placeholder(&self, options: SessionOptions) -> Session {
        let now = now_millis();
        let session = Session::placeholder(&create_placeholder_id(now), &options, now);
        self.lock()
            .sessions
            .insert(session.id.to_string(), session.clone());
        self.emit(SessionEventKind::Created, &session.id);

        if let Err(err) = self.set_active(&session.id).await {
            tracing::error!(error = ?err, "Failed to activate placeholder");
        }

        return self.get(&session.id).unwrap_or(session);
    }

    /// Confirms a placeholder with the server exactly once. Concurrent
    /// callers share the in-flight creation and all receive the same id.
    pub async fn confirm_placeholder(
        &self,
        placeholder_id: &str,
        options: SessionOptions,
    ) -> Result<String> {
        if !is_placeholder_id(placeholder_id) {
            return Ok(placeholder_id.to_string());
        }

        let cell = {
            let mut confirmations = self
                .confirmations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            confirmations
                .entry(placeholder_id.to_string())
                .or_insert_with(|| return Arc::new(OnceCell::new()))
                .clone()
        };

        let real_id = cell
            .get_or_try_init(|| return self.promote(placeholder_id, options))
            .await?;

        return Ok(real_id.to_string());
    }

    async fn promote(&self, placeholder_id: &str, options: SessionOptions) -> Result<String> {
        let mut options = options;
        if let Some(placeholder) = self.get(placeholder_id) {
            if options.title.is_none() {
                options.title = Some(placeholder.title.to_string());
            }
            if options.directory.is_none() && !placeholder.directory.is_empty() {
                options.directory = Some(placeholder.directory.to_string());
            }
        }

        let info = match self.server_create(&options).await {
            Ok(info) => info,
            Err(err) => {
                tracing::error!(error = ?err, placeholder_id, "Failed to confirm session");
                bail!("Failed to create session: {err}");
            }
        };
        let real_id = info.id.to_string();

        let writes = {
            let mut registry = self.lock();
            let mut session = match registry.sessions.remove(placeholder_id) {
                Some(mut placeholder) => {
                    placeholder.promote(info);
                    placeholder
                }
                None => Session::from_info(info),
            };
            // A session.created event may have registered the real id first.
            registry.sessions.remove(&real_id);

            let mut writes: Writes = vec![(session_cache_key(placeholder_id), None)];
            if registry.active_id.as_deref() == Some(placeholder_id) {
                registry.active_id = Some(real_id.to_string());
                session.status = SessionStatus::Active;
                writes.push(active_write(&registry.active_id));
            }
            writes.push(cache_write(&session));

            registry
                .promoted
                .insert(placeholder_id.to_string(), real_id.to_string());
            registry.sessions.insert(real_id.to_string(), session);

            writes
        };

        tracing::info!(placeholder_id, real_id = %real_id, "Confirmed placeholder session");
        self.emit(SessionEventKind::Created, &real_id);
        self.emit(SessionEventKind::Updated, &real_id);
        self.emit(SessionEventKind::Deleted, placeholder_id);
        self.persist(writes).await;

        return Ok(real_id);
    }

    /// Activates a session, parking the previous one as idle. An untouched
    /// placeholder being left behind is deleted instead. Sessions unknown
    /// locally are fetched from the server first.
    pub async fn set_active(&self, session_id: &str) -> Result<()> {
        let session_id = self.lock().resolve(session_id);
        if self.get(&session_id).is_none() {
            if is_placeholder_id(&session_id) {
                bail!("No session found for id {session_id}");
            }
            let info = self
                .server
                .get_session(&session_id)
                .await
                .with_context(|| return format!("No session found for id {session_id}"))?;
            self.lock()
                .sessions
                .entry(info.id.to_string())
                .or_insert_with(|| return Session::from_info(info));
        }

        let now = now_millis();
        let mut discarded = None;
        let writes = {
            let mut registry = self.lock();
            let mut writes = vec![];

            if let Some(previous_id) = registry.active_id.clone() {
                if previous_id != session_id {
                    let untouched = registry
                        .sessions
                        .get(&previous_id)
                        .map(|e| return e.is_untouched_placeholder())
                        .unwrap_or(false);
                    if untouched {
                        registry.sessions.remove(&previous_id);
                        discarded = Some(previous_id);
                    } else if let Some(previous) = registry.sessions.get_mut(&previous_id) {
                        previous.status = SessionStatus::Idle;
                        writes.push(cache_write(previous));
                    }
                }
            }

            let target = registry
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| return anyhow!("No session found for id {session_id}"))?;
            target.status = SessionStatus::Active;
            target.last_activity = now;
            if !target.is_placeholder() {
                writes.push(cache_write(target));
            }

            registry.active_id = Some(session_id.to_string());
            writes.push(active_write(&registry.active_id));

            writes
        };

        if let Some(discarded) = discarded {
            tracing::debug!(session_id = %discarded, "Discarded untouched placeholder");
            self.emit(SessionEventKind::Deleted, &discarded);
        }
        self.emit(SessionEventKind::Activated, &session_id);
        self.persist(writes).await;

        return Ok(());
    }

    /// Deletes a session after the user agrees. Returns false when the user
    /// declined, in which case nothing was touched.
    pub async fn delete(&self, session_id: &str, confirmer: &dyn Confirmer) -> Result<bool> {
        let session_id = self.lock().resolve(session_id);
        let session = self
            .get(&session_id)
            .ok_or_else(|| return anyhow!("No session found for id {session_id}"))?;

        if !confirmer.confirm_delete(&session).await {
            tracing::debug!(session_id = %session_id, "Delete declined");
            return Ok(false);
        }

        if !session.is_placeholder() {
            if let Err(err) = self.server.delete_session(&session_id).await {
                tracing::error!(error = ?err, session_id = %session_id, "Failed to delete session");
                bail!("Failed to delete session: {err}");
            }
        }

        self.forget(&session_id).await;
        return Ok(true);
    }

    /// Drops a session locally and clears the active pointer if it pointed
    /// there.
    async fn forget(&self, session_id: &str) {
        let writes = {
            let mut registry = self.lock();
            registry.sessions.remove(session_id);
            let mut writes: Writes = vec![(session_cache_key(session_id), None)];
            if registry.active_id.as_deref() == Some(session_id) {
                registry.active_id = None;
                writes.push(active_write(&None));
            }
            writes
        };

        self.emit(SessionEventKind::Deleted, session_id);
        self.persist(writes).await;
    }

    /// Branches a session on the server, optionally at a message, then
    /// registers and activates the copy.
    pub async fn fork(&self, session_id: &str, message_id: Option<&str>) -> Result<Session> {
        let session_id = self.lock().resolve(session_id);
        if is_placeholder_id(&session_id) {
            bail!("Failed to fork session: {session_id} has not been sent yet");
        }

        let info = match self.server.fork_session(&session_id, message_id).await {
            Ok(info) => info,
            Err(err) => {
                tracing::error!(error = ?err, session_id = %session_id, "Failed to fork session");
                bail!("Failed to fork session: {err}");
            }
        };

        let mut session = Session::from_info(info);
        if session.parent_id.is_none() {
            session.parent_id = Some(session_id.to_string());
        }
        let fork_id = session.id.to_string();
        self.lock().sessions.insert(fork_id.to_string(), session);
        self.emit(SessionEventKind::Forked, &fork_id);
        self.set_active(&fork_id).await?;

        return self
            .get(&fork_id)
            .ok_or_else(|| return anyhow!("Session {fork_id} vanished after fork"));
    }

    /// Every session, most recently updated first.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions = self.lock().sessions.values().cloned().collect::<Vec<Session>>();
        sessions.sort_by(|a, b| {
            return b
                .updated_at
                .cmp(&a.updated_at)
                .then_with(|| return a.id.cmp(&b.id));
        });

        return sessions;
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        let registry = self.lock();
        return registry.sessions.get(&registry.resolve(session_id)).cloned();
    }

    pub fn active(&self) -> Option<Session> {
        let registry = self.lock();
        return registry
            .active_id
            .as_ref()
            .and_then(|e| return registry.sessions.get(e))
            .cloned();
    }

    pub fn active_id(&self) -> Option<String> {
        return self.lock().active_id.clone();
    }

    /// Real id for a placeholder that has since been confirmed.
    pub fn resolve(&self, session_id: &str) -> String {
        return self.lock().resolve(session_id);
    }

    pub fn sessions_by_status(&self, status: SessionStatus) -> Vec<Session> {
        return self
            .list()
            .into_iter()
            .filter(|e| return e.status == status)
            .collect();
    }

    /// Bumps message count and activity time after a send or receive.
    pub async fn record_message(&self, session_id: &str, delta: u64) -> Result<()> {
        let now = now_millis();
        let session_id = self.resolve(session_id);
        let write = {
            let mut registry = self.lock();
            let session = registry
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| return anyhow!("No session found for id {session_id}"))?;
            session.message_count += delta;
            session.last_activity = now;
            session.updated_at = now;
            cache_write(session)
        };

        self.emit(SessionEventKind::Updated, &session_id);
        if !is_placeholder_id(&session_id) {
            self.persist(vec![write]).await;
        }

        return Ok(());
    }

    /// Sets a session's status. Activating goes through
    /// [`SessionStore::set_active`] so only one session is ever active.
    pub async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        if status == SessionStatus::Active {
            return self.set_active(session_id).await;
        }

        let session_id = self.resolve(session_id);
        let writes = {
            let mut registry = self.lock();
            let session = registry
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| return anyhow!("No session found for id {session_id}"))?;
            session.status = status;
            let mut writes = vec![cache_write(session)];
            if registry.active_id.as_deref() == Some(session_id.as_str()) {
                registry.active_id = None;
                writes.push(active_write(&None));
            }
            writes
        };

        self.emit(SessionEventKind::Updated, &session_id);
        self.persist(writes).await;

        return Ok(());
    }

    /// Keeps the registry in step with session lifecycle events pushed by
    /// the server. Returns whether anything changed.
    pub async fn apply_server_event(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Session { info, .. } => {
                let created = {
                    let mut registry = self.lock();
                    match registry.sessions.get_mut(&info.id) {
                        Some(session) => {
                            session.merge_info(info.clone());
                            false
                        }
                        None => {
                            registry
                                .sessions
                                .insert(info.id.to_string(), Session::from_info(info.clone()));
                            true
                        }
                    }
                };

                if created {
                    self.emit(SessionEventKind::Created, &info.id);
                } else {
                    self.emit(SessionEventKind::Updated, &info.id);
                }
                return true;
            }
            ServerEvent::SessionDeleted { session_id } => {
                if self.get(session_id).is_none() {
                    return false;
                }
                self.forget(session_id).await;
                return true;
            }
            _ => return false,
        }
    }
}
