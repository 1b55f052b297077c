use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use termkeep_protocol::{AttachmentId, DEFAULT_OUTPUT_BUFFER_SIZE, SessionId, SessionInfo};

use crate::error::TermkeepError;
use crate::session::{OutputSink, Session, SessionCreateOptions, SpawnSpec, validate_name};

/// Queue slots a sink needs free before a session is created on it.
const CREATE_QUEUE_HEADROOM: usize = 2;

/// Settings shared by every session a manager creates.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Delay after orphaning before a session is cleaned up.
    /// `Duration::ZERO` keeps orphans until they are closed explicitly.
    pub orphan_grace_period: Duration,
    pub output_buffer_size: usize,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub default_cwd: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            orphan_grace_period: Duration::ZERO,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            shell: "/bin/bash".to_string(),
            shell_args: Vec::new(),
            default_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        }
    }
}

/// Process-wide registry of sessions.
///
/// The only place sessions are created or removed. Cloning is cheap and every
/// clone refers to the same map.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    config: ManagerConfig,
    next_ordinal: AtomicU64,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                config,
                next_ordinal: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Spawn a new session attached to `sink`.
    ///
    /// `session_created` is queued on the sink only after the session is
    /// registered and its threads are running, and always before any output.
    /// Nothing is registered and nothing is sent when spawning fails.
    pub fn create_session(
        &self,
        options: SessionCreateOptions,
        sink: OutputSink,
    ) -> Result<(Arc<Session>, AttachmentId), TermkeepError> {
        let config = &self.inner.config;
        let ordinal = self.inner.next_ordinal.fetch_add(1, Ordering::Relaxed);
        let name = match options.name.as_deref() {
            Some(name) => validate_name(name)?,
            None => format!("Terminal {ordinal}"),
        };
        if sink.capacity() < CREATE_QUEUE_HEADROOM {
            return Err(TermkeepError::OutputQueueFull);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let spec = SpawnSpec {
            name,
            shell: config.shell.clone(),
            args: config.shell_args.clone(),
            cwd: options
                .working_directory
                .unwrap_or_else(|| config.default_cwd.clone()),
            rows: options.rows,
            cols: options.cols,
            buffer_size: config.output_buffer_size,
        };

        let (session, attachment_id, io, input) = Session::spawn(session_id.clone(), spec, sink)?;

        let spawned = std::thread::Builder::new()
            .name(format!("pty-writer-{}", short_id(&session_id)))
            .spawn(move || input.run());
        if let Err(e) = spawned {
            session.terminate();
            return Err(TermkeepError::Io(e));
        }

        // The reader waits on the gate so nothing reaches the sink before
        // `session_created`.
        let (open_gate, gate) = std::sync::mpsc::sync_channel::<bool>(1);
        let reader = Arc::clone(&session);
        let on_lagged = self.lag_handler();
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reader-{}", short_id(&session_id)))
            .spawn(move || {
                if gate.recv() == Ok(true) {
                    reader.run_reader(io, on_lagged);
                }
            });
        if let Err(e) = spawned {
            session.terminate();
            return Err(TermkeepError::Io(e));
        }

        self.write_sessions()
            .insert(session_id.clone(), Arc::clone(&session));
        session.announce_created(options.request_id);
        let _ = open_gate.send(true);
        info!(
            session_id = %session_id,
            name = %session.name(),
            cwd = %session.working_directory().display(),
            "session created"
        );
        Ok((session, attachment_id))
    }

    /// Detach `attachment_id` from the session, leaving the process running.
    ///
    /// Returns whether the session became orphaned. Unknown sessions and
    /// stale attachment IDs are ignored.
    pub fn orphan_session(&self, session_id: &str, attachment_id: &str) -> bool {
        let Some(session) = self.get_session(session_id) else {
            return false;
        };
        let Some(epoch) = session.detach(attachment_id) else {
            debug!(session_id = %session_id, "attachment already replaced, not orphaning");
            return false;
        };

        let grace = self.inner.config.orphan_grace_period;
        info!(session_id = %session_id, grace_secs = grace.as_secs_f64(), "session orphaned");
        if !grace.is_zero() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => self.arm_cleanup(&runtime, session, epoch, grace),
                Err(_) => {
                    warn!(session_id = %session_id, "no async runtime, orphan cleanup disabled")
                }
            }
        }
        true
    }

    /// Orphan every `(session_id, attachment_id)` pair; used when a
    /// connection goes away.
    pub fn orphan_sessions<I>(&self, attachments: I) -> usize
    where
        I: IntoIterator<Item = (SessionId, AttachmentId)>,
    {
        attachments
            .into_iter()
            .filter(|(session_id, attachment_id)| self.orphan_session(session_id, attachment_id))
            .count()
    }

    /// Attach `sink` to an existing, still running session.
    ///
    /// The scrollback is queued on the sink (after `session_reattached`)
    /// before any further live output.
    pub fn reattach_session(
        &self,
        session_id: &str,
        sink: OutputSink,
    ) -> Result<(Arc<Session>, AttachmentId), TermkeepError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| TermkeepError::SessionNotFound(session_id.to_string()))?;
        let attachment_id = session.attach(sink)?;
        info!(session_id = %session_id, "session reattached");
        Ok((session, attachment_id))
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.read_sessions().get(session_id).cloned()
    }

    /// Snapshot of every registered session, oldest first.
    pub fn get_active_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.read_sessions().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        infos
    }

    pub fn set_session_name(&self, session_id: &str, name: &str) -> Result<String, TermkeepError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| TermkeepError::SessionNotFound(session_id.to_string()))?;
        let name = session.rename(name)?;
        debug!(session_id = %session_id, name = %name, "session renamed");
        Ok(name)
    }

    /// Remove the session and kill its process.
    ///
    /// Returns the sink that was attached at the time, so the caller can
    /// notify that viewer.
    pub fn close_session(&self, session_id: &str) -> Result<Option<OutputSink>, TermkeepError> {
        let session = self
            .write_sessions()
            .remove(session_id)
            .ok_or_else(|| TermkeepError::SessionNotFound(session_id.to_string()))?;
        let attached = session.terminate();
        info!(session_id = %session_id, "session closed");
        Ok(attached)
    }

    /// Terminate every session. Used on server shutdown.
    pub fn shutdown(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.write_sessions().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.terminate();
        }
        info!(count = sessions.len(), "all sessions terminated");
        sessions.len()
    }

    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called on a reader thread when a viewer is dropped for lagging. The
    /// session is orphaned like on a disconnect, so the grace timer applies.
    fn lag_handler(&self) -> impl Fn(&Arc<Session>, u64) + Send + 'static {
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let runtime = tokio::runtime::Handle::try_current().ok();
        move |session: &Arc<Session>, epoch: u64| {
            let Some(inner) = registry.upgrade() else {
                return;
            };
            let manager = SessionManager { inner };
            let grace = manager.inner.config.orphan_grace_period;
            info!(
                session_id = %session.id(),
                grace_secs = grace.as_secs_f64(),
                "lagging session orphaned"
            );
            if grace.is_zero() {
                return;
            }
            match &runtime {
                Some(runtime) => manager.arm_cleanup(runtime, Arc::clone(session), epoch, grace),
                None => {
                    warn!(session_id = %session.id(), "no async runtime, orphan cleanup disabled")
                }
            }
        }
    }

    fn arm_cleanup(
        &self,
        runtime: &tokio::runtime::Handle,
        session: Arc<Session>,
        epoch: u64,
        grace: Duration,
    ) {
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let target = Arc::clone(&session);
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = registry.upgrade() {
                SessionManager { inner }.expire_orphan(&target, epoch);
            }
        });
        session.set_cleanup(epoch, task.abort_handle());
    }

    fn expire_orphan(&self, session: &Arc<Session>, epoch: u64) {
        // Decided under the session lock; a concurrent reattach either already
        // bumped the epoch or will find the session closed.
        if !session.try_expire(epoch) {
            debug!(session_id = %session.id(), "cleanup skipped, session reattached");
            return;
        }
        session.release();

        let mut sessions = self.write_sessions();
        if sessions
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.id());
        }
        drop(sessions);
        info!(session_id = %session.id(), "orphaned session cleaned up");
    }

    fn read_sessions(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

fn short_id(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OUTPUT_QUEUE_CAPACITY;
    use termkeep_protocol::{ServerMessage, SessionStatus};
    use tokio::sync::mpsc;

    fn config(grace: Duration) -> ManagerConfig {
        ManagerConfig {
            orphan_grace_period: grace,
            output_buffer_size: 1024,
            shell: "/bin/cat".to_string(),
            shell_args: Vec::new(),
            default_cwd: std::env::temp_dir(),
        }
    }

    fn options() -> SessionCreateOptions {
        SessionCreateOptions {
            rows: 24,
            cols: 80,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_list_session() {
        let mgr = SessionManager::new(config(Duration::ZERO));
        assert!(mgr.get_active_sessions().is_empty());

        let (tx, mut rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (session, _att) = mgr.create_session(options(), tx).unwrap();

        let list = mgr.get_active_sessions();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, *session.id());
        assert_eq!(list[0].name, "Terminal 1");
        assert_eq!(list[0].status, SessionStatus::Running);
        assert_eq!(list[0].working_directory, std::env::temp_dir());
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::SessionCreated { .. })));
        mgr.shutdown();
    }

    #[tokio::test]
    async fn invalid_name_registers_nothing() {
        let mgr = SessionManager::new(config(Duration::ZERO));
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let opts = SessionCreateOptions {
            name: Some("n".repeat(51)),
            ..options()
        };
        assert!(matches!(
            mgr.create_session(opts, tx),
            Err(TermkeepError::InvalidName(_))
        ));
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_registers_nothing() {
        let mut cfg = config(Duration::ZERO);
        cfg.shell = "/nonexistent/shell".to_string();
        let mgr = SessionManager::new(cfg);
        let (tx, mut rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        assert!(matches!(
            mgr.create_session(options(), tx),
            Err(TermkeepError::SpawnFailed(_))
        ));
        assert!(mgr.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reattach_unknown_session_is_not_found() {
        let mgr = SessionManager::new(config(Duration::ZERO));
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        assert!(matches!(
            mgr.reattach_session("missing", tx),
            Err(TermkeepError::SessionNotFound(_))
        ));
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn rename_session() {
        let mgr = SessionManager::new(config(Duration::ZERO));
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (session, _att) = mgr.create_session(options(), tx).unwrap();
        assert_eq!(mgr.set_session_name(session.id(), "deploy").unwrap(), "deploy");
        assert_eq!(mgr.get_active_sessions()[0].name, "deploy");
        assert!(mgr.set_session_name(session.id(), &"x".repeat(60)).is_err());
        assert!(mgr.set_session_name("missing", "x").is_err());
        mgr.shutdown();
    }

    #[tokio::test]
    async fn close_removes_session_and_returns_sink() {
        let mgr = SessionManager::new(config(Duration::ZERO));
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (session, _att) = mgr.create_session(options(), tx).unwrap();
        let id = session.id().clone();

        assert!(mgr.close_session(&id).unwrap().is_some());
        assert!(mgr.get_session(&id).is_none());
        assert!(session.is_closed());
        assert!(matches!(
            mgr.close_session(&id),
            Err(TermkeepError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn stale_attachment_does_not_orphan() {
        let mgr = SessionManager::new(config(Duration::ZERO));
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (session, first) = mgr.create_session(options(), tx).unwrap();
        let (tx2, _rx2) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (_, second) = mgr.reattach_session(session.id(), tx2).unwrap();

        assert!(!mgr.orphan_session(session.id(), &first));
        assert!(!session.is_orphaned());
        assert!(mgr.orphan_session(session.id(), &second));
        assert!(session.is_orphaned());
        mgr.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_orphan_is_removed() {
        let mgr = SessionManager::new(config(Duration::from_secs(30)));
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (session, att) = mgr.create_session(options(), tx).unwrap();

        assert!(mgr.orphan_session(session.id(), &att));
        assert!(session.has_pending_cleanup());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(mgr.get_session(session.id()).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(mgr.get_session(session.id()).is_none());
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_between_orphanings_restarts_the_grace_period() {
        let mgr = SessionManager::new(config(Duration::from_secs(30)));
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (session, att) = mgr.create_session(options(), tx).unwrap();
        assert!(mgr.orphan_session(session.id(), &att));

        tokio::time::sleep(Duration::from_secs(20)).await;
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (_, att) = mgr.reattach_session(session.id(), tx).unwrap();
        assert!(!session.has_pending_cleanup());
        assert!(mgr.orphan_session(session.id(), &att));

        // Past the first deadline, short of the second.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(mgr.get_session(session.id()).is_some());
        assert!(!session.is_closed());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(mgr.get_session(session.id()).is_none());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn expiry_for_a_stale_epoch_keeps_the_session() {
        let mgr = SessionManager::new(config(Duration::ZERO));
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (session, att) = mgr.create_session(options(), tx).unwrap();
        let stale = session.detach(&att).unwrap();
        let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        mgr.reattach_session(session.id(), tx).unwrap();

        mgr.expire_orphan(&session, stale);
        assert!(mgr.get_session(session.id()).is_some());
        assert!(!session.is_closed());
        mgr.shutdown();
    }

    #[tokio::test]
    async fn full_sink_is_refused_before_spawning() {
        let mgr = SessionManager::new(config(Duration::ZERO));
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            mgr.create_session(options(), tx),
            Err(TermkeepError::OutputQueueFull)
        ));
        assert!(mgr.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_everything() {
        let mgr = SessionManager::new(config(Duration::from_secs(5)));
        for _ in 0..3 {
            let (tx, _rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
            mgr.create_session(options(), tx).unwrap();
        }
        assert_eq!(mgr.len(), 3);
        assert_eq!(mgr.shutdown(), 3);
        assert!(mgr.is_empty());
    }
}
