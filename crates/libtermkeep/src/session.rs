use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use termkeep_protocol::{
    AttachmentId, DetachReason, MAX_SESSION_NAME_CHARS, ServerMessage, SessionId, SessionInfo,
    SessionStatus,
};

use crate::error::TermkeepError;
use crate::output::OutputBuffer;

const READ_CHUNK_SIZE: usize = 4096;

/// Messages a connection's output queue holds. A viewer that lets it fill up
/// is detached as lagging.
pub const OUTPUT_QUEUE_CAPACITY: usize = 256;

/// Slots of a viewer's queue kept free for the lag notice.
const LAG_NOTICE_RESERVE: usize = 1;

/// Input chunks queued for the PTY writer thread.
pub const INPUT_QUEUE_CAPACITY: usize = 256;

/// Live output sink of one connection. Every message for that connection
/// flows through it, so replay and live output stay ordered.
pub type OutputSink = mpsc::Sender<ServerMessage>;

/// Caller-supplied options for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionCreateOptions {
    pub name: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    /// Echoed back in `session_created`.
    pub request_id: Option<String>,
}

/// Fully resolved parameters for spawning a session process.
#[derive(Debug, Clone)]
pub(crate) struct SpawnSpec {
    pub name: String,
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub rows: u16,
    pub cols: u16,
    pub buffer_size: usize,
}

/// PTY read side and child handle, handed to the reader thread.
pub(crate) struct PtyIo {
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// PTY write side and the queue feeding it, handed to the writer thread.
pub(crate) struct PtyInput {
    session_id: SessionId,
    writer: Box<dyn Write + Send>,
    queue: std::sync::mpsc::Receiver<Vec<u8>>,
}

impl PtyInput {
    /// Writer loop: ends when the session is dropped or the PTY goes away.
    pub(crate) fn run(self) {
        let PtyInput {
            session_id,
            mut writer,
            queue,
        } = self;
        for chunk in queue {
            if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                debug!(session_id = %session_id, error = %e, "pty write ended");
                break;
            }
        }
    }
}

struct Attachment {
    id: AttachmentId,
    sink: OutputSink,
}

struct SessionState {
    name: String,
    rows: u16,
    cols: u16,
    last_active_at: SystemTime,
    orphaned_at: Option<SystemTime>,
    attachment: Option<Attachment>,
    process_exited: bool,
    exit_code: Option<i32>,
    closed: bool,
    cleanup: Option<AbortHandle>,
    /// Bumped on every attach/detach; a cleanup timer only acts on the
    /// epoch it was armed for.
    orphan_epoch: u64,
}

/// One spawned PTY process, its scrollback, and its attachment state.
///
/// The reader thread writes every chunk into the ring buffer and, while an
/// attachment is installed, forwards the same chunk to it. Both happen under
/// the state lock that also guards attach, detach and cleanup.
pub struct Session {
    id: SessionId,
    working_directory: PathBuf,
    created_at: SystemTime,
    buffer: OutputBuffer,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input: std::sync::mpsc::SyncSender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Spawn the process and attach `sink` as the first viewer. Nothing is
    /// sent to the sink until `announce_created`.
    pub(crate) fn spawn(
        id: SessionId,
        spec: SpawnSpec,
        sink: OutputSink,
    ) -> Result<(Arc<Self>, AttachmentId, PtyIo, PtyInput), TermkeepError> {
        // portable-pty silently falls back to $HOME for a missing cwd.
        if !spec.cwd.is_dir() {
            return Err(TermkeepError::SpawnFailed(format!(
                "working directory {} does not exist",
                spec.cwd.display()
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermkeepError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermkeepError::SpawnFailed(e.to_string()))?;

        // Only the master side is kept; the reader sees EOF once the child
        // closes its end.
        drop(pair.slave);

        let mut killer = child.clone_killer();
        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(halves) => halves,
            Err(e) => {
                let _ = killer.kill();
                return Err(TermkeepError::PtyError(e.to_string()));
            }
        };

        let now = SystemTime::now();
        let attachment_id = uuid::Uuid::new_v4().to_string();
        let (input, queue) = std::sync::mpsc::sync_channel(INPUT_QUEUE_CAPACITY);
        let pty_input = PtyInput {
            session_id: id.clone(),
            writer,
            queue,
        };

        let session = Arc::new(Self {
            id,
            working_directory: spec.cwd,
            created_at: now,
            buffer: OutputBuffer::new(spec.buffer_size),
            master: Mutex::new(pair.master),
            input,
            killer: Mutex::new(killer),
            state: Mutex::new(SessionState {
                name: spec.name,
                rows: spec.rows,
                cols: spec.cols,
                last_active_at: now,
                orphaned_at: None,
                attachment: Some(Attachment {
                    id: attachment_id.clone(),
                    sink,
                }),
                process_exited: false,
                exit_code: None,
                closed: false,
                cleanup: None,
                orphan_epoch: 0,
            }),
        });

        Ok((session, attachment_id, PtyIo { reader, child }, pty_input))
    }

    /// Queue `session_created` for the creating viewer. Called once the
    /// session is registered and before its reader starts.
    pub(crate) fn announce_created(&self, request_id: Option<String>) {
        let state = self.lock_state();
        if let Some(attachment) = &state.attachment {
            let _ = attachment.sink.try_send(ServerMessage::SessionCreated {
                session_id: self.id.clone(),
                name: state.name.clone(),
                working_directory: self.working_directory.clone(),
                request_id,
            });
        }
    }

    /// Reader loop: runs on its own thread for the lifetime of the process.
    /// `on_lagged` is called with the new orphan epoch whenever a viewer is
    /// detached for not draining its queue.
    pub(crate) fn run_reader<F>(self: Arc<Self>, io: PtyIo, on_lagged: F)
    where
        F: Fn(&Arc<Self>, u64),
    {
        let PtyIo {
            mut reader,
            mut child,
        } = io;
        let mut buf = [0u8; READ_CHUNK_SIZE];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(epoch) = self.record_output(&buf[..n]) {
                        on_lagged(&self, epoch);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is how Linux reports a hung-up PTY.
                    debug!(session_id = %self.id, error = %e, "pty read ended");
                    break;
                }
            }
        }

        let exit_code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).ok(),
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "failed to reap session process");
                None
            }
        };
        self.record_exit(exit_code);
    }

    /// Buffer a chunk and forward it to the viewer. Returns the orphan epoch
    /// when the viewer had to be detached because its queue is full.
    fn record_output(&self, data: &[u8]) -> Option<u64> {
        let mut state = self.lock_state();
        self.buffer.write(data);
        let now = SystemTime::now();
        state.last_active_at = now;

        let attachment = state.attachment.as_ref()?;
        let delivered = attachment.sink.capacity() > LAG_NOTICE_RESERVE
            && !matches!(
                attachment.sink.try_send(ServerMessage::Output {
                    session_id: self.id.clone(),
                    data: data.to_vec(),
                }),
                Err(TrySendError::Full(_))
            );
        if delivered {
            return None;
        }

        let lagging = state.attachment.take()?;
        warn!(
            session_id = %self.id,
            attachment_id = %lagging.id,
            "viewer stopped draining output, detaching"
        );
        let _ = lagging.sink.try_send(ServerMessage::SessionDetached {
            session_id: self.id.clone(),
            reason: DetachReason::Lagged,
        });
        state.orphaned_at = Some(now);
        state.orphan_epoch += 1;
        Some(state.orphan_epoch)
    }

    fn record_exit(&self, exit_code: Option<i32>) {
        let mut state = self.lock_state();
        state.process_exited = true;
        state.exit_code = exit_code;
        if let Some(attachment) = &state.attachment {
            let _ = attachment.sink.try_send(ServerMessage::SessionExited {
                session_id: self.id.clone(),
                exit_code,
            });
        }
        info!(session_id = %self.id, exit_code = ?exit_code, "session process exited");
    }

    /// Install `sink` as the attached writer, replaying the scrollback first.
    ///
    /// Any previous attachment is displaced (last attach wins) and told so.
    /// A pending cleanup timer is cancelled. Fails without side effects when
    /// `sink` has no room for the replay.
    pub fn attach(&self, sink: OutputSink) -> Result<AttachmentId, TermkeepError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(TermkeepError::SessionNotFound(self.id.clone()));
        }
        if state.process_exited {
            return Err(TermkeepError::SessionExited(self.id.clone()));
        }
        if sink.capacity() < 2 + LAG_NOTICE_RESERVE {
            return Err(TermkeepError::OutputQueueFull);
        }

        if let Some(cleanup) = state.cleanup.take() {
            cleanup.abort();
        }
        state.orphan_epoch += 1;

        if let Some(previous) = state.attachment.take() {
            if !previous.sink.same_channel(&sink) {
                let _ = previous.sink.try_send(ServerMessage::SessionDetached {
                    session_id: self.id.clone(),
                    reason: DetachReason::Displaced,
                });
            }
            debug!(session_id = %self.id, attachment_id = %previous.id, "attachment displaced");
        }

        let _ = sink.try_send(ServerMessage::SessionReattached {
            session_id: self.id.clone(),
            name: state.name.clone(),
            working_directory: Some(self.working_directory.clone()),
        });
        let _ = sink.try_send(ServerMessage::Scrollback {
            session_id: self.id.clone(),
            data: self.buffer.read_all(),
        });

        let attachment_id = uuid::Uuid::new_v4().to_string();
        state.attachment = Some(Attachment {
            id: attachment_id.clone(),
            sink,
        });
        state.orphaned_at = None;
        state.last_active_at = SystemTime::now();
        Ok(attachment_id)
    }

    /// Clear the attachment if `attachment_id` is still the installed one.
    ///
    /// Returns the new orphan epoch when the session became orphaned, `None`
    /// when the attachment had already been displaced or removed.
    pub fn detach(&self, attachment_id: &str) -> Option<u64> {
        let mut state = self.lock_state();
        match &state.attachment {
            Some(current) if current.id == attachment_id => {}
            _ => return None,
        }
        state.attachment = None;
        state.orphaned_at = Some(SystemTime::now());
        state.orphan_epoch += 1;
        Some(state.orphan_epoch)
    }

    /// Remember the cleanup timer armed for `epoch`. Aborts it right away if
    /// the session was reattached or closed in the meantime.
    pub(crate) fn set_cleanup(&self, epoch: u64, handle: AbortHandle) {
        let mut state = self.lock_state();
        if state.closed || state.attachment.is_some() || state.orphan_epoch != epoch {
            handle.abort();
            return;
        }
        if let Some(stale) = state.cleanup.replace(handle) {
            stale.abort();
        }
    }

    /// Called by the cleanup timer. Marks the session closed only if it is
    /// still orphaned on the same epoch; whoever takes the state lock first
    /// between this and `attach` wins.
    pub(crate) fn try_expire(&self, epoch: u64) -> bool {
        let mut state = self.lock_state();
        if state.closed || state.attachment.is_some() || state.orphan_epoch != epoch {
            return false;
        }
        state.closed = true;
        state.cleanup = None;
        true
    }

    /// Close the session: kill the process and drop the scrollback.
    /// Returns the sink that was attached, if any.
    pub(crate) fn terminate(&self) -> Option<OutputSink> {
        let attachment = {
            let mut state = self.lock_state();
            if state.closed {
                return None;
            }
            state.closed = true;
            if let Some(cleanup) = state.cleanup.take() {
                cleanup.abort();
            }
            state.attachment.take()
        };
        self.release();
        attachment.map(|a| a.sink)
    }

    /// Kill the process and reset the buffer. Safe to call more than once.
    pub(crate) fn release(&self) {
        let exited = self.lock_state().process_exited;
        if !exited {
            let mut killer = self.killer.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = killer.kill() {
                debug!(session_id = %self.id, error = %e, "kill failed, process likely gone");
            }
        }
        self.buffer.reset();
    }

    pub fn rename(&self, name: &str) -> Result<String, TermkeepError> {
        let name = validate_name(name)?;
        self.lock_state().name = name.clone();
        Ok(name)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), TermkeepError> {
        self.master
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermkeepError::PtyError(e.to_string()))?;
        let mut state = self.lock_state();
        state.rows = rows;
        state.cols = cols;
        Ok(())
    }

    /// Queue input for the PTY writer thread. Only the current attachment may
    /// type. Never blocks; a child that stops reading fills the queue and
    /// further input is refused.
    pub fn write_input(&self, attachment_id: &str, data: &[u8]) -> Result<(), TermkeepError> {
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(TermkeepError::SessionNotFound(self.id.clone()));
            }
            if state.process_exited {
                return Err(TermkeepError::SessionExited(self.id.clone()));
            }
            if !matches!(&state.attachment, Some(a) if a.id == attachment_id) {
                return Err(TermkeepError::NotAttached(self.id.clone()));
            }
            state.last_active_at = SystemTime::now();
        }

        match self.input.try_send(data.to_vec()) {
            Ok(()) => Ok(()),
            Err(std::sync::mpsc::TrySendError::Full(_)) => {
                Err(TermkeepError::InputQueueFull(self.id.clone()))
            }
            Err(std::sync::mpsc::TrySendError::Disconnected(_)) => Err(TermkeepError::PtyError(
                "pty input closed".to_string(),
            )),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn name(&self) -> String {
        self.lock_state().name.clone()
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn size(&self) -> (u16, u16) {
        let state = self.lock_state();
        (state.rows, state.cols)
    }

    pub fn is_orphaned(&self) -> bool {
        self.lock_state().attachment.is_none()
    }

    pub fn orphaned_at(&self) -> Option<SystemTime> {
        self.lock_state().orphaned_at
    }

    pub fn is_attached_by(&self, attachment_id: &str) -> bool {
        matches!(&self.lock_state().attachment, Some(a) if a.id == attachment_id)
    }

    pub fn process_exited(&self) -> bool {
        self.lock_state().process_exited
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock_state().exit_code
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn has_pending_cleanup(&self) -> bool {
        self.lock_state().cleanup.is_some()
    }

    /// Current scrollback, oldest byte first.
    pub fn scrollback(&self) -> Vec<u8> {
        self.buffer.read_all()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.lock_state();
        SessionInfo {
            id: self.id.clone(),
            name: state.name.clone(),
            status: if state.process_exited {
                SessionStatus::Exited
            } else {
                SessionStatus::Running
            },
            created_at: epoch_ms(self.created_at),
            last_active_at: epoch_ms(state.last_active_at),
            working_directory: self.working_directory.clone(),
            attached: state.attachment.is_some(),
            exit_code: state.exit_code,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("working_directory", &self.working_directory)
            .finish_non_exhaustive()
    }
}

/// Trim and bound-check a user-supplied session name.
pub fn validate_name(name: &str) -> Result<String, TermkeepError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TermkeepError::InvalidName(
            "name must not be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_SESSION_NAME_CHARS {
        return Err(TermkeepError::InvalidName(format!(
            "name exceeds {MAX_SESSION_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
