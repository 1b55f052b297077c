use std::collections::HashMap;

use libtermkeep::{OutputSink, SessionCreateOptions, SessionManager, TermkeepError};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use termkeep_protocol::{
    AttachmentId, ClientMessage, DetachReason, ErrorCode, ServerMessage, SessionId,
};

/// Protocol state of one client connection.
///
/// The only state held here is which sessions this connection is attached
/// to. Every reply and all session output go out through `out`, the
/// connection's single output sink.
pub struct Connection {
    manager: SessionManager,
    out: OutputSink,
    attached: HashMap<SessionId, AttachmentId>,
}

impl Connection {
    pub fn new(manager: SessionManager, out: OutputSink) -> Self {
        Self {
            manager,
            out,
            attached: HashMap::new(),
        }
    }

    pub fn attached_sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.attached.keys()
    }

    /// Parse and dispatch one text frame. Malformed frames are answered
    /// with an error and otherwise ignored.
    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                warn!(error = %e, "malformed client message");
                self.reply(ServerMessage::error(
                    ErrorCode::InvalidRequest,
                    format!("invalid message: {e}"),
                ));
            }
        }
    }

    pub fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::CreateSession {
                rows,
                cols,
                name,
                working_directory,
                request_id,
            } => {
                let options = SessionCreateOptions {
                    name,
                    working_directory,
                    rows,
                    cols,
                    request_id: request_id.clone(),
                };
                match self.manager.create_session(options, self.out.clone()) {
                    Ok((session, attachment_id)) => {
                        self.attached.insert(session.id().clone(), attachment_id);
                    }
                    Err(e) => {
                        warn!(error = %e, "create_session failed");
                        let (code, message) = e.to_error_code();
                        self.reply(ServerMessage::Error {
                            code,
                            message,
                            session_id: None,
                            request_id,
                        });
                    }
                }
            }

            ClientMessage::ListSessions => {
                let sessions = self.manager.get_active_sessions();
                self.reply(ServerMessage::SessionList { sessions });
            }

            ClientMessage::ReattachSession {
                session_id,
                rows,
                cols,
            } => match self.manager.reattach_session(&session_id, self.out.clone()) {
                Ok((session, attachment_id)) => {
                    self.attached.insert(session_id.clone(), attachment_id);
                    if let Err(e) = session.resize(rows, cols) {
                        warn!(session_id = %session_id, error = %e, "resize after reattach failed");
                    }
                }
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "reattach refused");
                    self.reply_error(&e, session_id);
                }
            },

            ClientMessage::Input { session_id, data } => {
                let result = self.with_attachment(&session_id, |session, attachment_id| {
                    session.write_input(attachment_id, &data)
                });
                if let Err(e) = result {
                    self.reply_error(&e, session_id);
                }
            }

            ClientMessage::Resize {
                session_id,
                rows,
                cols,
            } => {
                let result = self.with_attachment(&session_id, |session, attachment_id| {
                    if !session.is_attached_by(attachment_id) {
                        return Err(TermkeepError::NotAttached(session.id().clone()));
                    }
                    session.resize(rows, cols)
                });
                if let Err(e) = result {
                    self.reply_error(&e, session_id);
                }
            }

            ClientMessage::RenameSession { session_id, name } => {
                match self.manager.set_session_name(&session_id, &name) {
                    Ok(name) => self.reply(ServerMessage::SessionRenamed { session_id, name }),
                    Err(e) => self.reply_error(&e, session_id),
                }
            }

            ClientMessage::CloseSession { session_id } => {
                self.attached.remove(&session_id);
                match self.manager.close_session(&session_id) {
                    Ok(viewer) => {
                        if let Some(viewer) = viewer.filter(|v| !v.same_channel(&self.out)) {
                            let _ = viewer.try_send(ServerMessage::SessionClosed {
                                session_id: session_id.clone(),
                            });
                        }
                        self.reply(ServerMessage::SessionClosed { session_id });
                    }
                    Err(e) => self.reply_error(&e, session_id),
                }
            }

            ClientMessage::DetachSession { session_id } => {
                match self.attached.remove(&session_id) {
                    Some(attachment_id) => {
                        self.manager.orphan_session(&session_id, &attachment_id);
                        self.reply(ServerMessage::SessionDetached {
                            session_id,
                            reason: DetachReason::Requested,
                        });
                    }
                    None => {
                        let e = TermkeepError::NotAttached(session_id.clone());
                        self.reply_error(&e, session_id);
                    }
                }
            }
        }
    }

    /// Orphan every session this connection is attached to. Called when the
    /// transport goes away; sessions keep running.
    pub fn close(mut self) -> usize {
        let held = self.attached.len();
        let orphaned = self.manager.orphan_sessions(self.attached.drain());
        debug!(held, orphaned, "connection closed");
        orphaned
    }

    /// Run `op` against a session this connection is attached to. Drops the
    /// local record when the attachment turns out to be stale.
    fn with_attachment<F>(&mut self, session_id: &str, op: F) -> Result<(), TermkeepError>
    where
        F: FnOnce(&libtermkeep::Session, &str) -> Result<(), TermkeepError>,
    {
        let Some(attachment_id) = self.attached.get(session_id).cloned() else {
            return Err(TermkeepError::NotAttached(session_id.to_string()));
        };
        let Some(session) = self.manager.get_session(session_id) else {
            self.attached.remove(session_id);
            return Err(TermkeepError::SessionNotFound(session_id.to_string()));
        };
        let result = op(&session, &attachment_id);
        if matches!(result, Err(TermkeepError::NotAttached(_))) {
            self.attached.remove(session_id);
        }
        result
    }

    fn reply(&self, message: ServerMessage) {
        match self.out.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(reply = ?dropped.session_id(), "reply dropped, connection is not reading");
            }
            Err(TrySendError::Closed(_)) => debug!("reply dropped, connection writer gone"),
        }
    }

    fn reply_error(&self, error: &TermkeepError, session_id: SessionId) {
        let (code, message) = error.to_error_code();
        self.reply(ServerMessage::session_error(code, message, session_id));
    }
}
