use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use termkeep_protocol::{
    ClientMessage, MAX_SESSION_NAME_CHARS, ServerMessage, SessionId, SessionInfo,
};

use crate::matcher::{TabAction, apply_created, plan_reconnect};
use crate::tabs::{TabIdentity, TabStore};

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket connection to a termkeep server.
///
/// Messages that arrive while a request waits for its reply are queued and
/// handed out by later `recv` calls, so no output is lost.
pub struct ClientConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<ServerMessage>,
    reply_timeout: Duration,
}

impl ClientConnection {
    /// Connect to `url`, e.g. `ws://127.0.0.1:8787/ws`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to termkeep server at {url}"))?;
        debug!(url, "connected to termkeep server");
        Ok(Self {
            ws,
            pending: VecDeque::new(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.ws
            .send(Message::text(json))
            .await
            .context("failed to send message")
    }

    /// Next server message, or `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        self.read_frame().await
    }

    /// Send input bytes to a session.
    pub async fn send_input(&mut self, session_id: &str, data: &[u8]) -> Result<()> {
        self.send(&ClientMessage::Input {
            session_id: session_id.to_string(),
            data: data.to_vec(),
        })
        .await
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>> {
        self.send(&ClientMessage::ListSessions).await?;
        let reply = self
            .wait_for(|m| matches!(m, ServerMessage::SessionList { .. }))
            .await?;
        match reply {
            ServerMessage::SessionList { sessions } => Ok(sessions),
            other => bail!("unexpected reply to list_sessions: {other:?}"),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await.context("failed to close websocket")
    }

    async fn read_frame(&mut self) -> Result<Option<ServerMessage>> {
        while let Some(frame) = self.ws.next().await {
            match frame.context("websocket read failed")? {
                Message::Text(text) => {
                    let msg = serde_json::from_str(text.as_str())
                        .context("invalid message from server")?;
                    return Ok(Some(msg));
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Read until `matches` accepts a message, queueing everything else.
    async fn wait_for<F>(&mut self, matches: F) -> Result<ServerMessage>
    where
        F: Fn(&ServerMessage) -> bool,
    {
        if let Some(pos) = self.pending.iter().position(&matches) {
            return self
                .pending
                .remove(pos)
                .ok_or_else(|| anyhow!("pending queue changed underneath"));
        }
        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.read_frame())
                .await
                .context("timed out waiting for server reply")??
                .ok_or_else(|| anyhow!("server closed connection"))?;
            if matches(&msg) {
                return Ok(msg);
            }
            self.pending.push_back(msg);
        }
    }
}

/// A tab after reconnecting: its (possibly updated) identity, the session it
/// now points at, and the scrollback replayed on reattach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumedTab {
    pub identity: TabIdentity,
    /// `None` when the server refused to create a session for this tab.
    pub session_id: Option<SessionId>,
    pub reattached: bool,
    pub scrollback: Vec<u8>,
    /// Server's reason for refusing the tab.
    pub error: Option<String>,
}

/// Drives the reconnect handshake for every persisted tab of a workspace.
pub struct Reconnector<S> {
    store: S,
    rows: u16,
    cols: u16,
}

impl<S: TabStore> Reconnector<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            rows: 24,
            cols: 80,
        }
    }

    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// List, plan, then reattach or recreate every tab.
    ///
    /// A tab the server refuses is reported in its `ResumedTab` and the rest
    /// carry on. The store is saved after every tab whose identity changed,
    /// so a dropped connection never loses sessions already created.
    pub async fn resume(&self, conn: &mut ClientConnection) -> Result<Vec<ResumedTab>> {
        let mut tabs = self.store.load()?;
        let sessions = conn.list_sessions().await?;
        let plan = plan_reconnect(&tabs, &sessions);
        info!(tabs = tabs.len(), server_sessions = sessions.len(), "reconnecting tabs");

        let mut resumed = Vec::with_capacity(tabs.len());
        for action in plan {
            let tab_index = action.tab_index();
            let reattached = match action {
                TabAction::Reattach { session_id, .. } => self
                    .reattach(conn, &session_id)
                    .await?
                    .map(|scrollback| (session_id, scrollback)),
                TabAction::Recreate { discard, .. } => {
                    if let Some(exited) = discard {
                        self.discard(conn, &exited).await?;
                    }
                    None
                }
            };

            let tab = match reattached {
                Some((session_id, scrollback)) => ResumedTab {
                    identity: tabs[tab_index].clone(),
                    session_id: Some(session_id),
                    reattached: true,
                    scrollback,
                    error: None,
                },
                None => {
                    let created = self.create(conn, &tabs[tab_index], tab_index).await?;
                    let error = match created {
                        Ok(session_id) => {
                            apply_created(&mut tabs, tab_index, session_id);
                            None
                        }
                        Err(message) => {
                            tabs[tab_index].server_session_id = None;
                            Some(message)
                        }
                    };
                    self.store.save(&tabs)?;
                    ResumedTab {
                        identity: tabs[tab_index].clone(),
                        session_id: tabs[tab_index].server_session_id.clone(),
                        reattached: false,
                        scrollback: Vec::new(),
                        error,
                    }
                }
            };
            resumed.push(tab);
        }

        Ok(resumed)
    }

    /// Returns the scrollback, or `None` when the server refused (the session
    /// vanished between listing and reattaching).
    async fn reattach(
        &self,
        conn: &mut ClientConnection,
        session_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        conn.send(&ClientMessage::ReattachSession {
            session_id: session_id.to_string(),
            rows: self.rows,
            cols: self.cols,
        })
        .await?;

        let reply = conn
            .wait_for(|m| {
                m.session_id() == Some(session_id)
                    && matches!(
                        m,
                        ServerMessage::SessionReattached { .. } | ServerMessage::Error { .. }
                    )
            })
            .await?;
        if let ServerMessage::Error { code, message, .. } = reply {
            warn!(session_id, ?code, %message, "reattach refused, recreating");
            return Ok(None);
        }

        let scrollback = conn
            .wait_for(|m| {
                m.session_id() == Some(session_id) && matches!(m, ServerMessage::Scrollback { .. })
            })
            .await?;
        match scrollback {
            ServerMessage::Scrollback { data, .. } => Ok(Some(data)),
            other => bail!("expected scrollback, got {other:?}"),
        }
    }

    /// The inner error is the server's refusal; the outer one is a broken
    /// connection.
    async fn create(
        &self,
        conn: &mut ClientConnection,
        tab: &TabIdentity,
        tab_index: usize,
    ) -> Result<Result<SessionId, String>> {
        let request_id = format!("tab-{tab_index}");
        let name = session_name(&tab.name);
        conn.send(&ClientMessage::CreateSession {
            rows: self.rows,
            cols: self.cols,
            name,
            working_directory: None,
            request_id: Some(request_id.clone()),
        })
        .await?;

        let reply = conn
            .wait_for(|m| match m {
                ServerMessage::SessionCreated { request_id: r, .. }
                | ServerMessage::Error { request_id: r, .. } => {
                    r.as_deref() == Some(request_id.as_str())
                }
                _ => false,
            })
            .await?;
        match reply {
            ServerMessage::SessionCreated { session_id, .. } => {
                debug!(session_id = %session_id, tab = %tab.name, "session created for tab");
                Ok(Ok(session_id))
            }
            ServerMessage::Error { code, message, .. } => {
                warn!(tab = %tab.name, ?code, %message, "server refused to create session");
                Ok(Err(format!("{code:?}: {message}")))
            }
            other => bail!("unexpected reply to create_session: {other:?}"),
        }
    }

    /// Close an exited session the tab no longer needs.
    async fn discard(&self, conn: &mut ClientConnection, session_id: &str) -> Result<()> {
        conn.send(&ClientMessage::CloseSession {
            session_id: session_id.to_string(),
        })
        .await?;
        let reply = conn
            .wait_for(|m| {
                m.session_id() == Some(session_id)
                    && matches!(
                        m,
                        ServerMessage::SessionClosed { .. } | ServerMessage::Error { .. }
                    )
            })
            .await?;
        if let ServerMessage::Error { message, .. } = reply {
            debug!(session_id, %message, "exited session already gone");
        }
        Ok(())
    }
}

/// Tab names are free-form; session names are trimmed and bounded.
fn session_name(tab_name: &str) -> Option<String> {
    let name = tab_name.trim();
    if name.is_empty() {
        return None;
    }
    Some(name.chars().take(MAX_SESSION_NAME_CHARS).collect())
}
