use anyhow::{Context, Result, bail};
use libtermkeep::{ManagerConfig, SessionManager};
use std::net::SocketAddr;
use std::time::Duration;
use termkeep_client::{ClientConnection, JsonFileTabStore, Reconnector, TabIdentity, TabStore};
use termkeep_protocol::ServerMessage;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep, timeout};

struct TestServer {
    addr: SocketAddr,
    manager: SessionManager,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        Self::start_with_shell("/bin/cat").await
    }

    async fn start_with_shell(shell: &str) -> Result<Self> {
        let manager = SessionManager::new(ManagerConfig {
            orphan_grace_period: Duration::ZERO,
            output_buffer_size: 16 * 1024,
            shell: shell.to_string(),
            shell_args: Vec::new(),
            default_cwd: std::env::temp_dir(),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(termkeep_server::serve(listener, manager.clone(), async {
            let _ = stopped.await;
        }));
        Ok(Self {
            addr,
            manager,
            stop: Some(stop),
            task,
        })
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn wait_all_orphaned(&self) -> Result<()> {
        let start = Instant::now();
        while self.manager.get_active_sessions().iter().any(|s| s.attached) {
            if start.elapsed() > Duration::from_secs(5) {
                bail!("sessions still attached after disconnect");
            }
            sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    async fn stop(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(Duration::from_secs(5), self.task).await???;
        Ok(())
    }
}

async fn recv_until(conn: &mut ClientConnection, what: &str, pred: impl Fn(&ServerMessage) -> bool) -> Result<()> {
    let found = timeout(Duration::from_secs(5), async {
        while let Some(msg) = conn.recv().await? {
            if pred(&msg) {
                return Ok::<bool, anyhow::Error>(true);
            }
        }
        Ok(false)
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))??;
    if !found {
        bail!("connection closed before {what}");
    }
    Ok(())
}

fn workspace_store(dir: &tempfile::TempDir) -> Result<JsonFileTabStore> {
    let store = JsonFileTabStore::new(dir.path(), "acme/web");
    store.save(&[TabIdentity::new("editor", 0), TabIdentity::new("logs", 1)])?;
    Ok(store)
}

#[tokio::test]
async fn tabs_reattach_after_page_reload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = workspace_store(&dir)?;
    let server = TestServer::start().await?;

    let mut conn = ClientConnection::connect(&server.url()).await?;
    let first = Reconnector::new(store.clone()).resume(&mut conn).await?;
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|t| !t.reattached && t.session_id.is_some()));
    assert_ne!(first[0].session_id, first[1].session_id);

    let persisted = store.load()?;
    assert_eq!(persisted[0].server_session_id, first[0].session_id);
    assert_eq!(persisted[1].server_session_id, first[1].session_id);

    let editor = first[0].session_id.clone().context("editor session")?;
    conn.send_input(&editor, b"marker-2718\n").await?;
    recv_until(&mut conn, "echoed marker", |m| {
        matches!(m, ServerMessage::Output { session_id, data }
            if *session_id == editor && String::from_utf8_lossy(data).contains("marker-2718"))
    })
    .await?;

    conn.close().await?;
    server.wait_all_orphaned().await?;

    let mut conn = ClientConnection::connect(&server.url()).await?;
    let second = Reconnector::new(store.clone()).resume(&mut conn).await?;
    assert!(second.iter().all(|t| t.reattached));
    assert_eq!(second[0].session_id, first[0].session_id);
    assert_eq!(second[1].session_id, first[1].session_id);
    assert!(String::from_utf8_lossy(&second[0].scrollback).contains("marker-2718"));
    assert!(!String::from_utf8_lossy(&second[1].scrollback).contains("marker-2718"));
    assert_eq!(server.manager.len(), 2);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn server_restart_recreates_every_tab_in_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = workspace_store(&dir)?;

    let server = TestServer::start().await?;
    let mut conn = ClientConnection::connect(&server.url()).await?;
    let before = Reconnector::new(store.clone()).resume(&mut conn).await?;
    conn.close().await?;
    server.stop().await?;

    // All in-memory state is gone with the old server.
    let server = TestServer::start().await?;
    let mut conn = ClientConnection::connect(&server.url()).await?;
    let after = Reconnector::new(store.clone()).resume(&mut conn).await?;

    assert!(after.iter().all(|t| !t.reattached));
    let names: Vec<_> = after.iter().map(|t| t.identity.name.as_str()).collect();
    assert_eq!(names, ["editor", "logs"]);
    for (old, new) in before.iter().zip(&after) {
        assert_ne!(old.session_id, new.session_id);
    }

    let persisted = store.load()?;
    assert_eq!(persisted[0].server_session_id, after[0].session_id);
    assert_eq!(persisted[1].server_session_id, after[1].session_id);
    let listed = server.manager.get_active_sessions();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|s| s.name == "editor"));
    assert!(listed.iter().any(|s| s.name == "logs"));

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn exited_session_is_closed_and_replaced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = workspace_store(&dir)?;
    let server = TestServer::start().await?;

    let mut conn = ClientConnection::connect(&server.url()).await?;
    let first = Reconnector::new(store.clone()).resume(&mut conn).await?;
    let logs = first[1].session_id.clone().context("logs session")?;

    // EOF makes cat exit.
    conn.send_input(&logs, b"\x04").await?;
    recv_until(&mut conn, "session_exited", |m| {
        matches!(m, ServerMessage::SessionExited { session_id, .. } if *session_id == logs)
    })
    .await?;
    conn.close().await?;
    server.wait_all_orphaned().await?;

    let mut conn = ClientConnection::connect(&server.url()).await?;
    let second = Reconnector::new(store.clone()).resume(&mut conn).await?;
    assert!(second[0].reattached);
    assert!(!second[1].reattached);
    assert_ne!(second[1].session_id.as_deref(), Some(logs.as_str()));
    assert_eq!(second[1].identity.name, "logs");
    assert!(server.manager.get_session(&logs).is_none());
    assert_eq!(server.manager.len(), 2);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn long_tab_names_are_recreated_with_the_rest() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = JsonFileTabStore::new(dir.path(), "acme/long");
    let long_name = "x".repeat(60);
    store.save(&[
        TabIdentity::new("shell", 0).with_session("gone-1"),
        TabIdentity::new(long_name.clone(), 1).with_session("gone-2"),
    ])?;
    let server = TestServer::start().await?;

    let mut conn = ClientConnection::connect(&server.url()).await?;
    let resumed = Reconnector::new(store.clone()).resume(&mut conn).await?;
    assert_eq!(resumed.len(), 2);
    assert!(resumed.iter().all(|t| t.error.is_none() && t.session_id.is_some()));
    assert_eq!(resumed[1].identity.name, long_name);

    let persisted = store.load()?;
    assert_eq!(persisted[0].server_session_id, resumed[0].session_id);
    assert_eq!(persisted[1].server_session_id, resumed[1].session_id);

    let names: Vec<String> = server
        .manager
        .get_active_sessions()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"shell".to_string()));
    assert!(names.contains(&"x".repeat(50)));

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn refused_tabs_are_reported_without_aborting() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = JsonFileTabStore::new(dir.path(), "acme/broken");
    store.save(&[
        TabIdentity::new("shell", 0).with_session("gone-1"),
        TabIdentity::new("logs", 1).with_session("gone-2"),
    ])?;
    let server = TestServer::start_with_shell("/nonexistent/shell").await?;

    let mut conn = ClientConnection::connect(&server.url()).await?;
    let resumed = Reconnector::new(store.clone()).resume(&mut conn).await?;
    assert_eq!(resumed.len(), 2);
    for tab in &resumed {
        assert!(tab.session_id.is_none());
        assert!(!tab.reattached);
        let error = tab.error.as_deref().context("refusal reason")?;
        assert!(error.contains("SpawnFailed"), "unexpected error {error}");
    }

    // Stale ids are forgotten; tab names and order survive.
    let persisted = store.load()?;
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[0].name, "shell");
    assert!(persisted.iter().all(|t| t.server_session_id.is_none()));

    assert!(conn.list_sessions().await?.is_empty());
    assert!(server.manager.is_empty());

    server.stop().await?;
    Ok(())
}
