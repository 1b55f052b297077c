//! Decide, per persisted tab, whether to reattach or recreate on reconnect.
//!
//! Matching is by exact session ID only. A tab name never selects a session.

use std::collections::{HashMap, HashSet};

use termkeep_protocol::{SessionId, SessionInfo, SessionStatus};

use crate::tabs::TabIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabAction {
    /// The tab's session is still running on the server.
    Reattach {
        tab_index: usize,
        session_id: SessionId,
    },
    /// Spawn a fresh session for the tab. `discard` names an exited session
    /// the tab used to point at, which the client should close.
    Recreate {
        tab_index: usize,
        discard: Option<SessionId>,
    },
}

impl TabAction {
    pub fn tab_index(&self) -> usize {
        match self {
            TabAction::Reattach { tab_index, .. } | TabAction::Recreate { tab_index, .. } => {
                *tab_index
            }
        }
    }
}

/// One action per tab, in tab order.
///
/// When several tabs claim the same running session only the first one
/// reattaches; the others get fresh sessions so no two tabs share a PTY.
pub fn plan_reconnect(tabs: &[TabIdentity], sessions: &[SessionInfo]) -> Vec<TabAction> {
    let by_id: HashMap<&str, &SessionInfo> =
        sessions.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut discarded: HashSet<&str> = HashSet::new();

    tabs.iter()
        .enumerate()
        .map(|(tab_index, tab)| {
            let Some(wanted) = tab.server_session_id.as_deref() else {
                return TabAction::Recreate {
                    tab_index,
                    discard: None,
                };
            };
            match by_id.get(wanted) {
                Some(info) if info.status == SessionStatus::Running && claimed.insert(wanted) => {
                    TabAction::Reattach {
                        tab_index,
                        session_id: wanted.to_string(),
                    }
                }
                Some(info) if info.status == SessionStatus::Exited => TabAction::Recreate {
                    tab_index,
                    discard: discarded.insert(wanted).then(|| wanted.to_string()),
                },
                _ => TabAction::Recreate {
                    tab_index,
                    discard: None,
                },
            }
        })
        .collect()
}

/// Point the tab at the session the server just created for it.
pub fn apply_created(tabs: &mut [TabIdentity], tab_index: usize, session_id: SessionId) {
    if let Some(tab) = tabs.get_mut(tab_index) {
        tab.server_session_id = Some(session_id);
    }
}
