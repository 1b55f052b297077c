//! Client side of the termkeep reconnect protocol: persisted tab identities,
//! the reattach-or-recreate matcher, and a WebSocket driver that runs it.

pub mod matcher;
pub mod reconnect;
pub mod tabs;

pub use matcher::{TabAction, apply_created, plan_reconnect};
pub use reconnect::{ClientConnection, Reconnector, ResumedTab};
pub use tabs::{JsonFileTabStore, MemoryTabStore, TabIdentity, TabStore};
