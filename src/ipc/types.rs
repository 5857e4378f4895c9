use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::ImportConfig;
use crate::store::SessionStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: ImportConfig,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(config: ImportConfig) -> Self {
        let sessions = SessionStore::new(config.session_ttl);
        AppState {
            workspace: None,
            db: None,
            config,
            sessions,
        }
    }
}
