use std::time::Duration;

/// Upload and session limits. Defaults mirror the hosted roster importer
/// (25 MiB uploads, 30-minute idle sessions); each can be overridden from
/// the environment so operators can tune a sidecar without a rebuild.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub max_upload_bytes: usize,
    pub max_rows: usize,
    pub preview_rows: usize,
    pub session_ttl: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            max_upload_bytes: 25 * 1024 * 1024,
            max_rows: 10_000,
            preview_rows: 5,
            session_ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let mut cfg = ImportConfig::default();
        if let Some(v) = env_usize("ROSTERD_MAX_UPLOAD_BYTES") {
            cfg.max_upload_bytes = v;
        }
        if let Some(v) = env_usize("ROSTERD_MAX_ROWS") {
            cfg.max_rows = v;
        }
        if let Some(v) = env_usize("ROSTERD_SESSION_TTL_SECS") {
            cfg.session_ttl = Duration::from_secs(v as u64);
        }
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}
