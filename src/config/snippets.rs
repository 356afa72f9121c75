/// Top-level configuration stanza.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConfigSnippet {
    /// Persistent state and package locations.
    pub(crate) storage: Option<StorageSnippet>,
    /// Download pipeline tuning.
    pub(crate) download: Option<DownloadSnippet>,
    /// Pending-operation arbitration.
    pub(crate) arbiter: Option<ArbiterSnippet>,
    /// Install targets.
    pub(crate) install: Option<InstallSnippet>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StorageSnippet {
    /// Resume records (default: /var/lib/otad/state)
    pub(crate) state_dir: Option<String>,
    /// Downloaded packages (default: /var/lib/otad/downloads)
    pub(crate) download_dir: Option<String>,
}

/// Config snippet for the download pipeline.
#[derive(Debug, Deserialize)]
pub(crate) struct DownloadSnippet {
    /// Seconds to wait for workers on abort or suspend (default: 15)
    pub(crate) abort_timeout_secs: Option<u64>,
    /// Chunks buffered between download and store workers (default: 8)
    pub(crate) pipe_depth: Option<usize>,
    pub(crate) chunk_size: Option<usize>,
    pub(crate) max_uri_len: Option<usize>,
    pub(crate) http_timeout_secs: Option<u64>,
    /// Retries on communication errors (default: 3)
    pub(crate) retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ArbiterSnippet {
    /// Re-evaluation delay while blocked (default: 180)
    pub(crate) blocked_defer_secs: Option<u64>,
    /// Whether a control application will attach (default: false)
    pub(crate) control_app_expected: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstallSnippet {
    pub(crate) firmware_slot: Option<String>,
    pub(crate) apps_dir: Option<String>,
    /// Command and arguments (default: ["systemctl", "reboot"])
    pub(crate) reboot_command: Option<Vec<String>>,
}
