use crate::config::snippets;
use failure::{Fallible, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Runtime configuration holding environmental inputs.
#[derive(Debug, Serialize)]
pub(crate) struct ConfigInput {
    pub(crate) storage: StorageInput,
    pub(crate) download: DownloadInput,
    pub(crate) arbiter: ArbiterInput,
    pub(crate) install: InstallInput,
}

impl ConfigInput {
    /// Read config snippets and merge them into a single config.
    ///
    /// Snippets with the same file name shadow the ones from earlier
    /// directories; the survivors apply in lexical order of their names.
    pub(crate) fn read_config<P: AsRef<Path>>(dirs: &[P]) -> Fallible<Self> {
        let mut fragments: BTreeMap<String, PathBuf> = BTreeMap::new();
        for dir in dirs {
            let dir = dir.as_ref();
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(ref e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e)
                        .context(format!("failed to list '{}'", dir.display()))
                        .map_err(Into::into)
                }
            };
            for entry in entries {
                let path = entry?.path();
                if path.extension().map_or(true, |ext| ext != "toml") {
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    fragments.insert(name.to_string(), path.clone());
                }
            }
        }

        let mut snips = vec![];
        for path in fragments.values() {
            trace!("reading config snippet {}", path.display());
            let content =
                fs::read(path).context(format!("failed to read '{}'", path.display()))?;
            let snippet: snippets::ConfigSnippet = toml::from_slice(&content)
                .context(format!("failed to parse TOML in '{}'", path.display()))?;
            snips.push(snippet);
        }

        let cfg = Self::merge_snippets(snips);
        debug!("configuration input: {:?}", cfg);
        Ok(cfg)
    }

    /// Merge multiple snippets into a single configuration.
    pub(crate) fn merge_snippets(snippets: Vec<snippets::ConfigSnippet>) -> Self {
        let mut storages = vec![];
        let mut downloads = vec![];
        let mut arbiters = vec![];
        let mut installs = vec![];

        for snip in snippets {
            if let Some(s) = snip.storage {
                storages.push(s);
            }
            if let Some(d) = snip.download {
                downloads.push(d);
            }
            if let Some(a) = snip.arbiter {
                arbiters.push(a);
            }
            if let Some(i) = snip.install {
                installs.push(i);
            }
        }

        Self {
            storage: StorageInput::from_snippets(storages),
            download: DownloadInput::from_snippets(downloads),
            arbiter: ArbiterInput::from_snippets(arbiters),
            install: InstallInput::from_snippets(installs),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct StorageInput {
    pub(crate) state_dir: String,
    pub(crate) download_dir: String,
}

impl StorageInput {
    fn from_snippets(snippets: Vec<snippets::StorageSnippet>) -> Self {
        let mut cfg = Self {
            state_dir: "/var/lib/otad/state".to_string(),
            download_dir: "/var/lib/otad/downloads".to_string(),
        };

        for snip in snippets {
            if let Some(d) = snip.state_dir {
                cfg.state_dir = d;
            }
            if let Some(d) = snip.download_dir {
                cfg.download_dir = d;
            }
        }

        cfg
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct DownloadInput {
    pub(crate) abort_timeout_secs: u64,
    pub(crate) pipe_depth: usize,
    pub(crate) chunk_size: usize,
    pub(crate) max_uri_len: usize,
    pub(crate) http_timeout_secs: u64,
    pub(crate) retries: u32,
}

impl DownloadInput {
    fn from_snippets(snippets: Vec<snippets::DownloadSnippet>) -> Self {
        let mut cfg = Self {
            abort_timeout_secs: 15,
            pipe_depth: 8,
            chunk_size: 16 * 1024,
            max_uri_len: 255,
            http_timeout_secs: 30,
            retries: 3,
        };

        for snip in snippets {
            if let Some(t) = snip.abort_timeout_secs {
                cfg.abort_timeout_secs = t;
            }
            if let Some(d) = snip.pipe_depth {
                cfg.pipe_depth = d;
            }
            if let Some(c) = snip.chunk_size {
                cfg.chunk_size = c;
            }
            if let Some(m) = snip.max_uri_len {
                cfg.max_uri_len = m;
            }
            if let Some(t) = snip.http_timeout_secs {
                cfg.http_timeout_secs = t;
            }
            if let Some(r) = snip.retries {
                cfg.retries = r;
            }
        }

        cfg
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct ArbiterInput {
    pub(crate) blocked_defer_secs: u64,
    pub(crate) control_app_expected: bool,
}

impl ArbiterInput {
    fn from_snippets(snippets: Vec<snippets::ArbiterSnippet>) -> Self {
        let mut cfg = Self {
            blocked_defer_secs: 180,
            control_app_expected: false,
        };

        for snip in snippets {
            if let Some(b) = snip.blocked_defer_secs {
                cfg.blocked_defer_secs = b;
            }
            if let Some(e) = snip.control_app_expected {
                cfg.control_app_expected = e;
            }
        }

        cfg
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct InstallInput {
    pub(crate) firmware_slot: String,
    pub(crate) apps_dir: String,
    pub(crate) reboot_command: Vec<String>,
}

impl InstallInput {
    fn from_snippets(snippets: Vec<snippets::InstallSnippet>) -> Self {
        let mut cfg = Self {
            firmware_slot: "/var/lib/otad/firmware/slot.bin".to_string(),
            apps_dir: "/var/lib/otad/apps".to_string(),
            reboot_command: vec!["systemctl".to_string(), "reboot".to_string()],
        };

        for snip in snippets {
            if let Some(s) = snip.firmware_slot {
                cfg.firmware_slot = s;
            }
            if let Some(a) = snip.apps_dir {
                cfg.apps_dir = a;
            }
            if let Some(r) = snip.reboot_command {
                cfg.reboot_command = r;
            }
        }

        cfg
    }
}
