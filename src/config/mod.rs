/// Configuration parsing and validation.
///
/// This module contains three logical entities:
///  * Snippets: single configuration files, holding a subset of configuration entries.
///  * Inputs: configuration snippets merged, but not yet validated.
///  * OtadConfig: validated configuration for the daemon.
mod inputs;
mod snippets;

use crate::arbiter::ArbiterSettings;
use crate::engine::{HttpSettings, SchemeEngines};
use crate::install::DirInstaller;
use crate::pipeline::PipelineSettings;
use failure::{Fallible, ResultExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directories scanned for config snippets, lowest precedence first.
pub(crate) static CONFIG_DIRS: &[&str] = &[
    "/usr/lib/otad/config.d",
    "/run/otad/config.d",
    "/etc/otad/config.d",
];

/// Runtime configuration for the daemon.
///
/// It holds validated configuration.
#[derive(Debug, Serialize)]
pub(crate) struct OtadConfig {
    pub(crate) state_dir: PathBuf,
    pub(crate) download_dir: PathBuf,
    pub(crate) abort_timeout_secs: u64,
    pub(crate) pipe_depth: usize,
    pub(crate) chunk_size: usize,
    pub(crate) max_uri_len: usize,
    pub(crate) http_timeout_secs: u64,
    pub(crate) retries: u32,
    pub(crate) blocked_defer_secs: u64,
    pub(crate) control_app_expected: bool,
    pub(crate) firmware_slot: PathBuf,
    pub(crate) apps_dir: PathBuf,
    pub(crate) reboot_command: Vec<String>,
}

impl OtadConfig {
    pub(crate) fn read_config<P: AsRef<Path>>(dirs: &[P]) -> Fallible<Self> {
        let cfg = inputs::ConfigInput::read_config(dirs)?;
        Self::try_from_input(cfg)
    }

    /// Validate inputs and return a valid configuration.
    fn try_from_input(cfg: inputs::ConfigInput) -> Fallible<Self> {
        if cfg.storage.state_dir.is_empty() || cfg.storage.download_dir.is_empty() {
            bail!("empty storage directory");
        }
        if cfg.download.abort_timeout_secs == 0 {
            bail!("abort timeout must be positive");
        }
        if cfg.download.pipe_depth == 0 {
            bail!("pipe depth must be positive");
        }
        if cfg.download.chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        if cfg.download.max_uri_len == 0 {
            bail!("maximum URI length must be positive");
        }
        if cfg.arbiter.blocked_defer_secs == 0 {
            bail!("blocked defer interval must be positive");
        }
        if cfg.install.reboot_command.is_empty() {
            bail!("empty reboot command");
        }

        let state = OtadConfig {
            state_dir: cfg.storage.state_dir.into(),
            download_dir: cfg.storage.download_dir.into(),
            abort_timeout_secs: cfg.download.abort_timeout_secs,
            pipe_depth: cfg.download.pipe_depth,
            chunk_size: cfg.download.chunk_size,
            max_uri_len: cfg.download.max_uri_len,
            http_timeout_secs: cfg.download.http_timeout_secs,
            retries: cfg.download.retries,
            blocked_defer_secs: cfg.arbiter.blocked_defer_secs,
            control_app_expected: cfg.arbiter.control_app_expected,
            firmware_slot: cfg.install.firmware_slot.into(),
            apps_dir: cfg.install.apps_dir.into(),
            reboot_command: cfg.install.reboot_command,
        };
        debug!(
            "runtime configuration:\n{}",
            serde_json::to_string_pretty(&state).context("failed to render configuration")?
        );

        Ok(state)
    }

    pub(crate) fn pipeline(&self) -> PipelineSettings {
        PipelineSettings {
            abort_timeout: Duration::from_secs(self.abort_timeout_secs),
            pipe_depth: self.pipe_depth,
            max_uri_len: self.max_uri_len,
        }
    }

    pub(crate) fn engines(&self) -> SchemeEngines {
        SchemeEngines {
            http: HttpSettings {
                timeout: Duration::from_secs(self.http_timeout_secs),
                retries: self.retries,
                chunk_size: self.chunk_size,
            },
            chunk_size: self.chunk_size,
        }
    }

    pub(crate) fn arbiter(&self) -> ArbiterSettings {
        ArbiterSettings {
            blocked_defer: Duration::from_secs(self.blocked_defer_secs),
            authority_expected: self.control_app_expected,
        }
    }

    pub(crate) fn installer(&self) -> DirInstaller {
        DirInstaller {
            firmware_slot: self.firmware_slot.clone(),
            apps_dir: self.apps_dir.clone(),
            reboot_command: self.reboot_command.clone(),
        }
    }

    /// Unpacked software packages, next to the downloads.
    pub(crate) fn staging_dir(&self) -> PathBuf {
        self.download_dir.join("staged")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn defaults_without_snippets() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = OtadConfig::read_config(&[tmp.path().join("missing")]).unwrap();
        assert_eq!(cfg.state_dir, PathBuf::from("/var/lib/otad/state"));
        assert_eq!(cfg.download_dir, PathBuf::from("/var/lib/otad/downloads"));
        assert_eq!(cfg.pipe_depth, 8);
        assert_eq!(cfg.chunk_size, 16384);
        assert_eq!(cfg.max_uri_len, 255);
        assert_eq!(cfg.retries, 3);
        assert_eq!(cfg.arbiter().blocked_defer, Duration::from_secs(180));
        assert!(!cfg.control_app_expected);
        assert_eq!(cfg.pipeline().abort_timeout, Duration::from_secs(15));
        assert_eq!(cfg.reboot_command, vec!["systemctl", "reboot"]);
        assert_eq!(
            cfg.staging_dir(),
            PathBuf::from("/var/lib/otad/downloads/staged")
        );
    }

    #[test]
    fn later_dirs_shadow_same_named_snippets() {
        let tmp = tempfile::tempdir().unwrap();
        let vendor = tmp.path().join("usr");
        let admin = tmp.path().join("etc");
        write(
            &vendor,
            "10-storage.toml",
            "[storage]\nstate_dir = \"/vendor/state\"\ndownload_dir = \"/vendor/dl\"\n",
        );
        write(&vendor, "20-arbiter.toml", "[arbiter]\nblocked_defer_secs = 60\n");
        write(&admin, "10-storage.toml", "[storage]\nstate_dir = \"/admin/state\"\n");
        write(&admin, "README", "not a snippet");

        let cfg = OtadConfig::read_config(&[&vendor, &admin]).unwrap();
        assert_eq!(cfg.state_dir, PathBuf::from("/admin/state"));
        // The vendor file was shadowed as a whole.
        assert_eq!(cfg.download_dir, PathBuf::from("/var/lib/otad/downloads"));
        assert_eq!(cfg.blocked_defer_secs, 60);
    }

    #[test]
    fn snippets_apply_in_lexical_order() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("conf.d");
        write(&dir, "50-late.toml", "[download]\npipe_depth = 2\n");
        write(
            &dir,
            "05-early.toml",
            "[download]\npipe_depth = 16\nretries = 0\n[install]\nreboot_command = [\"reboot\", \"-f\"]\n",
        );

        let cfg = OtadConfig::read_config(&[&dir]).unwrap();
        assert_eq!(cfg.pipe_depth, 2);
        assert_eq!(cfg.retries, 0);
        assert_eq!(cfg.installer().reboot_command, vec!["reboot", "-f"]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("conf.d");
        write(&dir, "00-bad.toml", "[download]\npipe_depth = 0\n");
        assert!(OtadConfig::read_config(&[&dir]).is_err());

        write(&dir, "00-bad.toml", "[install]\nreboot_command = []\n");
        assert!(OtadConfig::read_config(&[&dir]).is_err());

        write(&dir, "00-bad.toml", "[download\n");
        assert!(OtadConfig::read_config(&[&dir]).is_err());
    }
}
