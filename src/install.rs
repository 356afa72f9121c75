//! Platform install hooks.

use failure::{Fallible, ResultExt};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Flashing, app deployment and reboot, as provided by the platform.
pub(crate) trait Installer: Send {
    /// Stage a firmware image, to be booted at next restart.
    fn install_firmware(&self, image: &Path) -> Fallible<()>;

    /// Whether the staged firmware made it, checked after the reboot.
    fn firmware_installed(&self) -> Fallible<bool>;

    fn install_software(&self, instance_id: u16, staged: &Path) -> Fallible<()>;

    fn uninstall_software(&self, instance_id: u16) -> Fallible<()>;

    fn reboot(&self) -> Fallible<()>;
}

/// Installer working on plain directories.
#[derive(Clone, Debug)]
pub(crate) struct DirInstaller {
    pub(crate) firmware_slot: PathBuf,
    pub(crate) apps_dir: PathBuf,
    pub(crate) reboot_command: Vec<String>,
}

impl DirInstaller {
    fn app_dir(&self, instance_id: u16) -> PathBuf {
        self.apps_dir.join(instance_id.to_string())
    }
}

impl Installer for DirInstaller {
    fn install_firmware(&self, image: &Path) -> Fallible<()> {
        let slot_dir = self
            .firmware_slot
            .parent()
            .ok_or_else(|| format_err!("invalid firmware slot {}", self.firmware_slot.display()))?;
        fs::create_dir_all(slot_dir)?;

        let mut staged = tempfile::NamedTempFile::new_in(slot_dir)?;
        let mut src = fs::File::open(image)
            .with_context(|e| format!("failed to open firmware image: {}", e))?;
        std::io::copy(&mut src, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged
            .persist(&self.firmware_slot)
            .map_err(|e| format_err!("failed to write firmware slot: {}", e))?;
        info!("firmware image written to {}", self.firmware_slot.display());
        Ok(())
    }

    fn firmware_installed(&self) -> Fallible<bool> {
        match fs::metadata(&self.firmware_slot) {
            Ok(meta) => Ok(meta.len() > 0),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn install_software(&self, instance_id: u16, staged: &Path) -> Fallible<()> {
        let dest = self.app_dir(instance_id);
        remove_dir(&dest)?;
        copy_tree(staged, &dest)
            .with_context(|e| format!("failed to deploy instance {}: {}", instance_id, e))?;
        info!("application instance {} deployed to {}", instance_id, dest.display());
        Ok(())
    }

    fn uninstall_software(&self, instance_id: u16) -> Fallible<()> {
        let dest = self.app_dir(instance_id);
        if !dest.exists() {
            bail!("application instance {} is not installed", instance_id);
        }
        remove_dir(&dest)?;
        info!("application instance {} removed", instance_id);
        Ok(())
    }

    fn reboot(&self) -> Fallible<()> {
        let (cmd, args) = match self.reboot_command.split_first() {
            Some(split) => split,
            None => bail!("no reboot command configured"),
        };
        info!("rebooting: {}", self.reboot_command.join(" "));
        let status = Command::new(cmd)
            .args(args)
            .status()
            .with_context(|e| format!("failed to run '{}': {}", cmd, e))?;
        if !status.success() {
            bail!("reboot command failed: {}", status);
        }
        Ok(())
    }
}

fn remove_dir(dir: &Path) -> Fallible<()> {
    match fs::remove_dir_all(dir) {
        Ok(_) => Ok(()),
        Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Fallible<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
