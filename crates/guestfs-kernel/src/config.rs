//! Machine configuration.
//!
//! A machine is described in TOML:
//!
//! ```toml
//! [fs]
//! max_open_files = 128
//!
//! [[mounts]]
//! guest = "/"
//! host = "~/machines/0"
//!
//! [[mounts]]
//! guest = "/rom"
//! archive = "rom.mmfs"
//! ```
//!
//! Relative host and archive paths are taken relative to the config file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::fs::FileSystem;
use crate::host::LocalHostIo;

/// Engine limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsConfig {
    /// Open handles allowed at once, archive and host alike.
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,

    /// Mounts allowed at a single mount point.
    #[serde(default = "default_max_mounts_per_point")]
    pub max_mounts_per_point: usize,

    /// Buffer size for recursive copy.
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,

    /// Host file names hidden from listings.
    #[serde(default = "default_ignored_names")]
    pub ignored_names: Vec<String>,
}

fn default_max_open_files() -> usize {
    128
}

fn default_max_mounts_per_point() -> usize {
    8
}

fn default_copy_buffer_size() -> usize {
    8192
}

fn default_ignored_names() -> Vec<String> {
    vec![".DS_Store".to_string(), "desktop.ini".to_string()]
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            max_open_files: default_max_open_files(),
            max_mounts_per_point: default_max_mounts_per_point(),
            copy_buffer_size: default_copy_buffer_size(),
            ignored_names: default_ignored_names(),
        }
    }
}

impl FsConfig {
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored_names.iter().any(|n| n == name)
    }
}

/// One mount in a machine description. Exactly one of `host` and
/// `archive` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Guest mount point, e.g. `/rom`.
    pub guest: String,

    /// Host directory to expose.
    #[serde(default)]
    pub host: Option<PathBuf>,

    /// mmfs image file to expose read-only.
    #[serde(default)]
    pub archive: Option<PathBuf>,

    #[serde(default)]
    pub read_only: bool,
}

/// A whole machine: limits plus mounts, applied in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub fs: FsConfig,

    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

impl MachineConfig {
    /// Parse a TOML document. Relative paths stay relative to the working
    /// directory.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse machine config")
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        Ok(config)
    }

    /// Make relative mount paths relative to `base`. Paths starting with
    /// `~` are left for tilde expansion.
    pub fn rebase(&mut self, base: &Path) {
        for mount in &mut self.mounts {
            for path in [&mut mount.host, &mut mount.archive].into_iter().flatten() {
                if path.is_relative() && !path.starts_with("~") {
                    *path = base.join(&*path);
                }
            }
        }
    }

    /// Build a machine on the local disk with every configured mount.
    pub fn build(&self) -> Result<FileSystem> {
        let mut fs = FileSystem::new(LocalHostIo::new(), self.fs.clone());
        for mount in &self.mounts {
            match (&mount.host, &mount.archive) {
                (Some(host), None) => {
                    let root = LocalHostIo::canonical_root(host)
                        .with_context(|| format!("Bad host root {}", host.display()))?;
                    fs.mount_host_directory(root, &mount.guest, mount.read_only)
                        .with_context(|| format!("Failed to mount {}", mount.guest))?;
                }
                (None, Some(archive)) => {
                    let archive = expand(archive);
                    let bytes = std::fs::read(&archive)
                        .with_context(|| format!("Failed to read archive {}", archive.display()))?;
                    fs.mount_archive(bytes, &mount.guest)
                        .with_context(|| format!("Failed to mount {}", mount.guest))?;
                }
                (Some(_), Some(_)) => {
                    bail!("mount {} sets both host and archive", mount.guest)
                }
                (None, None) => bail!("mount {} needs a host or archive path", mount.guest),
            }
        }
        tracing::info!(mounts = fs.mounts().len(), "machine filesystem ready");
        Ok(fs)
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FsConfig::default();
        assert_eq!(config.max_open_files, 128);
        assert_eq!(config.max_mounts_per_point, 8);
        assert!(config.is_ignored(".DS_Store"));
        assert!(config.is_ignored("desktop.ini"));
        assert!(!config.is_ignored("startup"));
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = MachineConfig::from_toml_str("").expect("parse failed");
        assert_eq!(config, MachineConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[fs]
max_open_files = 4
ignored_names = []

[[mounts]]
guest = "/"
host = "/srv/machine"

[[mounts]]
guest = "/rom"
archive = "rom.mmfs"
read_only = true
"#;
        let config = MachineConfig::from_toml_str(toml).expect("parse failed");
        assert_eq!(config.fs.max_open_files, 4);
        assert_eq!(config.fs.max_mounts_per_point, 8);
        assert!(config.fs.ignored_names.is_empty());
        assert_eq!(config.mounts.len(), 2);
        assert_eq!(config.mounts[0].host.as_deref(), Some(Path::new("/srv/machine")));
        assert_eq!(config.mounts[1].archive.as_deref(), Some(Path::new("rom.mmfs")));
        assert!(config.mounts[1].read_only);
    }

    #[test]
    fn test_rebase_relative_paths() {
        let mut config = MachineConfig::from_toml_str(
            r#"
[[mounts]]
guest = "/"
host = "disk"

[[mounts]]
guest = "/home"
host = "~/guest"

[[mounts]]
guest = "/rom"
archive = "/abs/rom.mmfs"
"#,
        )
        .unwrap();
        config.rebase(Path::new("/etc/machines"));
        assert_eq!(config.mounts[0].host.as_deref(), Some(Path::new("/etc/machines/disk")));
        assert_eq!(config.mounts[1].host.as_deref(), Some(Path::new("~/guest")));
        assert_eq!(config.mounts[2].archive.as_deref(), Some(Path::new("/abs/rom.mmfs")));
    }

    #[test]
    fn test_build_rejects_ambiguous_mount() {
        let config = MachineConfig::from_toml_str(
            r#"
[[mounts]]
guest = "/x"
host = "/tmp"
archive = "/tmp/x.mmfs"
"#,
        )
        .unwrap();
        assert!(config.build().is_err());

        let config = MachineConfig::from_toml_str("[[mounts]]\nguest = \"/x\"\n").unwrap();
        assert!(config.build().is_err());
    }

    #[test]
    fn test_build_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("startup"), b"print('hi')").unwrap();

        let rom = dir.path().join("rom.mmfs");
        let mut builder = guestfs_mmfs::ArchiveBuilder::new();
        builder.add_file("bios.lua", b"boot".to_vec()).unwrap();
        std::fs::write(&rom, builder.build().unwrap()).unwrap();

        let config_path = dir.path().join("machine.toml");
        std::fs::write(
            &config_path,
            "[[mounts]]\nguest = \"/\"\nhost = \".\"\n\n[[mounts]]\nguest = \"/rom\"\narchive = \"rom.mmfs\"\n",
        )
        .unwrap();

        let fs = MachineConfig::load_from(&config_path).unwrap().build().unwrap();
        assert!(fs.exists("/startup").unwrap());
        assert!(fs.exists("/rom/bios.lua").unwrap());
        assert!(fs.is_read_only("/rom").unwrap());
    }
}
