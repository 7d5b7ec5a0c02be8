//! guestfs - guest filesystem tool.
//!
//! Packs and inspects mmfs images, and runs file operations against a
//! machine assembled from a TOML config or command-line mounts.
//!
//! Usage:
//!   # Build a ROM image from a directory
//!   guestfs pack ./rom rom.mmfs
//!   guestfs inspect rom.mmfs
//!
//!   # Operate on a machine
//!   guestfs --root ~/machines/0 --rom rom.mmfs ls /
//!   guestfs --config machine.toml cp /rom/programs /programs
//!
//! Without `--config` or any mount flag, `~/.config/guestfs/machine.toml` is
//! used when present.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use guestfs_kernel::{
    FileSystem, GuestPath, MachineConfig, MountConfig, MountTree, WalkEntry, Walker, combine,
};
use guestfs_mmfs::{Archive, ArchiveBuilder};

/// Guest filesystem tool.
#[derive(Parser, Debug)]
#[command(name = "guestfs")]
#[command(about = "Pack mmfs images and run guest filesystem operations")]
struct Cli {
    #[command(flatten)]
    machine: MachineArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct MachineArgs {
    /// Machine config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Host directory mounted read-write at /
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// mmfs image mounted at /rom
    #[arg(long, global = true)]
    rom: Option<PathBuf>,

    /// Extra host mount, GUEST=HOST (repeatable)
    #[arg(long = "mount", value_parser = parse_mount, global = true)]
    mounts: Vec<MountConfig>,

    /// Extra read-only host mount, GUEST=HOST (repeatable)
    #[arg(long = "mount-ro", value_parser = parse_mount_ro, global = true)]
    read_only_mounts: Vec<MountConfig>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pack a host directory into an mmfs image
    Pack { dir: PathBuf, output: PathBuf },

    /// Print the tree inside an mmfs image
    Inspect {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },

    #[command(flatten)]
    Guest(GuestCommand),
}

/// Operations on a running machine's guest tree.
#[derive(Subcommand, Debug)]
enum GuestCommand {
    /// List a guest directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Print a guest file to stdout
    Cat { path: String },

    /// Write a host file (or `-` for stdin) to a guest path
    Put { source: PathBuf, dest: String },

    /// Create a guest directory and its parents
    Mkdir { path: String },

    /// Copy a guest file or directory
    Cp { from: String, to: String },

    /// Move a guest file or directory
    Mv { from: String, to: String },

    /// Delete a guest file or directory
    Rm { path: String },

    /// Print guest path attributes as JSON
    Stat { path: String },

    /// Show free space and capacity below a guest path
    Df {
        #[arg(default_value = "/")]
        path: String,
    },
}

fn parse_mount(raw: &str) -> Result<MountConfig, String> {
    let (guest, host) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected GUEST=HOST, got {raw:?}"))?;
    Ok(MountConfig {
        guest: guest.to_string(),
        host: Some(PathBuf::from(host)),
        archive: None,
        read_only: false,
    })
}

fn parse_mount_ro(raw: &str) -> Result<MountConfig, String> {
    Ok(MountConfig {
        read_only: true,
        ..parse_mount(raw)?
    })
}

impl MachineArgs {
    fn has_mount_flags(&self) -> bool {
        self.root.is_some()
            || self.rom.is_some()
            || !self.mounts.is_empty()
            || !self.read_only_mounts.is_empty()
    }

    fn load(&self) -> Result<MachineConfig> {
        let mut config = match &self.config {
            Some(path) => MachineConfig::load_from(path)?,
            None if self.has_mount_flags() => MachineConfig::default(),
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    tracing::debug!(path = %path.display(), "using default machine config");
                    MachineConfig::load_from(&path)?
                }
                _ => bail!("no machine given: pass --config, --root, --rom or --mount"),
            },
        };

        if let Some(root) = &self.root {
            config.mounts.push(MountConfig {
                guest: "/".to_string(),
                host: Some(root.clone()),
                archive: None,
                read_only: false,
            });
        }
        if let Some(rom) = &self.rom {
            config.mounts.push(MountConfig {
                guest: "/rom".to_string(),
                host: None,
                archive: Some(rom.clone()),
                read_only: true,
            });
        }
        config.mounts.extend(self.mounts.iter().cloned());
        config.mounts.extend(self.read_only_mounts.iter().cloned());
        Ok(config)
    }

    fn build(&self) -> Result<FileSystem> {
        self.load()?.build()
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("guestfs").join("machine.toml"))
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Pack { dir, output } => pack(&dir, &output),
        Command::Inspect { image, path } => inspect(&image, &path),
        Command::Guest(command) => run(&cli.machine.build()?, command),
    }
}

fn pack(dir: &Path, output: &Path) -> Result<()> {
    let image = ArchiveBuilder::from_host_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .build()
        .context("Failed to pack image")?;
    std::fs::write(output, &image)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::info!(output = %output.display(), bytes = image.len(), "packed image");
    Ok(())
}

fn inspect(image: &Path, path: &str) -> Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;
    let archive = Archive::from_bytes(bytes).context("Not a valid mmfs image")?;
    let base = GuestPath::parse(path)?;
    let tree = MountTree::Archive {
        archive: &archive,
        base: base.segments().to_vec(),
    };

    let mut out = io::stdout().lock();
    for step in Walker::new(&tree) {
        match step? {
            WalkEntry::EnterDir(rel) => {
                if let Some(name) = rel.last() {
                    writeln!(out, "{}{name}/", indent(rel.len()))?;
                }
            }
            WalkEntry::File(rel) => {
                let segments: Vec<&String> = base.segments().iter().chain(&rel).collect();
                let entry = archive.traverse(&segments)?;
                let name = rel.last().map(String::as_str).unwrap_or(entry.name());
                writeln!(out, "{}{name}  {}", indent(rel.len()), entry.size())?;
            }
            WalkEntry::LeaveDir(_) => {}
        }
    }
    Ok(())
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth.saturating_sub(1))
}

fn run(fs: &FileSystem, command: GuestCommand) -> Result<()> {
    let mut out = io::stdout().lock();
    match command {
        GuestCommand::Ls { path } => {
            for name in fs.list(&path)? {
                let suffix = if fs.is_dir(&combine(&path, &[&name]))? { "/" } else { "" };
                writeln!(out, "{name}{suffix}")?;
            }
        }
        GuestCommand::Cat { path } => {
            let mut handle = fs.open(&path, "rb")?;
            out.write_all(&handle.read_all()?)?;
            handle.close()?;
        }
        GuestCommand::Put { source, dest } => {
            let data = if source.as_os_str() == "-" {
                let mut data = Vec::new();
                io::stdin().read_to_end(&mut data)?;
                data
            } else {
                std::fs::read(&source).with_context(|| format!("Failed to read {}", source.display()))?
            };
            let mut handle = fs.open(&dest, "wb")?;
            handle.write(&data)?;
            handle.close()?;
            tracing::info!(dest = %dest, bytes = data.len(), "wrote file");
        }
        GuestCommand::Mkdir { path } => fs.make_dir(&path)?,
        GuestCommand::Cp { from, to } => fs.copy(&from, &to)?,
        GuestCommand::Mv { from, to } => fs.move_path(&from, &to)?,
        GuestCommand::Rm { path } => fs.delete(&path)?,
        GuestCommand::Stat { path } => {
            let mut json = serde_json::to_value(fs.attributes(&path)?)?;
            json["drive"] = serde_json::to_value(fs.get_drive(&path)?)?;
            writeln!(out, "{}", serde_json::to_string_pretty(&json)?)?;
        }
        GuestCommand::Df { path } => {
            let free = fs.get_free_space(&path)?;
            match fs.get_capacity(&path)? {
                Some(capacity) => writeln!(out, "{free} free of {capacity} bytes")?,
                None => writeln!(out, "{free} free (read-only image)")?,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_commands_skip_machine() {
        let cli = Cli::try_parse_from(["guestfs", "pack", "rom", "rom.mmfs"]).unwrap();
        assert!(matches!(cli.command, Command::Pack { .. }));
        let cli = Cli::try_parse_from(["guestfs", "inspect", "rom.mmfs"]).unwrap();
        assert!(matches!(cli.command, Command::Inspect { ref path, .. } if path == "/"));
    }

    #[test]
    fn test_guest_commands_flattened() {
        let cli = Cli::try_parse_from(["guestfs", "--root", "hdd", "cp", "/a", "/b"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Guest(GuestCommand::Cp { ref from, ref to }) if from == "/a" && to == "/b"
        ));
        assert_eq!(cli.machine.root.as_deref(), Some(Path::new("hdd")));

        let cli = Cli::try_parse_from(["guestfs", "ls", "--mount-ro", "/m=host"]).unwrap();
        assert!(matches!(cli.command, Command::Guest(GuestCommand::Ls { ref path }) if path == "/"));
        assert!(cli.machine.read_only_mounts[0].read_only);
    }
}
