//! Utility functions for integration tests
//!
//! Nodes are simulated with a stand-in `ssh` script that skips ssh options,
//! drops the host argument and runs the remaining words with `sh -c` on the
//! local machine. The same script works as rsync's `-e` transport.

#![allow(dead_code)]

use anyhow::{Context, Result};
use fleetrun::{CommandRunner, ControlRegistry, RunnerConfig};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

const FAKE_SSH: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    case "$1" in
        -o|-i|-L|-p|-l|-O|-F) shift 2 ;;
        -*) shift ;;
        *) break ;;
    esac
done
shift
exec sh -c "$*"
"#;

const REFUSING_SSH: &str = r#"#!/bin/sh
echo "ssh: connect to host node-1 port 22: Connection refused" >&2
exit 255
"#;

/// Paths of the stand-in binaries, written once per test process
pub struct FakeBinaries {
    /// Runs commands locally
    pub ssh: PathBuf,
    /// Always fails like an unreachable host
    pub refusing_ssh: PathBuf,
}

/// Install the stand-in binaries
pub fn fake_binaries() -> &'static FakeBinaries {
    static BINARIES: OnceLock<FakeBinaries> = OnceLock::new();
    BINARIES.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("fleetrun-fake-ssh-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create fake binary dir");
        FakeBinaries {
            ssh: write_script(&dir.join("ssh"), FAKE_SSH).expect("write fake ssh"),
            refusing_ssh: write_script(&dir.join("ssh-refused"), REFUSING_SSH)
                .expect("write refusing ssh"),
        }
    })
}

fn write_script(path: &Path, body: &str) -> Result<PathBuf> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o755)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    Ok(path.to_path_buf())
}

/// A simulated node with its own key, control directory and registry
pub struct TestNode {
    /// Scratch space, removed on drop
    pub dir: TempDir,
    /// Dummy private key
    pub key: PathBuf,
    /// Registry private to this node
    pub registry: ControlRegistry,
}

impl TestNode {
    /// Create a node fixture
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temporary directory")?;
        let key = dir.path().join("id_test");
        fs::write(&key, "not a real key\n").context("Failed to write key")?;
        Ok(Self {
            dir,
            key,
            registry: ControlRegistry::new(),
        })
    }

    /// Configuration pointing at `ssh`
    pub fn config(&self, ssh: &Path) -> RunnerConfig {
        RunnerConfig {
            ssh_binary: ssh.to_path_buf(),
            control_dir: Some(self.dir.path().join("control")),
            ..Default::default()
        }
    }

    /// Runner whose commands execute locally
    pub fn runner(&self) -> CommandRunner {
        self.runner_with(&fake_binaries().ssh)
    }

    /// Runner whose transport always fails
    pub fn refusing_runner(&self) -> CommandRunner {
        self.runner_with(&fake_binaries().refusing_ssh)
    }

    fn runner_with(&self, ssh: &Path) -> CommandRunner {
        CommandRunner::new("node-1", "tester", &self.key)
            .with_config(Arc::new(self.config(ssh)))
            .with_registry(self.registry.clone())
    }

    /// Path inside the scratch directory
    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }
}

/// Whether a local rsync binary is available
pub fn rsync_available() -> bool {
    std::process::Command::new("rsync")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Create files below `root`
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) -> Result<()> {
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Every regular file below `root`, keyed by relative path
pub fn read_tree(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {}", dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path.strip_prefix(root)?.to_string_lossy().to_string();
                files.insert(relative, fs::read(&path)?);
            }
        }
    }
    Ok(files)
}
