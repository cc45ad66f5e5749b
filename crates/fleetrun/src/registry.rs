//! Registry of multiplexed ssh control channels
//!
//! ssh coordinates ControlMaster sockets on its own, but nothing on the
//! client side knows which channels exist, who is using them, or when they
//! can be torn down. The registry tracks that explicitly, keyed by
//! (target, multiplexing identifier).
//!
//! One identifier is normally shared by every node of a cluster. The
//! socket path ends in `%C`, a digest of the destination, so each target
//! still gets its own master.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    /// Node address
    pub target: String,
    /// Multiplexing identifier
    pub control_name: String,
}

/// Everything needed to address a control master from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Directory holding the `%C` socket
    pub control_dir: PathBuf,
    /// `user@host` the master was opened for
    pub destination: String,
    /// Remote port
    pub port: u16,
}

#[derive(Debug)]
struct ChannelEntry {
    spec: ChannelSpec,
    active: usize,
    use_count: u64,
    last_used: Instant,
}

/// Key-indexed registry of control channels.
///
/// Cloning is cheap; clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ControlRegistry {
    channels: Arc<Mutex<HashMap<ChannelKey, ChannelEntry>>>,
}

/// Proof that a channel is in use; releases its slot on drop
#[derive(Debug)]
pub struct ControlLease {
    key: ChannelKey,
    control_dir: PathBuf,
    registry: ControlRegistry,
}

/// Registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Known channels
    pub channels: usize,
    /// Leases currently held across all channels
    pub active_leases: usize,
    /// Channels with no active lease
    pub idle_channels: usize,
}

impl ControlRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used by runners that are not given one
    pub fn global() -> ControlRegistry {
        static GLOBAL: OnceLock<ControlRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ControlRegistry::new).clone()
    }

    /// Take a lease on the channel for `key`, creating its socket directory if needed.
    ///
    /// A key registered earlier with a different destination or port is
    /// reported and switched to the new spec.
    pub async fn acquire(&self, key: ChannelKey, spec: ChannelSpec) -> io::Result<ControlLease> {
        let control_dir = spec.control_dir.clone();
        {
            let mut channels = self.lock();

            let entry = channels.entry(key.clone()).or_insert_with(|| {
                debug!("Registering control channel {} for {}", key.control_name, key.target);
                ChannelEntry {
                    spec: spec.clone(),
                    active: 0,
                    use_count: 0,
                    last_used: Instant::now(),
                }
            });
            if entry.spec.destination != spec.destination || entry.spec.port != spec.port {
                warn!(
                    "Control channel {} for {} was opened as {}:{}, now requested as {}:{}",
                    key.control_name,
                    key.target,
                    entry.spec.destination,
                    entry.spec.port,
                    spec.destination,
                    spec.port
                );
                entry.spec = spec;
            }
            entry.active += 1;
            entry.use_count += 1;
            entry.last_used = Instant::now();
        }

        // Built before the directory exists so a failure below releases the slot.
        let lease = ControlLease {
            key,
            control_dir,
            registry: self.clone(),
        };
        ensure_private_dir(&lease.control_dir).await?;
        Ok(lease)
    }

    /// Current statistics
    pub fn stats(&self) -> RegistryStats {
        let channels = self.lock();
        let active_leases = channels.values().map(|e| e.active).sum();
        let idle_channels = channels.values().filter(|e| e.active == 0).count();
        RegistryStats {
            channels: channels.len(),
            active_leases,
            idle_channels,
        }
    }

    /// Leases currently held on `key`
    pub fn active_leases(&self, key: &ChannelKey) -> usize {
        self.lock().get(key).map_or(0, |e| e.active)
    }

    /// Ask ssh to stop idle control masters and forget them.
    ///
    /// Only channels with no active lease are touched. With `target` set,
    /// only that node's channels are considered. Returns how many were closed.
    pub async fn shutdown(&self, ssh_binary: &Path, target: Option<&str>) -> usize {
        let idle: Vec<(ChannelKey, ChannelSpec)> = {
            let mut channels = self.lock();
            let keys: Vec<ChannelKey> = channels
                .iter()
                .filter(|(k, e)| e.active == 0 && target.map_or(true, |t| t == k.target))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| channels.remove(&k).map(|e| (k, e.spec)))
                .collect()
        };

        for (key, spec) in &idle {
            info!("Closing control channel {} for {}", key.control_name, key.target);
            let result = Command::new(ssh_binary)
                .arg("-o")
                .arg(format!("ControlPath={}", spec.control_dir.join("%C").display()))
                .arg("-p")
                .arg(spec.port.to_string())
                .arg("-O")
                .arg("exit")
                .arg(&spec.destination)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match result {
                Ok(status) if status.success() => {}
                // Exit 255 here usually means the master had already gone away.
                Ok(status) => debug!("ssh -O exit for {} returned {}", key.target, status),
                Err(e) => warn!("Failed to run ssh -O exit for {}: {}", key.target, e),
            }
        }

        idle.len()
    }

    fn release(&self, key: &ChannelKey) {
        let mut channels = self.lock();
        if let Some(entry) = channels.get_mut(key) {
            entry.active = entry.active.saturating_sub(1);
            entry.last_used = Instant::now();
            debug!(
                "Released control channel {} for {} ({} active, {} uses)",
                key.control_name, key.target, entry.active, entry.use_count
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelKey, ChannelEntry>> {
        // The table holds plain counters, so a poisoned lock is still consistent.
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ControlLease {
    /// Channel key this lease holds
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Socket directory for the channel
    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }
}

impl Drop for ControlLease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

async fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}
