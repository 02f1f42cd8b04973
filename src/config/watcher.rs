//! Hot reload of the configuration file.
//!
//! A reload only swaps tunnel keys and domain aliases into the running
//! server; listeners, routes, limits and timeouts keep their startup values
//! until restart.
//!
//! The file's directory is watched rather than the file itself, so editors
//! that save through a rename are still seen. A new configuration is sent
//! only when the file content differs from the last version seen and it
//! parses and validates. An empty file is a save still in progress.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::parse_config;
use crate::config::schema::ServerConfig;

/// Re-reads the file and decides whether it holds a new configuration.
#[derive(Debug)]
struct Reloader {
    path: PathBuf,
    last_seen: Option<String>,
}

impl Reloader {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            last_seen: fs::read_to_string(path).ok(),
        }
    }

    fn reload(&mut self) -> Option<ServerConfig> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Config file unreadable, keeping running keys and aliases");
                return None;
            }
        };
        if content.trim().is_empty() {
            tracing::debug!(path = ?self.path, "Config file empty, waiting for the save to finish");
            return None;
        }
        if self.last_seen.as_deref() == Some(content.as_str()) {
            return None;
        }

        let parsed = parse_config(&content);
        self.last_seen = Some(content);
        match parsed {
            Ok(config) => {
                tracing::info!(
                    path = ?self.path,
                    tunnel_keys = config.tunnel.keys.len(),
                    aliases = config.http.aliases.len(),
                    "Config change accepted"
                );
                Some(config)
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Config change rejected, keeping running keys and aliases");
                None
            }
        }
    }
}

/// Watches the configuration file and sends each accepted version.
pub struct ConfigWatcher {
    reloader: Reloader,
    update_tx: mpsc::UnboundedSender<ServerConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiver accepted configurations arrive on.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ServerConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                reloader: Reloader::new(path),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. Events stop when the returned watcher is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            mut reloader,
            update_tx,
        } = self;
        let directory = match reloader.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name: Option<OsString> = reloader.path.file_name().map(|n| n.to_os_string());
        let watched_path = reloader.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let touches_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !touches_file || !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    if let Some(config) = reloader.reload() {
                        let _ = update_tx.send(config);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?watched_path, "Watching config file for key and alias changes");
        Ok(watcher)
    }
}
