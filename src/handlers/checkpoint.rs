use crate::engine::EngineState;
use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// Networks that can be written to disk by name.
pub trait NetworkSet {
    fn network_names(&self) -> Vec<String>;

    /// Save `name` next to `stem` (the recorder picks the extension) and
    /// return the path actually written.
    fn save_network(&self, name: &str, stem: &Path) -> Result<PathBuf>;
}

/// Periodic parameter snapshots, keeping only the most recent `n_saved` per name.
#[derive(Debug)]
pub struct ModelCheckpoint {
    dir: PathBuf,
    prefix: String,
    save_interval: usize,
    n_saved: usize,
    saved: HashMap<String, VecDeque<PathBuf>>,
}

impl ModelCheckpoint {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: &str,
        save_interval: usize,
        n_saved: usize,
    ) -> Result<Self> {
        if n_saved == 0 {
            return Err(anyhow::anyhow!("n_saved must be at least 1"));
        }
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            save_interval,
            n_saved,
            saved: HashMap::new(),
        })
    }

    /// Epoch-completed hook: save when the epoch hits the interval.
    pub fn on_epoch_completed<N: NetworkSet>(
        &mut self,
        state: &EngineState,
        networks: &N,
    ) -> Result<Vec<PathBuf>> {
        if self.save_interval == 0 || state.epoch % self.save_interval != 0 {
            return Ok(Vec::new());
        }
        self.save(state, networks, "")
    }

    /// Save every network as `{prefix}_{name_prefix}{name}_{iteration}`, unconditionally.
    pub fn save<N: NetworkSet>(
        &mut self,
        state: &EngineState,
        networks: &N,
        name_prefix: &str,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for name in networks.network_names() {
            let saved_name = format!("{name_prefix}{name}");
            let stem = self
                .dir
                .join(format!("{}_{}_{}", self.prefix, saved_name, state.iteration));
            let path = networks
                .save_network(&name, &stem)
                .with_context(|| format!("failed to save network {name} to {}", stem.display()))?;
            log::info!("saved {}", path.display());

            let history = self.saved.entry(saved_name).or_default();
            if history.back() != Some(&path) {
                history.push_back(path.clone());
            }
            while history.len() > self.n_saved {
                if let Some(stale) = history.pop_front() {
                    if let Err(err) = std::fs::remove_file(&stale) {
                        log::warn!("failed to remove old checkpoint {}: {err}", stale.display());
                    }
                }
            }
            written.push(path);
        }

        write_engine_state(&self.dir.join("state.json"), state)?;
        Ok(written)
    }

    /// Checkpoints currently retained for `saved_name`, oldest first.
    pub fn retained(&self, saved_name: &str) -> Vec<PathBuf> {
        self.saved
            .get(saved_name)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn write_engine_state(path: &Path, state: &EngineState) -> Result<()> {
    let state_json =
        serde_json::to_string_pretty(state).context("failed to serialize engine state")?;
    std::fs::write(path, state_json)
        .with_context(|| format!("failed to write {}", path.display()))
}
