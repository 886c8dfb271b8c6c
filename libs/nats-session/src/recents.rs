//! Recently used server urls and subjects, persisted as a small JSON file.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use config::Recents as RecentsLimits;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConsoleResult;

/// Capped most-recent-first list without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecentList {
    items: VecDeque<String>,
}

impl RecentList {
    /// Move `item` to the front, dropping the oldest entries beyond `cap`.
    pub fn push(&mut self, item: &str, cap: usize) {
        let item = item.trim();
        if item.is_empty() {
            return;
        }
        self.items.retain(|existing| existing != item);
        self.items.push_front(item.to_owned());
        self.items.truncate(cap);
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    last_url: Option<String>,
    #[serde(default)]
    urls: RecentList,
    #[serde(default)]
    subjects: RecentList,
}

/// Recents backed by a state file.
#[derive(Debug, Clone)]
pub struct RecentsStore {
    path: Option<PathBuf>,
    limits: RecentsLimits,
    state: State,
}

impl RecentsStore {
    /// In-memory store that is never written anywhere.
    pub fn ephemeral(limits: RecentsLimits) -> Self {
        Self {
            path: None,
            limits,
            state: State::default(),
        }
    }

    /// Load the state file at `path`. A missing file starts empty; an
    /// unreadable one is logged and replaced on the next save.
    pub fn load(path: impl Into<PathBuf>, limits: RecentsLimits) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<State>(&raw) {
                Ok(mut state) => {
                    // limits may have shrunk since the file was written
                    state.urls.items.truncate(limits.urls);
                    state.subjects.items.truncate(limits.subjects);
                    state
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring corrupt console state file");
                    State::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no console state file yet");
                State::default()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read console state file");
                State::default()
            }
        };
        Self {
            path: Some(path),
            limits,
            state,
        }
    }

    /// Record a url that was connected to successfully.
    pub fn remember_url(&mut self, url: &str) {
        self.state.urls.push(url, self.limits.urls);
        self.state.last_url = self.state.urls.iter().next().map(str::to_owned);
    }

    /// Record a subject that was used for pub, sub or req.
    pub fn remember_subject(&mut self, subject: &str) {
        self.state.subjects.push(subject, self.limits.subjects);
    }

    pub fn last_url(&self) -> Option<&str> {
        self.state.last_url.as_deref()
    }

    pub fn urls(&self) -> &RecentList {
        &self.state.urls
    }

    pub fn subjects(&self) -> &RecentList {
        &self.state.subjects
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the state file, creating its directory if needed.
    pub fn save(&self) -> ConsoleResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let raw = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| crate::error::ConsoleError::Config(format!("encode state: {e}")))?;
        std::fs::write(path, raw)?;
        debug!(path = %path.display(), "saved console state");
        Ok(())
    }
}
