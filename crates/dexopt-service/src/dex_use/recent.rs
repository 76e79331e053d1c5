//! Small LRU of recently resolved dex file owners

use std::collections::VecDeque;

/// Maps dex paths to the package that owned them last time, most recent at the back
#[derive(Debug)]
pub(crate) struct RecentOwners {
    entries: VecDeque<(String, String)>,
    capacity: usize,
}

impl RecentOwners {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Owner of `dex_path`, marking the entry as most recently used
    pub(crate) fn get(&mut self, dex_path: &str) -> Option<String> {
        let index = self.entries.iter().position(|(path, _)| path == dex_path)?;
        let entry = self.entries.remove(index)?;
        let owner = entry.1.clone();
        self.entries.push_back(entry);
        Some(owner)
    }

    pub(crate) fn put(&mut self, dex_path: &str, owner: &str) {
        self.remove(dex_path);
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries
            .push_back((dex_path.to_string(), owner.to_string()));
    }

    pub(crate) fn remove(&mut self, dex_path: &str) {
        self.entries.retain(|(path, _)| path != dex_path);
    }

    /// Owners from most to least recently used
    pub(crate) fn owners_most_recent_first(&self) -> Vec<String> {
        self.entries
            .iter()
            .rev()
            .map(|(_, owner)| owner.clone())
            .collect()
    }
}
