//! In-memory string key/value store with path-style listing
//!
//! Backs the node-local table catalog. Keys are slash-separated paths and
//! patterns follow shell glob rules where `*` never crosses a `/`.

use crate::common::{Error, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub key: String,
    pub value: String,
    pub ver: u64,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Concurrent map of `Pair`s
#[derive(Debug, Default)]
pub struct MapStore {
    map: RwLock<HashMap<String, Pair>>,
}

impl MapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str, ver: u64) -> Pair {
        let pair = Pair {
            key: key.to_string(),
            value: value.to_string(),
            ver,
        };
        self.map
            .write()
            .unwrap()
            .insert(key.to_string(), pair.clone());
        pair
    }

    pub fn get(&self, key: &str) -> Result<Pair> {
        self.map
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(Error::KeyNotFound)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.map.read().unwrap().contains_key(key)
    }

    pub fn delete(&self, key: &str) {
        self.map.write().unwrap().remove(key);
    }

    /// Pairs whose key matches `pattern`, sorted by key
    pub fn get_all(&self, pattern: &str) -> Result<Vec<Pair>> {
        let pattern = Pattern::new(pattern)
            .map_err(|e| Error::InvalidArgument(format!("bad pattern {:?}: {}", pattern, e)))?;

        let mut pairs: Vec<Pair> = self
            .map
            .read()
            .unwrap()
            .values()
            .filter(|p| pattern.matches_with(&p.key, MATCH_OPTIONS))
            .cloned()
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs)
    }

    /// Values of the pairs whose key matches `pattern`, sorted by value
    pub fn get_all_values(&self, pattern: &str) -> Result<Vec<String>> {
        let mut values: Vec<String> = self
            .get_all(pattern)?
            .into_iter()
            .map(|p| p.value)
            .collect();
        values.sort();
        Ok(values)
    }

    /// Names of the direct children of `path`, keys and directories alike
    pub fn list(&self, path: &str) -> Vec<String> {
        let prefix = path_terms(path);
        let mut names = BTreeSet::new();

        for key in self.map.read().unwrap().keys() {
            if key == path {
                names.insert(base(key).to_string());
                continue;
            }
            if starts_with_terms(&path_terms(dir(key)), &prefix) {
                let stripped = key
                    .strip_prefix(path)
                    .unwrap_or(key)
                    .trim_start_matches('/');
                if let Some(first) = stripped.split('/').next() {
                    names.insert(first.to_string());
                }
            }
        }
        names.into_iter().collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&*self.map.read().unwrap())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let map: HashMap<String, Pair> = serde_json::from_str(json)?;
        Ok(Self {
            map: RwLock::new(map),
        })
    }
}

fn path_terms(path: &str) -> Vec<&str> {
    path.split('/').filter(|t| !t.is_empty()).collect()
}

fn starts_with_terms(terms: &[&str], prefix: &[&str]) -> bool {
    terms.len() >= prefix.len() && terms[..prefix.len()] == *prefix
}

fn dir(key: &str) -> &str {
    match key.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((dir, _)) => dir,
    }
}

fn base(key: &str) -> &str {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MapStore {
        let store = MapStore::new();
        store.set("/tables/orders", "b", 1);
        store.set("/tables/users", "a", 1);
        store.set("/tables/archive/2023", "c", 1);
        store.set("/ids/last-shard", "10002", 3);
        store
    }

    #[test]
    fn test_get_set_delete() {
        let store = store();
        assert_eq!(store.get("/ids/last-shard").unwrap().ver, 3);
        assert!(store.exists("/tables/orders"));

        store.delete("/tables/orders");
        assert!(matches!(store.get("/tables/orders"), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_get_all_star_stops_at_separator() {
        let store = store();
        let keys: Vec<String> = store
            .get_all("/tables/*")
            .unwrap()
            .into_iter()
            .map(|p| p.key)
            .collect();
        assert_eq!(keys, vec!["/tables/orders", "/tables/users"]);

        assert_eq!(store.get_all_values("/tables/*").unwrap(), vec!["a", "b"]);
        assert!(store.get_all("/tables/[").is_err());
    }

    #[test]
    fn test_list_children() {
        let store = store();
        assert_eq!(store.list("/tables"), vec!["archive", "orders", "users"]);
        assert_eq!(store.list("/ids/last-shard"), vec!["last-shard"]);
        assert_eq!(store.list("/"), vec!["ids", "tables"]);
        assert!(store.list("/leases").is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let store = store();
        let json = store.to_json().unwrap();
        let restored = MapStore::from_json(&json).unwrap();
        assert_eq!(restored.get("/tables/users").unwrap().value, "a");
        assert_eq!(restored.list("/tables").len(), 3);
    }
}
