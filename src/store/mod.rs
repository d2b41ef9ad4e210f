//! Resource Stores
//!
//! Implementations of the [`ResourceStore`](crate::domain::ports::ResourceStore)
//! and [`ReplicationStore`](crate::domain::ports::ReplicationStore) ports.
//!
//! - [`KubeResourceStore`]: talks to the Kubernetes API server
//! - [`MemoryResourceStore`]: in-process maps for standalone mode and tests

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeResourceStore;
pub use memory::{DeploymentFixture, MemoryResourceStore, StoreFixture};

use std::collections::BTreeMap;

/// Match labels against an equality-based selector (`a=b,c!=d,e`)
pub(crate) fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);

    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
            {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else if let Some(key) = term.strip_prefix('!') {
                !labels.contains_key(key.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_selector() {
        let labels: BTreeMap<String, String> = [("app", "db"), ("tier", "gold")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert!(matches_selector(Some(&labels), "app=db"));
        assert!(matches_selector(Some(&labels), "app==db, tier=gold"));
        assert!(matches_selector(Some(&labels), "tier"));
        assert!(matches_selector(Some(&labels), "!zone"));
        assert!(!matches_selector(Some(&labels), "app!=db"));
        assert!(!matches_selector(None, "app=db"));
        assert!(matches_selector(None, ""));
    }
}
