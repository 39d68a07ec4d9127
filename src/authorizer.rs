//! Client authorization against the static allow-list
//!
//! Maps a client identity (certificate Common Name) to the upstream
//! addresses it may reach. The mapping is built from configuration at
//! startup; the hot path is read-only. An empty lookup result means the
//! client is rejected.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Static client -> upstreams allow-list
pub struct Authorizer {
    allow_list: RwLock<HashMap<String, Vec<String>>>,
}

impl Authorizer {
    /// Create an empty authorizer
    pub fn new() -> Self {
        Self {
            allow_list: RwLock::new(HashMap::new()),
        }
    }

    /// Build from the configured allow-list
    pub fn from_config(clients: &HashMap<String, Vec<String>>) -> Self {
        let authorizer = Self::new();
        for (client, upstreams) in clients {
            authorizer.register(client.clone(), upstreams.clone());
        }
        authorizer
    }

    /// Register a client with its permitted upstreams, replacing any prior
    /// registration. Expected only during startup.
    pub fn register(&self, client: impl Into<String>, upstreams: Vec<String>) {
        self.allow_list.write().insert(client.into(), upstreams);
    }

    /// Look up the upstreams a client may reach; empty if unknown.
    pub fn lookup(&self, client: &str) -> Vec<String> {
        self.allow_list
            .read()
            .get(client)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Authorizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_client_gets_empty_list() {
        let authorizer = Authorizer::new();
        assert!(authorizer.lookup("nobody").is_empty());
    }

    #[test]
    fn test_lookup_returns_registered_upstreams() {
        let authorizer = Authorizer::new();
        authorizer.register("frontend", vec!["127.0.0.1:9001".to_string()]);

        assert_eq!(authorizer.lookup("frontend"), vec!["127.0.0.1:9001"]);
    }

    #[test]
    fn test_register_replaces_prior_entry() {
        let authorizer = Authorizer::new();
        authorizer.register("frontend", vec!["127.0.0.1:9001".to_string()]);
        authorizer.register("frontend", vec!["127.0.0.1:9002".to_string()]);

        assert_eq!(authorizer.lookup("frontend"), vec!["127.0.0.1:9002"]);
    }

    #[test]
    fn test_from_config() {
        let mut clients = HashMap::new();
        clients.insert(
            "batch".to_string(),
            vec!["127.0.0.1:9001".to_string(), "127.0.0.1:9002".to_string()],
        );

        let authorizer = Authorizer::from_config(&clients);
        assert_eq!(
            authorizer.lookup("batch"),
            vec!["127.0.0.1:9001", "127.0.0.1:9002"]
        );
        assert!(authorizer.lookup("other").is_empty());
    }
}
