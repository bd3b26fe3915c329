//! Pages known to the host and which worker controls them.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::AgentError;

/// A client: an open page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Version tag of the controlling worker, if any.
    pub controller: Option<String>,
}

impl Client {
    pub fn is_controlled(&self) -> bool {
        self.controller.is_some()
    }
}

/// Clients registry.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, uncontrolled window for `url`.
    pub fn open_window(&mut self, url: &str) -> Result<Client, AgentError> {
        let url = Url::parse(url).map_err(|e| AgentError::Config(format!("{url}: {e}")))?;
        let client = Client {
            id: next_client_id(),
            url,
            controller: None,
        };
        self.clients.insert(client.id.clone(), client.clone());
        Ok(client)
    }

    /// All clients, optionally including uncontrolled ones, sorted by ID.
    pub fn match_all(&self, include_uncontrolled: bool) -> Vec<&Client> {
        let mut clients: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| include_uncontrolled || c.is_controlled())
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    /// Make the worker tagged `version_tag` control every client.
    ///
    /// Returns how many clients changed controller.
    pub fn claim(&mut self, version_tag: &str) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.controller.as_deref() != Some(version_tag) {
                client.controller = Some(version_tag.to_string());
                claimed += 1;
            }
        }
        claimed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:06}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_window_is_uncontrolled() {
        let mut clients = ClientRegistry::new();
        let client = clients.open_window("https://example.com/").unwrap();

        assert!(!client.is_controlled());
        assert!(clients.match_all(false).is_empty());
        assert_eq!(clients.match_all(true), vec![&client]);
    }

    #[test]
    fn test_open_window_rejects_bad_url() {
        let mut clients = ClientRegistry::new();
        assert!(clients.open_window("::nope").is_err());
        assert!(clients.is_empty());
    }

    #[test]
    fn test_claim_takes_over_every_client() {
        let mut clients = ClientRegistry::new();
        clients.open_window("https://example.com/").unwrap();
        clients.open_window("https://example.com/auth/login").unwrap();

        assert_eq!(clients.claim("v6"), 2);
        assert_eq!(clients.claim("v6"), 0);
        assert_eq!(clients.claim("v7"), 2);
        assert!(clients
            .match_all(false)
            .iter()
            .all(|c| c.controller.as_deref() == Some("v7")));
    }
}
