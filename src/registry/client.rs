//! Client registry
//!
//! Clients are auto-registered when their connection is accepted and demoted
//! to offline when it closes. Unlike agents, a name is optional and carries
//! no uniqueness constraint.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ParticipantStatus;

/// A connected (or previously connected) client.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub name: Option<String>,
    pub status: ParticipantStatus,
    pub connection_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Authoritative table of clients, keyed by id.
pub struct ClientRegistry {
    inner: RwLock<HashMap<String, Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Auto-register a fresh client for an accepted connection.
    pub async fn register(&self, connection_id: Uuid) -> Client {
        let now = Utc::now();
        let client = Client {
            id: Uuid::new_v4().to_string(),
            name: None,
            status: ParticipantStatus::Online,
            connection_id: Some(connection_id),
            registered_at: now,
            last_active_at: now,
        };
        self.inner
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        client
    }

    pub async fn get(&self, id: &str) -> Option<Client> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn get_by_connection(&self, connection_id: Uuid) -> Option<Client> {
        self.inner
            .read()
            .await
            .values()
            .find(|c| c.connection_id == Some(connection_id))
            .cloned()
    }

    /// Apply an explicit `client.register`: optional display name plus an
    /// activity bump.
    pub async fn update_identity(&self, id: &str, name: Option<String>) -> Option<Client> {
        let mut inner = self.inner.write().await;
        let client = inner.get_mut(id)?;
        if name.is_some() {
            client.name = name;
        }
        client.last_active_at = Utc::now();
        Some(client.clone())
    }

    pub async fn touch(&self, id: &str) {
        if let Some(client) = self.inner.write().await.get_mut(id) {
            client.last_active_at = Utc::now();
        }
    }

    pub async fn mark_disconnected(&self, connection_id: Uuid) -> Option<Client> {
        let mut inner = self.inner.write().await;
        let client = inner
            .values_mut()
            .find(|c| c.connection_id == Some(connection_id))?;
        client.connection_id = None;
        client.status = ParticipantStatus::Offline;
        Some(client.clone())
    }

    pub async fn list(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.inner.read().await.values().cloned().collect();
        clients.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        clients
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_register_and_lookup() {
        let registry = ClientRegistry::new();
        let conn = Uuid::new_v4();
        let client = registry.register(conn).await;

        assert_eq!(client.status, ParticipantStatus::Online);
        assert!(client.name.is_none());
        assert_eq!(
            registry.get_by_connection(conn).await.unwrap().id,
            client.id
        );
    }

    #[tokio::test]
    async fn test_update_identity() {
        let registry = ClientRegistry::new();
        let client = registry.register(Uuid::new_v4()).await;

        let updated = registry
            .update_identity(&client.id, Some("dashboard".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.name.as_deref(), Some("dashboard"));
        assert!(updated.last_active_at >= client.last_active_at);

        // A later update without a name keeps the old one
        let again = registry.update_identity(&client.id, None).await.unwrap();
        assert_eq!(again.name.as_deref(), Some("dashboard"));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_record() {
        let registry = ClientRegistry::new();
        let conn = Uuid::new_v4();
        let client = registry.register(conn).await;

        registry.mark_disconnected(conn).await.unwrap();
        let kept = registry.get(&client.id).await.unwrap();
        assert_eq!(kept.status, ParticipantStatus::Offline);
        assert!(kept.connection_id.is_none());
    }
}
