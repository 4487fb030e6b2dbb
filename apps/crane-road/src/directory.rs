//! Boundary to the durable agent/user records. The broker only needs to find
//! an agent by name, keep its status current and resolve a user's place.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
}

impl AgentStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "idle" => Some(AgentStatus::Idle),
            "running" => Some(AgentStatus::Running),
            "paused" => Some(AgentStatus::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub algorithm_id: String,
    pub name: String,
    #[serde(default)]
    pub map_name: Option<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub place_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("agent {0} not found")]
    NotFound(String),
    #[error("agent name {0} already registered")]
    Duplicate(String),
    #[error("directory backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<AgentRegistration>, DirectoryError>;

    async fn get(&self, algorithm_id: &str) -> Result<Option<AgentRegistration>, DirectoryError>;

    async fn create(&self, registration: AgentRegistration) -> Result<(), DirectoryError>;

    async fn update(&self, registration: AgentRegistration) -> Result<(), DirectoryError>;

    async fn update_status(
        &self,
        algorithm_id: &str,
        status: AgentStatus,
    ) -> Result<(), DirectoryError>;

    /// Place the user works in, used to locate their position bucket.
    async fn place_of_user(&self, user_id: &str) -> Result<Option<String>, DirectoryError>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    agents: Mutex<HashMap<String, AgentRegistration>>,
    user_places: Mutex<HashMap<String, String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn assign_place(&self, user_id: &str, place_id: &str) {
        self.user_places
            .lock()
            .await
            .insert(user_id.to_string(), place_id.to_string());
    }
}

#[async_trait]
impl AgentDirectory for InMemoryDirectory {
    async fn find_by_name(&self, name: &str) -> Result<Option<AgentRegistration>, DirectoryError> {
        Ok(self
            .agents
            .lock()
            .await
            .values()
            .find(|a| a.name == name)
            .cloned())
    }

    async fn get(&self, algorithm_id: &str) -> Result<Option<AgentRegistration>, DirectoryError> {
        Ok(self.agents.lock().await.get(algorithm_id).cloned())
    }

    async fn create(&self, registration: AgentRegistration) -> Result<(), DirectoryError> {
        let mut guard = self.agents.lock().await;
        if guard.values().any(|a| a.name == registration.name) {
            return Err(DirectoryError::Duplicate(registration.name));
        }
        guard.insert(registration.algorithm_id.clone(), registration);
        Ok(())
    }

    async fn update(&self, registration: AgentRegistration) -> Result<(), DirectoryError> {
        let mut guard = self.agents.lock().await;
        match guard.get_mut(&registration.algorithm_id) {
            Some(existing) => {
                *existing = registration;
                Ok(())
            }
            None => Err(DirectoryError::NotFound(registration.algorithm_id)),
        }
    }

    async fn update_status(
        &self,
        algorithm_id: &str,
        status: AgentStatus,
    ) -> Result<(), DirectoryError> {
        let mut guard = self.agents.lock().await;
        let agent = guard
            .get_mut(algorithm_id)
            .ok_or_else(|| DirectoryError::NotFound(algorithm_id.to_string()))?;
        agent.status = status;
        Ok(())
    }

    async fn place_of_user(&self, user_id: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.user_places.lock().await.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, name: &str) -> AgentRegistration {
        AgentRegistration {
            algorithm_id: id.into(),
            name: name.into(),
            map_name: None,
            status: AgentStatus::Running,
            place_id: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn finds_agent_by_name_and_resets_status() {
        let directory = InMemoryDirectory::new();
        directory.create(agent("a-1", "tower-north")).await.unwrap();
        let found = directory.find_by_name("tower-north").await.unwrap().unwrap();
        assert_eq!(found.algorithm_id, "a-1");

        directory.update_status("a-1", AgentStatus::Idle).await.unwrap();
        assert_eq!(
            directory.get("a-1").await.unwrap().unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let directory = InMemoryDirectory::new();
        directory.create(agent("a-1", "tower-north")).await.unwrap();
        let err = directory.create(agent("a-2", "tower-north")).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Duplicate(_)));
    }

    #[tokio::test]
    async fn unknown_agent_status_update_fails() {
        let directory = InMemoryDirectory::new();
        let err = directory
            .update_status("missing", AgentStatus::Idle)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }
}
