use async_trait::async_trait;
use dashmap::DashMap;

use super::error::StoreError;
use crate::models::Credential;

/// Where credential records live. Owned by the embedding application.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, subject_id: &str) -> Result<Option<Credential>, StoreError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<Credential>, StoreError>;

    async fn update_credential(&self, credential: Credential) -> Result<(), StoreError>;
}

/// Credentials keyed by subject id, with a case-insensitive username index.
/// Names are folded the same way lockout keys are.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    by_subject: DashMap<String, Credential>,
    by_username: DashMap<String, String>,
}

fn username_key(username: &str) -> String {
    username.trim().to_lowercase()
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: Credential) {
        self.by_username
            .insert(username_key(&credential.username), credential.subject_id.clone());
        self.by_subject
            .insert(credential.subject_id.clone(), credential);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_credential(&self, subject_id: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.by_subject.get(subject_id).map(|c| c.clone()))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Credential>, StoreError> {
        let Some(subject_id) = self
            .by_username
            .get(&username_key(username))
            .map(|id| id.clone())
        else {
            return Ok(None);
        };
        self.get_credential(&subject_id).await
    }

    async fn update_credential(&self, credential: Credential) -> Result<(), StoreError> {
        if !self.by_subject.contains_key(&credential.subject_id) {
            return Err(StoreError::NotFound(format!(
                "no credential for subject {}",
                credential.subject_id
            )));
        }
        self.insert(credential);
        Ok(())
    }
}
