//! Read-only lookups of the records a job refers to.

use crate::Identifier;
use anyhow::{anyhow, Error};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: Identifier,
    pub user_id: Identifier,
    pub name: String,
    /// Location of the original stored asset.
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Identifier,
    pub email: String,
    pub name: Option<String>,
}

impl UserRecord {
    /// Name used to greet the user; falls back to the email address.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => &self.email,
        }
    }
}

/// Shared by every concurrent job invocation; implementations must not
/// hold per-job state.
#[async_trait]
pub trait DataGateway: Send + Sync {
    /// Finds a file only if it belongs to `user_id`.
    async fn find_file_by_id(
        &self,
        file_id: &Identifier,
        user_id: &Identifier,
    ) -> Result<Option<FileRecord>, Error>;

    async fn find_user_by_id(&self, user_id: &Identifier) -> Result<Option<UserRecord>, Error>;
}

#[derive(Default)]
pub struct MemoryGateway {
    files: RwLock<HashMap<Identifier, FileRecord>>,
    users: RwLock<HashMap<Identifier, UserRecord>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&self, file: FileRecord) -> Result<(), Error> {
        let mut files = self.files.write().map_err(|_| anyhow!("file table lock poisoned"))?;
        files.insert(file.id.clone(), file);
        Ok(())
    }

    pub fn insert_user(&self, user: UserRecord) -> Result<(), Error> {
        let mut users = self.users.write().map_err(|_| anyhow!("user table lock poisoned"))?;
        users.insert(user.id.clone(), user);
        Ok(())
    }
}

#[async_trait]
impl DataGateway for MemoryGateway {
    async fn find_file_by_id(
        &self,
        file_id: &Identifier,
        user_id: &Identifier,
    ) -> Result<Option<FileRecord>, Error> {
        let files = self.files.read().map_err(|_| anyhow!("file table lock poisoned"))?;
        Ok(files
            .get(file_id)
            .filter(|file| &file.user_id == user_id)
            .cloned())
    }

    async fn find_user_by_id(&self, user_id: &Identifier) -> Result<Option<UserRecord>, Error> {
        let users = self.users.read().map_err(|_| anyhow!("user table lock poisoned"))?;
        Ok(users.get(user_id).cloned())
    }
}
