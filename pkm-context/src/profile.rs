use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Supplies the user-profile text placed after the static instructions.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn load(&self) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticProfile(Option<String>);

impl StaticProfile {
    pub fn new(text: impl Into<String>) -> Self {
        Self(Some(text.into()))
    }

    pub fn empty() -> Self {
        Self(None)
    }
}

#[async_trait]
impl ProfileSource for StaticProfile {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Reads the profile from disk on every call so edits show up without a restart.
/// A missing file means no profile.
#[derive(Debug, Clone)]
pub struct FileProfile {
    path: PathBuf,
}

impl FileProfile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProfileSource for FileProfile {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(None),
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
