use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{info, warn};

pub const SESSION_ID_KEY: &str = "session_id";
pub const SPEED_LIMIT_KEY: &str = "speedLimit";
pub const ACTIVE_DOWNLOADS_KEY: &str = "activeDownloads";

/// Key-value persistence backed by a single JSON object file.
///
/// Reads are served from memory; every write rewrites the file.
pub struct Store {
    path: Option<PathBuf>,
    values: Map<String, Value>,
}

impl Store {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Ignoring unreadable store {:?}: {}", path, e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating new store at {:?}", path);
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            values,
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Map::new(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Stored value for {} is malformed: {}", key, e);
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        self.values
            .insert(key.to_string(), serde_json::to_value(value)?);
        self.flush().await
    }

    pub async fn delete(&mut self, key: &str) -> Result<()> {
        if self.values.remove(key).is_some() {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(&self.values)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let mut store = Store::open(path.clone()).await.unwrap();
        assert_eq!(store.get::<u64>(SPEED_LIMIT_KEY), None);
        store.set(SPEED_LIMIT_KEY, &4096u64).await.unwrap();
        store.set(SESSION_ID_KEY, "abc").await.unwrap();

        let mut reopened = Store::open(path.clone()).await.unwrap();
        assert_eq!(reopened.get::<u64>(SPEED_LIMIT_KEY), Some(4096));
        assert_eq!(reopened.get::<String>(SESSION_ID_KEY).as_deref(), Some("abc"));

        reopened.delete(SPEED_LIMIT_KEY).await.unwrap();
        let again = Store::open(path).await.unwrap();
        assert_eq!(again.get::<u64>(SPEED_LIMIT_KEY), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = Store::open(path).await.unwrap();
        assert_eq!(store.get::<u64>(SPEED_LIMIT_KEY), None);
    }

    #[tokio::test]
    async fn test_malformed_value_reads_as_missing() {
        let mut store = Store::in_memory();
        store.set(SPEED_LIMIT_KEY, "fast").await.unwrap();
        assert_eq!(store.get::<u64>(SPEED_LIMIT_KEY), None);
    }
}
