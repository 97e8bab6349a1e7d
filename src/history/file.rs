use async_trait::async_trait;
use std::path::{ Path, PathBuf };
use tokio::fs;

use super::{ KvStore, StoreError };

/// One file per key under a directory. Writes go through a temporary file
/// and a rename.
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.json", name))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path()).unwrap();
        store.set("nexora-sessions-pro", "[1]").await.unwrap();

        let reopened = FileKvStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get("nexora-sessions-pro").await.unwrap().as_deref(), Some("[1]"));

        reopened.remove("nexora-sessions-pro").await.unwrap();
        reopened.remove("nexora-sessions-pro").await.unwrap();
        assert_eq!(reopened.get("nexora-sessions-pro").await.unwrap(), None);
    }

    #[test]
    fn keys_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path()).unwrap();
        let path = store.path_for("../../etc/passwd");
        assert_eq!(path.parent(), Some(dir.path()));
    }
}
