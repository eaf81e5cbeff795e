//! Single-process registry persisted to a JSON file.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Forest, ForestChange, ForestStatus, InfallibleFuture, Node, NodeStatus, Registry, RegistryData,
    RegistryError, RegistryFuture,
};

const TEMP_SUFFIX: &str = ".tmp";

/// Registry backed by a JSON file on local disk.
///
/// The file is read once when the registry is opened. Every mutation is
/// applied to a copy of the in-memory snapshot, written to a temporary file
/// that is renamed over the target, and only then swapped into memory. A
/// failed write leaves both memory and disk at the previous version.
/// Nothing is awaited once the write lock is held, so a dropped mutation
/// either never started or finished completely.
#[derive(Debug)]
pub struct LocalRegistry {
    path: Utf8PathBuf,
    state: RwLock<RegistryData>,
}

impl LocalRegistry {
    /// Opens the registry at `path`, starting empty when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] when the file exists but cannot be read
    /// and [`RegistryError::Document`] when it does not hold a registry.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let data = load(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(data),
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns a copy of the current snapshot.
    pub async fn snapshot(&self) -> RegistryData {
        self.state.read().await.clone()
    }

    async fn read<T>(
        &self,
        read: impl FnOnce(&RegistryData) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let guard = self.state.read().await;
        read(&guard)
    }

    async fn mutate<T>(
        &self,
        mutate: impl FnOnce(&mut RegistryData) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let outcome = mutate(&mut next)?;
        persist(&self.path, &next)?;
        *guard = next;
        Ok(outcome)
    }
}

impl Registry for LocalRegistry {
    fn endpoint(&self) -> String {
        self.path.to_string()
    }

    fn register_forest(&self, forest: Forest) -> RegistryFuture<'_, ()> {
        Box::pin(async move { self.mutate(|data| data.insert_forest(forest)).await })
    }

    fn register_node(&self, node: Node) -> RegistryFuture<'_, ()> {
        Box::pin(async move { self.mutate(|data| data.insert_node(node)).await })
    }

    fn remove_node<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
    ) -> RegistryFuture<'a, Node> {
        Box::pin(async move {
            self.mutate(|data| data.remove_node(forest_id, node_id))
                .await
        })
    }

    fn get_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Forest> {
        Box::pin(async move { self.read(|data| data.forest(forest_id).cloned()).await })
    }

    fn get_nodes<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Vec<Node>> {
        Box::pin(async move {
            self.read(|data| data.nodes(forest_id).map(<[Node]>::to_vec))
                .await
        })
    }

    fn update_forest(&self, forest: Forest) -> RegistryFuture<'_, ()> {
        Box::pin(async move { self.mutate(|data| data.replace_forest(forest)).await })
    }

    fn amend_forest<'a>(
        &'a self,
        forest_id: &'a str,
        change: ForestChange,
    ) -> RegistryFuture<'a, Forest> {
        Box::pin(async move {
            self.mutate(|data| data.amend_forest(forest_id, &change))
                .await
        })
    }

    fn update_forest_status<'a>(
        &'a self,
        forest_id: &'a str,
        status: ForestStatus,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.mutate(|data| data.set_forest_status(forest_id, status))
                .await
        })
    }

    fn update_node_status<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
        status: NodeStatus,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.mutate(|data| data.set_node_status(forest_id, node_id, status))
                .await
        })
    }

    fn delete_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.mutate(|data| data.remove_forest(forest_id).map(|_| ()))
                .await
        })
    }

    fn list_forests(&self) -> InfallibleFuture<'_, Vec<Forest>> {
        Box::pin(async move { self.state.read().await.forest_list() })
    }

    fn check_reachable(&self) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            let parent = parent_of(&self.path);
            Dir::open_ambient_dir(parent, ambient_authority())
                .map(|_| ())
                .map_err(|err| io_error(parent, &err))
        })
    }
}

fn parent_of(path: &Utf8Path) -> &Utf8Path {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    }
}

fn file_name_of(path: &Utf8Path) -> Result<&str, RegistryError> {
    path.file_name().ok_or_else(|| RegistryError::Io {
        path: path.to_path_buf(),
        message: String::from("registry path is missing a filename"),
    })
}

fn io_error(path: &Utf8Path, err: &io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn load(path: &Utf8Path) -> Result<RegistryData, RegistryError> {
    let parent = parent_of(path);
    let file_name = file_name_of(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RegistryData::new()),
        Err(err) => return Err(io_error(parent, &err)),
    };
    let contents = match dir.read_to_string(file_name) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RegistryData::new()),
        Err(err) => return Err(io_error(path, &err)),
    };
    if contents.trim().is_empty() {
        return Ok(RegistryData::new());
    }
    Ok(serde_json::from_str(&contents)?)
}

fn persist(path: &Utf8Path, data: &RegistryData) -> Result<(), RegistryError> {
    let parent = parent_of(path);
    let file_name = file_name_of(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;

    let rendered = serde_json::to_vec_pretty(data)?;
    let temp_name = format!(".{file_name}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple());
    dir.write(&temp_name, rendered)
        .map_err(|err| io_error(&parent.join(&temp_name), &err))?;
    dir.rename(&temp_name, &dir, file_name)
        .map_err(|err| io_error(path, &err))
}
