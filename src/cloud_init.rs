//! Cloud-init user-data resolution and per-node rendering.
//!
//! User-data can be provided either inline (for example `#cloud-config`) or
//! via a file path. The resolved payload is shared by every node of a forest;
//! a handful of placeholders let a single document tell the leader apart from
//! the workers:
//!
//! | Placeholder | Replaced with |
//! | --- | --- |
//! | `${FORESTER_FOREST_ID}` | forest identifier |
//! | `${FORESTER_NODE_NAME}` | deterministic node name |
//! | `${FORESTER_NODE_ROLE}` | `leader` or `worker` |

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::registry::NodeRole;

const FOREST_ID_PLACEHOLDER: &str = "${FORESTER_FOREST_ID}";
const NODE_NAME_PLACEHOLDER: &str = "${FORESTER_NODE_NAME}";
const NODE_ROLE_PLACEHOLDER: &str = "${FORESTER_NODE_ROLE}";

/// Errors raised while resolving cloud-init user-data.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CloudInitError {
    /// Raised when both inline and file sources are provided.
    #[error("cloud-init user-data cannot be provided both inline and via file")]
    BothProvided,
    /// Raised when an inline payload is empty or only whitespace.
    #[error("cloud-init user-data must not be empty")]
    InlineEmpty,
    /// Raised when a file path is empty or only whitespace.
    #[error("cloud-init user-data file path must not be empty")]
    FilePathEmpty,
    /// Raised when a file resolves to empty or only whitespace.
    #[error("cloud-init user-data file must not be empty")]
    FileEmpty,
    /// Raised when reading the file source fails.
    #[error("failed to read cloud-init user-data file `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Resolves cloud-init user-data from either an inline value or a file.
///
/// Inline and file sources are mutually exclusive. Both values are trimmed for
/// emptiness checks, but the returned payload preserves the original content.
///
/// # Errors
///
/// Returns [`CloudInitError`] when the inputs are invalid or the file cannot be
/// read.
pub fn resolve_cloud_init_user_data(
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<String>, CloudInitError> {
    if inline.is_some() && file.is_some() {
        return Err(CloudInitError::BothProvided);
    }

    if let Some(payload) = inline {
        validate_payload(payload)?;
        return Ok(Some(payload.to_owned()));
    }

    let Some(path) = file else {
        return Ok(None);
    };

    if path.trim().is_empty() {
        return Err(CloudInitError::FilePathEmpty);
    }

    let expanded = expand_home(path);
    let content =
        read_to_string_ambient(&expanded).map_err(|message| CloudInitError::FileRead {
            path: expanded.clone(),
            message,
        })?;

    validate_payload(&content).map_err(|err| match err {
        CloudInitError::InlineEmpty => CloudInitError::FileEmpty,
        other => other,
    })?;

    Ok(Some(content))
}

fn validate_payload(payload: &str) -> Result<(), CloudInitError> {
    if payload.trim().is_empty() {
        return Err(CloudInitError::InlineEmpty);
    }
    Ok(())
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

/// User-data document handed to every node of a forest.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeUserData {
    template: Option<String>,
}

impl NodeUserData {
    /// Wraps an optional, already resolved payload.
    #[must_use]
    pub const fn new(template: Option<String>) -> Self {
        Self { template }
    }

    /// Returns true when no payload is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.template.is_none()
    }

    /// Renders the payload for one node, substituting the node placeholders.
    #[must_use]
    pub fn render(&self, forest_id: &str, node_name: &str, role: NodeRole) -> Option<String> {
        self.template.as_ref().map(|template| {
            template
                .replace(FOREST_ID_PLACEHOLDER, forest_id)
                .replace(NODE_NAME_PLACEHOLDER, node_name)
                .replace(NODE_ROLE_PLACEHOLDER, role.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    fn inline_and_file_are_exclusive() {
        let err = resolve_cloud_init_user_data(Some("#cloud-config"), Some("user-data.yaml"))
            .expect_err("both sources");
        assert_eq!(err, CloudInitError::BothProvided);
    }

    #[rstest]
    #[case(Some("  "), None, CloudInitError::InlineEmpty)]
    #[case(None, Some(" "), CloudInitError::FilePathEmpty)]
    fn blank_sources_are_rejected(
        #[case] inline: Option<&str>,
        #[case] file: Option<&str>,
        #[case] expected: CloudInitError,
    ) {
        let err = resolve_cloud_init_user_data(inline, file).expect_err("blank source");
        assert_eq!(err, expected);
    }

    #[rstest]
    fn file_payload_is_read_verbatim() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = tmp.path().join("user-data.yaml");
        std::fs::write(&path, "#cloud-config\npackages: [jq]\n")
            .unwrap_or_else(|err| panic!("write user-data: {err}"));
        let path = path
            .to_str()
            .unwrap_or_else(|| panic!("temp path should be utf8"));

        let payload = resolve_cloud_init_user_data(None, Some(path))
            .unwrap_or_else(|err| panic!("resolve file: {err}"));
        assert_eq!(payload.as_deref(), Some("#cloud-config\npackages: [jq]\n"));
    }

    #[rstest]
    fn empty_file_is_rejected() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = tmp.path().join("user-data.yaml");
        std::fs::write(&path, "\n\n").unwrap_or_else(|err| panic!("write user-data: {err}"));
        let path = path
            .to_str()
            .unwrap_or_else(|| panic!("temp path should be utf8"));

        let err = resolve_cloud_init_user_data(None, Some(path)).expect_err("empty file");
        assert_eq!(err, CloudInitError::FileEmpty);
    }

    #[rstest]
    #[case(NodeRole::Leader, "role=leader name=forest-7-node-1 forest=forest-7")]
    #[case(NodeRole::Worker, "role=worker name=forest-7-node-1 forest=forest-7")]
    fn render_substitutes_node_placeholders(#[case] role: NodeRole, #[case] expected: &str) {
        let user_data = NodeUserData::new(Some(String::from(
            "role=${FORESTER_NODE_ROLE} name=${FORESTER_NODE_NAME} forest=${FORESTER_FOREST_ID}",
        )));
        let rendered = user_data.render("forest-7", "forest-7-node-1", role);
        assert_eq!(rendered.as_deref(), Some(expected));
    }

    #[rstest]
    fn missing_payload_renders_nothing() {
        let user_data = NodeUserData::default();
        assert!(user_data.is_empty());
        assert_eq!(user_data.render("forest-1", "forest-1-node-1", NodeRole::Leader), None);
    }
}
