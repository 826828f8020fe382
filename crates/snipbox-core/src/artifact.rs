//! Published markup documents
//!
//! Artifacts live in one flat directory as `<user>_<uuid>.html`. Ownership
//! is carried by the name alone, so the store never needs an index, and
//! since every name is fresh, concurrent publishes never coordinate.

use crate::error::FetchError;
use crate::result::ArtifactRef;
use crate::{Result, UserId};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const EXTENSION: &str = ".html";

/// URL prefix the surrounding layer serves artifacts under
pub const VIEW_PREFIX: &str = "/view/";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open the store, creating its directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `content` under a new name owned by `user`
    pub fn publish(&self, user: &UserId, content: &str) -> Result<ArtifactRef> {
        let id = format!("{user}_{}{EXTENSION}", Uuid::new_v4());
        let path = self.dir.join(&id);

        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        tracing::debug!(user = %user, artifact = %id, bytes = content.len(), "artifact published");
        Ok(ArtifactRef {
            url: format!("{VIEW_PREFIX}{id}"),
            id,
            path,
        })
    }

    /// Read an artifact on behalf of `user`.
    ///
    /// Names that are not exactly `<user>_<uuid>.html` are refused before
    /// the filesystem is consulted, so the answer for someone else's
    /// artifact is `Forbidden` whether or not it exists.
    pub fn fetch(&self, user: &UserId, id: &str) -> std::result::Result<Vec<u8>, FetchError> {
        if !is_owned_by(user, id) {
            tracing::warn!(user = %user, artifact = %id, "artifact access denied");
            return Err(FetchError::Forbidden);
        }

        match fs::read(self.dir.join(id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FetchError::NotFound),
            Err(e) => Err(FetchError::Storage(e)),
        }
    }
}

/// Ownership and shape check for an artifact name
fn is_owned_by(user: &UserId, id: &str) -> bool {
    if id.contains(['/', '\\', '\0']) || id.contains("..") {
        return false;
    }

    let Some(rest) = id
        .strip_prefix(user.as_str())
        .and_then(|rest| rest.strip_prefix('_'))
    else {
        return false;
    };

    // The remainder must be exactly one uuid, so "bob" cannot claim
    // "bob_x_<uuid>.html" belonging to "bob_x".
    rest.strip_suffix(EXTENSION)
        .is_some_and(|token| token.len() == 36 && Uuid::parse_str(token).is_ok())
}
