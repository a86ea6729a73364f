//! Identity directory.
//!
//! The relay does not own user or specialist records; the surrounding
//! application does. The directory resolves an id to display fields for
//! call notifications and chat authors. Two sources exist, one per call
//! kind, behind a single trait so the call path never branches on kind.
//!
//! The relay holds the directory as `Arc<dyn Directory>`, so an
//! application-backed source can replace the in-memory one. The in-memory
//! implementation can be seeded from a JSON file; both accept profile
//! updates pushed through the REST adapter.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{Author, CallKind};

/// Display fields for a user or specialist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
    /// Free-form location, e.g. "Nashik, Maharashtra".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Specialists only, e.g. "Cows, Buffalo".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
}

impl Profile {
    pub fn author(&self) -> Author {
        Author {
            id: self.id.clone(),
            name: self.name.clone(),
            profile_image: self.profile_image.clone(),
        }
    }
}

/// Identity lookup capability.
pub trait Directory: Send + Sync {
    fn resolve_user(&self, user_id: &str) -> Option<Profile>;

    fn resolve_specialist(&self, specialist_id: &str) -> Option<Profile>;

    /// Insert or replace a profile in the source for `kind`.
    fn upsert(&self, kind: CallKind, profile: Profile) -> Result<()>;

    /// Resolve the callee side of a call of the given kind.
    fn resolve(&self, kind: CallKind, id: &str) -> Option<Profile> {
        match kind {
            CallKind::Generic => self.resolve_user(id),
            CallKind::Specialist => self.resolve_specialist(id),
        }
    }

    /// Author fields for a chat message. Unknown authors fall back to their id.
    fn author(&self, user_id: &str) -> Author {
        self.resolve_user(user_id)
            .map(|p| p.author())
            .unwrap_or_else(|| Author {
                id: user_id.to_string(),
                name: user_id.to_string(),
                profile_image: None,
            })
    }
}

/// On-disk seed format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    users: Vec<Profile>,
    #[serde(default)]
    specialists: Vec<Profile>,
}

#[derive(Clone, Default)]
pub struct MemoryDirectory {
    users: Arc<DashMap<String, Profile>>,
    specialists: Arc<DashMap<String, Profile>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load profiles from a JSON file. Problems are logged and the
    /// directory starts empty; returns the number of profiles loaded.
    pub fn load_from_file(&self, path: &Path) -> usize {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "Failed to read directory file, starting empty"
                );
                return 0;
            }
        };

        let file: DirectoryFile = match serde_json::from_str(&contents) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "Failed to parse directory file, starting empty"
                );
                return 0;
            }
        };

        let count = file.users.len() + file.specialists.len();
        for profile in file.users {
            self.upsert_user(profile);
        }
        for profile in file.specialists {
            self.upsert_specialist(profile);
        }

        tracing::info!(
            count = count,
            path = %path.display(),
            "Directory profiles loaded"
        );
        count
    }

    pub fn upsert_user(&self, profile: Profile) {
        self.users.insert(profile.id.clone(), profile);
    }

    pub fn upsert_specialist(&self, profile: Profile) {
        self.specialists.insert(profile.id.clone(), profile);
    }
}

impl Directory for MemoryDirectory {
    fn resolve_user(&self, user_id: &str) -> Option<Profile> {
        self.users.get(user_id).map(|p| p.clone())
    }

    fn resolve_specialist(&self, specialist_id: &str) -> Option<Profile> {
        self.specialists.get(specialist_id).map(|p| p.clone())
    }

    fn upsert(&self, kind: CallKind, profile: Profile) -> Result<()> {
        match kind {
            CallKind::Generic => self.upsert_user(profile),
            CallKind::Specialist => self.upsert_specialist(profile),
        }
        Ok(())
    }
}
