use crate::groups::ExtraMount;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Mount security policy. Lives outside the project root (user config dir)
/// and is never itself mounted into any sandbox.
#[derive(Debug, Default, Deserialize)]
pub struct MountAllowlist {
    #[serde(default, rename = "allowedPaths")]
    pub allowed_paths: Vec<PathBuf>,
}

impl MountAllowlist {
    /// Missing or unreadable allowlist means nothing extra is allowed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(list) => list,
                Err(e) => {
                    warn!("mount allowlist {} unparseable: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                debug!("no mount allowlist at {}", path.display());
                Self::default()
            }
        }
    }

    fn permits(&self, host_path: &Path) -> bool {
        self.allowed_paths
            .iter()
            .any(|allowed| host_path.starts_with(allowed))
    }

    /// Keep only mounts whose host path falls under an allowlisted prefix.
    /// Denied mounts are omitted, not fatal; the container starts without
    /// them and the denial is logged.
    pub fn filter<'a>(&self, group_folder: &str, mounts: &'a [ExtraMount]) -> Vec<&'a ExtraMount> {
        mounts
            .iter()
            .filter(|m| {
                let allowed = self.permits(Path::new(&m.host_path));
                if !allowed {
                    warn!(
                        "denied extra mount {} for group '{}': not in allowlist",
                        m.host_path, group_folder
                    );
                }
                allowed
            })
            .collect()
    }
}
