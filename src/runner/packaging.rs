use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CohortError, Result};

/// A worker program in transit to another beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppBundle {
    pub id: Uuid,
    /// File name the program is unpacked under.
    pub name: String,
    /// Base64 of the program bytes.
    pub payload: String,
}

/// Turns a program into something that can travel inside a JOB frame and
/// back into a runnable file.
pub trait Packager: Send + Sync + 'static {
    fn pack(&self, app: &Path) -> Result<AppBundle>;
    fn unpack(&self, bundle: &AppBundle) -> Result<PathBuf>;
    /// Remove what `unpack` wrote for the entry point `entry`.
    fn discard(&self, entry: &Path) -> Result<()>;
}

/// Ships a single executable file.
#[derive(Debug, Clone)]
pub struct FilePackager {
    unpack_dir: PathBuf,
}

impl FilePackager {
    pub fn new(unpack_dir: impl Into<PathBuf>) -> Self {
        Self {
            unpack_dir: unpack_dir.into(),
        }
    }
}

impl Packager for FilePackager {
    fn pack(&self, app: &Path) -> Result<AppBundle> {
        let name = app
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                CohortError::Packaging(format!("{} has no file name", app.display()))
            })?
            .to_string();
        let bytes = std::fs::read(app).map_err(|e| {
            CohortError::Packaging(format!("cannot read {}: {}", app.display(), e))
        })?;
        Ok(AppBundle {
            id: Uuid::new_v4(),
            name,
            payload: STANDARD.encode(bytes),
        })
    }

    fn unpack(&self, bundle: &AppBundle) -> Result<PathBuf> {
        if bundle.name.is_empty()
            || Path::new(&bundle.name).file_name().and_then(|n| n.to_str())
                != Some(bundle.name.as_str())
        {
            return Err(CohortError::Packaging(format!(
                "malformed bundle name {:?}",
                bundle.name
            )));
        }
        let bytes = STANDARD
            .decode(&bundle.payload)
            .map_err(|e| CohortError::Packaging(format!("malformed bundle: {}", e)))?;

        let dir = self.unpack_dir.join(bundle.id.to_string());
        std::fs::create_dir_all(&dir)?;
        let entry = dir.join(&bundle.name);
        std::fs::write(&entry, bytes)?;
        std::fs::set_permissions(&entry, std::fs::Permissions::from_mode(0o755))?;
        tracing::debug!(bundle = %bundle.id, entry = %entry.display(), "Bundle unpacked");
        Ok(entry)
    }

    fn discard(&self, entry: &Path) -> Result<()> {
        let dir = entry
            .parent()
            .filter(|dir| dir.parent() == Some(self.unpack_dir.as_path()))
            .ok_or_else(|| {
                CohortError::Packaging(format!("{} was not unpacked here", entry.display()))
            })?;
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), "Bundle discarded");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unpacked_program_matches_and_is_executable() {
        let src = TempDir::new().unwrap();
        let app = src.path().join("hello.sh");
        std::fs::write(&app, b"#!/bin/sh\necho hi\n").unwrap();

        let dst = TempDir::new().unwrap();
        let packager = FilePackager::new(dst.path());
        let bundle = packager.pack(&app).unwrap();
        assert_eq!(bundle.name, "hello.sh");

        let entry = packager.unpack(&bundle).unwrap();
        assert!(entry.starts_with(dst.path()));
        assert_eq!(std::fs::read(&entry).unwrap(), b"#!/bin/sh\necho hi\n");
        let mode = std::fs::metadata(&entry).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn discard_removes_the_unpacked_bundle() {
        let src = TempDir::new().unwrap();
        let app = src.path().join("hello.sh");
        std::fs::write(&app, b"#!/bin/sh\n").unwrap();

        let dst = TempDir::new().unwrap();
        let packager = FilePackager::new(dst.path());
        let entry = packager.unpack(&packager.pack(&app).unwrap()).unwrap();

        packager.discard(&entry).unwrap();
        assert!(!entry.exists());
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
        // Already gone is fine.
        packager.discard(&entry).unwrap();
    }

    #[test]
    fn discard_refuses_paths_outside_the_unpack_dir() {
        let dst = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let victim = outside.path().join("keep").join("app");
        std::fs::create_dir_all(victim.parent().unwrap()).unwrap();
        std::fs::write(&victim, b"x").unwrap();

        let packager = FilePackager::new(dst.path());
        assert!(matches!(
            packager.discard(&victim),
            Err(CohortError::Packaging(_))
        ));
        assert!(victim.exists());
        assert!(packager.discard(&dst.path().join("app")).is_err());
    }

    #[test]
    fn missing_program_is_a_packaging_error() {
        let packager = FilePackager::new("/tmp");
        let err = packager
            .pack(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, CohortError::Packaging(_)));
    }

    #[test]
    fn bundle_names_cannot_escape_the_unpack_dir() {
        let dst = TempDir::new().unwrap();
        let packager = FilePackager::new(dst.path());
        let bundle = AppBundle {
            id: Uuid::new_v4(),
            name: "../evil".to_string(),
            payload: STANDARD.encode(b"x"),
        };
        assert!(matches!(
            packager.unpack(&bundle),
            Err(CohortError::Packaging(_))
        ));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let dst = TempDir::new().unwrap();
        let packager = FilePackager::new(dst.path());
        let bundle = AppBundle {
            id: Uuid::new_v4(),
            name: "app".to_string(),
            payload: "%%%".to_string(),
        };
        assert!(packager.unpack(&bundle).is_err());
    }
}
