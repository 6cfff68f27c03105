use std::path::{Path, PathBuf};

/// Maps event paths between the canonical data tree and its writable overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathMapper {
    base: PathBuf,
    writable: Option<PathBuf>,
}

impl PathMapper {
    pub fn new(base: impl Into<PathBuf>, writable: Option<PathBuf>) -> Self {
        Self {
            base: base.into(),
            writable,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path relative to the canonical base, or to the writable base, or
    /// `path` unchanged when it lies under neither.
    pub fn strip_base(&self, path: &Path) -> PathBuf {
        if let Ok(rel) = path.strip_prefix(&self.base) {
            return rel.to_path_buf();
        }
        if let Some(writable) = &self.writable
            && let Ok(rel) = path.strip_prefix(writable)
        {
            return rel.to_path_buf();
        }
        path.to_path_buf()
    }

    /// Re-express a path inside the writable overlay as its canonical
    /// counterpart, provided that counterpart exists.
    pub fn mask_writable(&self, path: &Path) -> PathBuf {
        let Some(writable) = &self.writable else {
            return path.to_path_buf();
        };
        match path.strip_prefix(writable) {
            Ok(rel) => {
                let candidate = self.base.join(rel);
                if candidate.exists() {
                    candidate
                } else {
                    path.to_path_buf()
                }
            }
            Err(_) => path.to_path_buf(),
        }
    }
}

/// Lossy UTF-8 rendering used for pattern matching and log output.
pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn strip_base_prefers_canonical_then_writable() {
        let mapper = PathMapper::new("/srv/files", Some(PathBuf::from("/srv/writable")));
        assert_eq!(
            mapper.strip_base(Path::new("/srv/files/alpha/a.txt")),
            PathBuf::from("alpha/a.txt")
        );
        assert_eq!(
            mapper.strip_base(Path::new("/srv/writable/alpha/a.txt")),
            PathBuf::from("alpha/a.txt")
        );
        assert_eq!(
            mapper.strip_base(Path::new("/elsewhere/a.txt")),
            PathBuf::from("/elsewhere/a.txt")
        );
    }

    #[test]
    fn strip_base_respects_component_boundaries() {
        let mapper = PathMapper::new("/srv/files", None);
        assert_eq!(
            mapper.strip_base(Path::new("/srv/filesystem/a")),
            PathBuf::from("/srv/filesystem/a")
        );
    }

    #[test]
    fn mask_writable_only_when_canonical_exists() {
        let tmp = tempdir().unwrap();
        let base = tmp.path().join("files");
        let writable = tmp.path().join("writable");
        std::fs::create_dir_all(base.join("alpha")).unwrap();
        std::fs::create_dir_all(writable.join("alpha")).unwrap();
        std::fs::write(base.join("alpha/present.txt"), b"x").unwrap();

        let mapper = PathMapper::new(base.clone(), Some(writable.clone()));
        assert_eq!(
            mapper.mask_writable(&writable.join("alpha/present.txt")),
            base.join("alpha/present.txt")
        );
        assert_eq!(
            mapper.mask_writable(&writable.join("alpha/missing.txt")),
            writable.join("alpha/missing.txt")
        );
        assert_eq!(
            mapper.mask_writable(&base.join("alpha/present.txt")),
            base.join("alpha/present.txt")
        );
    }
}
