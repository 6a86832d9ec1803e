use crate::error::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Readers in other units never observe a half-written file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Write a file only if it does not already exist. Returns true if written.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    atomic_write(path, data)?;
    Ok(true)
}

/// Pick a destination under `dir` for `file_name` that does not exist yet.
///
/// Collisions get a numeric suffix before the extension: `a.md`, `a_1.md`, `a_2.md`.
pub fn free_destination(dir: &Path, file_name: &str) -> PathBuf {
    let first = dir.join(file_name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (file_name, None),
    };
    let mut n = 1u32;
    loop {
        let candidate = match ext {
            Some(e) => dir.join(format!("{stem}_{n}.{e}")),
            None => dir.join(format!("{stem}_{n}")),
        };
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Rename `from` into `to_dir`, keeping the file name when free.
///
/// Both directories live under the same vault root, so `rename` is atomic:
/// the file is visible in exactly one directory at every instant.
pub fn move_into(from: &Path, to_dir: &Path) -> Result<PathBuf> {
    ensure_dir(to_dir)?;
    let name = from
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dest = free_destination(to_dir, &name);
    std::fs::rename(from, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("item.md");
        atomic_write(&path, b"type: email").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "type: email");
    }

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/item.md");
        atomic_write(&path, b"data").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        atomic_write(&dir.path().join("x.json"), b"[]").unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn write_if_missing_skips_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("existing.txt");
        std::fs::write(&path, b"original").unwrap();
        let written = write_if_missing(&path, b"new").unwrap();
        assert!(!written);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }

    #[test]
    fn free_destination_suffixes_collisions() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.md"), "").unwrap();
        std::fs::write(dir.path().join("a_1.md"), "").unwrap();
        assert_eq!(free_destination(dir.path(), "a.md"), dir.path().join("a_2.md"));
        assert_eq!(free_destination(dir.path(), "b.md"), dir.path().join("b.md"));
    }

    #[test]
    fn move_into_relocates_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("Approved/x.md");
        atomic_write(&src, b"body").unwrap();
        let dest = move_into(&src, &dir.path().join("Done")).unwrap();
        assert!(!src.exists());
        assert_eq!(dest, dir.path().join("Done/x.md"));
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "body");
    }
}
