use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};

use crate::ignored::IgnoreMasks;

/// Collects regular files under `root`, skipping entries whose name matches
/// `masks` (and everything below an ignored directory). `max_depth` of
/// `Some(1)` lists only the direct children. The result is sorted.
pub fn scan_files(root: &Path, masks: &IgnoreMasks, max_depth: Option<usize>) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        anyhow::bail!("Path does not exist: {}", root.display());
    }

    let (tx, rx) = mpsc::channel();
    let masks = Arc::new(masks.clone());

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .max_depth(max_depth)
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !masks.matches(&entry.file_name().to_string_lossy(), is_dir)
        })
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            match entry {
                Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => {
                    let _ = tx.send(entry.into_path());
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(error = %err, "Skipping unreadable entry"),
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut files: Vec<PathBuf> = rx.iter().collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn layout() -> Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("src/nested"))?;
        fs::create_dir_all(root.join(".git/objects"))?;
        fs::create_dir_all(root.join("__pycache__"))?;
        fs::write(root.join("src/main.rs"), "fn main() {}")?;
        fs::write(root.join("src/nested/notes"), "text")?;
        fs::write(root.join("src/util.pyc"), [0u8, 1])?;
        fs::write(root.join(".git/objects/abc"), "blob")?;
        fs::write(root.join("__pycache__/x.py"), "")?;
        fs::write(root.join("README.md"), "# hi")?;
        Ok(dir)
    }

    #[test]
    fn scan_honours_ignore_masks() -> Result<()> {
        let dir = layout()?;
        let masks = IgnoreMasks::parse(crate::ignored::DEFAULT_IGNORE_MASKS);
        let files = scan_files(dir.path(), &masks, None)?;
        let rel: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rel, vec!["README.md", "src/main.rs", "src/nested/notes"]);
        Ok(())
    }

    #[test]
    fn scan_depth_limit() -> Result<()> {
        let dir = layout()?;
        let files = scan_files(dir.path(), &IgnoreMasks::default(), Some(1))?;
        assert_eq!(files, vec![dir.path().join("README.md")]);
        Ok(())
    }

    #[test]
    fn scan_missing_root_fails() {
        let masks = IgnoreMasks::default();
        assert!(scan_files(Path::new("/definitely/not/here"), &masks, None).is_err());
    }
}
