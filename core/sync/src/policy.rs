//! Source-folder selection for the most-recent policy.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

/// Pick the folder with the newest modification time.
///
/// Equal times keep the earlier folder in input order. Folders whose
/// modification time cannot be read are skipped.
pub fn most_recent_folder(folders: &[PathBuf]) -> Option<&Path> {
    let mut best: Option<(&Path, SystemTime)> = None;

    for folder in folders {
        let mtime = match fs::metadata(folder).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) => {
                warn!(
                    "Error getting modification time for {}: {}",
                    folder.display(),
                    e
                );
                continue;
            }
        };

        match best {
            Some((_, newest)) if mtime <= newest => {}
            _ => best = Some((folder.as_path(), mtime)),
        }
    }

    best.map(|(folder, _)| folder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, time: SystemTime) {
        File::open(path).unwrap().set_modified(time).unwrap();
    }

    #[test]
    fn test_picks_newest() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("old");
        let new = temp.path().join("new");
        fs::create_dir(&old).unwrap();
        fs::create_dir(&new).unwrap();

        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&old, base);
        set_mtime(&new, base + Duration::from_secs(60));

        let folders = vec![old, new.clone()];
        assert_eq!(most_recent_folder(&folders), Some(new.as_path()));
    }

    #[test]
    fn test_tie_keeps_input_order() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        fs::create_dir(&first).unwrap();
        fs::create_dir(&second).unwrap();

        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&first, time);
        set_mtime(&second, time);

        let folders = vec![first.clone(), second];
        assert_eq!(most_recent_folder(&folders), Some(first.as_path()));
    }

    #[test]
    fn test_unreadable_folders_are_skipped() {
        let temp = TempDir::new().unwrap();
        let real = temp.path().join("real");
        fs::create_dir(&real).unwrap();

        let folders = vec![temp.path().join("missing"), real.clone()];
        assert_eq!(most_recent_folder(&folders), Some(real.as_path()));

        let none = vec![temp.path().join("gone")];
        assert_eq!(most_recent_folder(&none), None);
        assert_eq!(most_recent_folder(&[]), None);
    }
}
