//! File-backed template store: one file per print under
//! `<root>/<user>/<driver>/<device-id>/<hex-finger>`.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::finger::Finger;
use crate::print::Print;
use crate::storage::{PrintStore, StoreError};

const DEFAULT_ROOT: &str = "/var/lib/xfprintd";
const DIR_MODE: u32 = 0o700;

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Root from `STATE_DIRECTORY` when set (systemd passes a colon-joined
    /// list; the first non-empty entry wins), else the fixed default.
    pub fn from_env() -> FileStore {
        let root = std::env::var("STATE_DIRECTORY")
            .ok()
            .and_then(|dirs| {
                dirs.split(':')
                    .find(|entry| !entry.is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        FileStore::with_root(root)
    }

    pub fn with_root(root: PathBuf) -> FileStore {
        FileStore { root }
    }

    fn user_root(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    fn store_dir(&self, driver: &str, device_id: &str, username: &str) -> PathBuf {
        self.user_root(username).join(driver).join(device_id)
    }

    fn print_path(&self, driver: &str, device_id: &str, finger: Finger, username: &str) -> PathBuf {
        self.store_dir(driver, device_id, username)
            .join(finger.hex_code().to_string())
    }
}

impl PrintStore for FileStore {
    fn save(&self, print: &Print) -> Result<(), StoreError> {
        let bytes = print
            .serialize()
            .map_err(|err| StoreError::Corrupt(format!("serializing print: {err}")))?;

        let path = self.print_path(&print.driver, &print.device_id, print.finger, &print.username);
        let dir = path.parent().expect("print path always has a parent");
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(dir)
            .map_err(StoreError::Io)?;

        fs::write(&path, bytes).map_err(StoreError::Io)?;
        debug!("print saved to {}", path.display());
        Ok(())
    }

    fn load(
        &self,
        driver: &str,
        device_id: &str,
        finger: Finger,
        username: &str,
    ) -> Result<Print, StoreError> {
        let path = self.print_path(driver, device_id, finger, username);
        let bytes = fs::read(&path)?;
        let print = Print::deserialize(&bytes)
            .map_err(|err| StoreError::Corrupt(format!("{}: {err}", path.display())))?;

        if print.finger != finger {
            return Err(StoreError::Corrupt(format!(
                "{}: finger {} does not match path",
                path.display(),
                print.finger
            )));
        }
        if print.username != username {
            return Err(StoreError::Corrupt(format!(
                "{}: user '{}' does not match path",
                path.display(),
                print.username
            )));
        }
        if !print.compatible_with(driver, device_id) {
            return Err(StoreError::Corrupt(format!(
                "{}: print belongs to {}/{}",
                path.display(),
                print.driver,
                print.device_id
            )));
        }

        Ok(print)
    }

    fn delete(
        &self,
        driver: &str,
        device_id: &str,
        finger: Finger,
        username: &str,
    ) -> Result<(), StoreError> {
        let path = self.print_path(driver, device_id, finger, username);
        if !path.exists() {
            return Ok(());
        }

        fs::remove_file(&path).map_err(StoreError::Io)?;
        debug!("unlinked {}", path.display());

        // Prune now-empty ancestors, stopping at the first non-empty
        // directory or once we leave the user's subtree.
        if self.discover_prints(driver, device_id, username).is_empty() {
            let user_root = self.user_root(username);
            let mut dir = path.as_path();
            while let Some(parent) = dir.parent() {
                if !parent.starts_with(&user_root) {
                    break;
                }
                if fs::remove_dir(parent).is_err() {
                    break;
                }
                dir = parent;
            }
        }

        Ok(())
    }

    fn discover_prints(&self, driver: &str, device_id: &str, username: &str) -> Vec<Finger> {
        let dir = self.store_dir(driver, device_id, username);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("opendir(\"{}\") failed: {}", dir.display(), err);
                return Vec::new();
            }
        };

        let mut fingers = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(code), None) => match Finger::from_hex_code(code) {
                    Some(finger) => fingers.push(finger),
                    None => debug!("skipping print file '{name}'"),
                },
                _ => debug!("skipping print file '{name}'"),
            }
        }
        fingers
    }

    fn discover_users(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                (!name.is_empty()).then_some(name)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "xfprintd-store-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn sample(user: &str, finger: Finger) -> Print {
        Print {
            driver: "virtual".to_string(),
            device_id: "virt0".to_string(),
            username: user.to_string(),
            finger,
            enroll_date: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            device_stored: false,
            data: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn save_load_round_trip() {
        let root = scratch("round-trip");
        let store = FileStore::with_root(root.clone());
        let print = sample("alice", Finger::LeftThumb);

        store.save(&print).unwrap();
        let loaded = store.load("virtual", "virt0", Finger::LeftThumb, "alice").unwrap();
        assert_eq!(loaded, print);

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn load_missing_is_not_found() {
        let store = FileStore::with_root(scratch("missing"));
        match store.load("virtual", "virt0", Finger::LeftThumb, "alice") {
            Err(StoreError::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_moved_file() {
        let root = scratch("moved");
        let store = FileStore::with_root(root.clone());
        store.save(&sample("alice", Finger::LeftThumb)).unwrap();

        // Pretend someone renamed the file to a different slot.
        let dir = root.join("alice/virtual/virt0");
        fs::rename(dir.join("1"), dir.join("2")).unwrap();

        match store.load("virtual", "virt0", Finger::LeftIndex, "alice") {
            Err(StoreError::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn delete_prunes_empty_directories() {
        let root = scratch("prune");
        fs::DirBuilder::new().recursive(true).create(&root).unwrap();
        let store = FileStore::with_root(root.clone());
        store.save(&sample("alice", Finger::LeftThumb)).unwrap();

        store.delete("virtual", "virt0", Finger::LeftThumb, "alice").unwrap();
        assert!(!root.join("alice").exists());
        assert!(root.exists());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn delete_keeps_siblings() {
        let root = scratch("siblings");
        let store = FileStore::with_root(root.clone());
        store.save(&sample("alice", Finger::LeftThumb)).unwrap();
        store.save(&sample("alice", Finger::RightIndex)).unwrap();

        store.delete("virtual", "virt0", Finger::LeftThumb, "alice").unwrap();
        assert_eq!(
            store.discover_prints("virtual", "virt0", "alice"),
            vec![Finger::RightIndex]
        );

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn delete_missing_is_ok() {
        let store = FileStore::with_root(scratch("delete-missing"));
        store.delete("virtual", "virt0", Finger::LeftThumb, "alice").unwrap();
    }

    #[test]
    fn discovers_users_and_prints() {
        let root = scratch("discover");
        let store = FileStore::with_root(root.clone());
        store.save(&sample("alice", Finger::LeftThumb)).unwrap();
        store.save(&sample("bob", Finger::RightLittle)).unwrap();

        let mut users = store.discover_users();
        users.sort();
        assert_eq!(users, vec!["alice", "bob"]);

        assert_eq!(
            store.discover_prints("virtual", "virt0", "bob"),
            vec![Finger::RightLittle]
        );
        assert!(store.discover_prints("virtual", "virt0", "carol").is_empty());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn ignores_unrelated_print_files() {
        let root = scratch("junk");
        let store = FileStore::with_root(root.clone());
        store.save(&sample("alice", Finger::LeftThumb)).unwrap();

        let dir = root.join("alice/virtual/virt0");
        fs::write(dir.join("0"), b"sentinel slot").unwrap();
        fs::write(dir.join("readme"), b"not a print").unwrap();

        assert_eq!(
            store.discover_prints("virtual", "virt0", "alice"),
            vec![Finger::LeftThumb]
        );

        fs::remove_dir_all(root).unwrap();
    }
}
