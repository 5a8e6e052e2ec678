//! Shortcuts for arranging files in tests, panicking on any IO error.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

pub fn write(path: &Path, content: impl AsRef<[u8]>) {
    std::fs::write(path, content).unwrap_or_else(|err| panic!("write {path:?} failed, {err}"));
}

pub fn append(path: &Path, content: impl AsRef<[u8]>) {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap_or_else(|err| panic!("open {path:?} failed, {err}"));

    file.write_all(content.as_ref())
        .and_then(|_| file.sync_all())
        .unwrap_or_else(|err| panic!("append {path:?} failed, {err}"));
}

pub fn set_modified(path: &Path, modified: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(modified))
        .unwrap_or_else(|err| panic!("set mtime of {path:?} failed, {err}"));
}

/// Move the modification time forward by `secs`, content untouched.
pub fn shift_modified(path: &Path, secs: u64) {
    let modified = std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .unwrap_or_else(|err| panic!("stat {path:?} failed, {err}"));

    set_modified(path, modified + Duration::from_secs(secs));
}

/// Make the file look like nothing has written to it for `secs`.
pub fn age(path: &Path, secs: u64) {
    set_modified(path, SystemTime::now() - Duration::from_secs(secs));
}
