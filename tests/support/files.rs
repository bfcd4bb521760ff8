use std::{
    collections::BTreeMap,
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

pub fn write_file(root: &Path, relative: &str, contents: &str) -> PathBuf {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().expect("parent dir")).expect("create parent");
    std::fs::write(&path, contents).expect("write file");
    path
}

/// Entry name to contents for an in-memory zip.
pub fn zip_entries(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("open zip");
    let mut entries = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).expect("zip entry");
        let mut data = Vec::new();
        entry.read_to_end(&mut data).expect("read zip entry");
        entries.insert(entry.name().to_string(), data);
    }
    entries
}

/// Sorted file names directly inside `dir`; empty when it does not exist.
pub fn file_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn zip_names(dir: &Path, prefix: &str) -> Vec<String> {
    file_names(dir)
        .into_iter()
        .filter(|name| name.starts_with(prefix) && name.ends_with(".zip"))
        .collect()
}
