use crate::cmd::{Result, RpibootError};

use std::collections::HashMap;
use std::io::Read;
use tracing::debug;

/// A read-only source of named files
pub trait Mount {
    fn get_file(&self, path: &str) -> Option<&[u8]>;
    fn get_size(&self, path: &str) -> Option<u64>;
}

/// Files held in memory by name
#[derive(Debug, Default, Clone)]
pub struct MapMount {
    files: HashMap<String, Vec<u8>>,
}
impl MapMount {
    pub fn new() -> Self {
        MapMount::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, contents: Vec<u8>) {
        self.files.insert(name.into(), contents);
    }
}
impl FromIterator<(String, Vec<u8>)> for MapMount {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        MapMount {
            files: iter.into_iter().collect(),
        }
    }
}
impl Mount for MapMount {
    fn get_file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    fn get_size(&self, path: &str) -> Option<u64> {
        self.files.get(path).map(|f| f.len() as u64)
    }
}

/// The regular files of a tar archive, unpacked into memory
#[derive(Debug, Default, Clone)]
pub struct TarMount {
    files: HashMap<String, Vec<u8>>,
}
impl TarMount {
    pub fn from_bytes(archive: &[u8]) -> Result<Self> {
        let mut archive = tar::Archive::new(archive);
        let mut files = HashMap::new();

        for entry in archive.entries().map_err(RpibootError::Archive)? {
            let mut entry = entry.map_err(RpibootError::Archive)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry.path().map_err(RpibootError::Archive)?;
            let name = path.to_string_lossy();
            let name = name.strip_prefix("./").unwrap_or(&name).to_string();

            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut contents)
                .map_err(RpibootError::Archive)?;
            files.insert(name, contents);
        }

        debug!("unpacked {} files from boot file archive", files.len());
        Ok(TarMount { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
impl Mount for TarMount {
    fn get_file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    fn get_size(&self, path: &str) -> Option<u64> {
        self.files.get(path).map(|f| f.len() as u64)
    }
}

/// An ordered stack of mounts, optionally scoped by a path prefix
///
/// Lookups first try `<prefix>/<path>` against every mount in the order they
/// were added, then the bare `<path>` against every mount in the same order.
/// The first mount that has the file answers. This lets chip specific files
/// (`2712/...`) shadow generic ones without the mounts knowing about it.
#[derive(Default)]
pub struct VirtualFs {
    prefix: Option<String>,
    mounts: Vec<Box<dyn Mount>>,
}
impl VirtualFs {
    pub fn new(prefix: Option<String>) -> Self {
        VirtualFs {
            prefix,
            mounts: vec![],
        }
    }

    pub fn add_mount<M: Mount + 'static>(&mut self, mount: M) {
        self.mounts.push(Box::new(mount));
    }

    fn lookup<'a, T, F>(&'a self, path: &str, f: F) -> Option<T>
    where
        F: Fn(&'a dyn Mount, &str) -> Option<T>,
    {
        if let Some(prefix) = &self.prefix {
            let prefixed = format!("{}/{}", prefix, path);
            if let Some(found) = self.mounts.iter().find_map(|m| f(&**m, &prefixed)) {
                return Some(found);
            }
        }
        self.mounts.iter().find_map(|m| f(&**m, path))
    }

    pub fn get_file(&self, path: &str) -> Option<&[u8]> {
        self.lookup(path, |m, p| m.get_file(p))
    }

    pub fn get_size(&self, path: &str) -> Option<u64> {
        self.lookup(path, |m, p| m.get_size(p))
    }
}
impl std::fmt::Debug for VirtualFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFs")
            .field("prefix", &self.prefix)
            .field("mounts", &self.mounts.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn map_of(files: &[(&str, &[u8])]) -> MapMount {
        files
            .iter()
            .map(|(n, c)| (n.to_string(), c.to_vec()))
            .collect()
    }

    #[test]
    fn prefixed_lookup_wins() {
        let mut fs = VirtualFs::new(Some("2712".into()));
        fs.add_mount(map_of(&[("2712/boot.img", b"A")]));
        assert_eq!(fs.get_file("boot.img"), Some(&b"A"[..]));
        assert_eq!(fs.get_size("boot.img"), Some(1));
    }

    #[test]
    fn earlier_mount_shadows_later_in_same_tier() {
        let mut fs = VirtualFs::new(Some("2712".into()));
        fs.add_mount(map_of(&[("2712/config.txt", b"override")]));
        fs.add_mount(map_of(&[("2712/config.txt", b"generic config")]));
        assert_eq!(fs.get_file("config.txt"), Some(&b"override"[..]));
        assert_eq!(fs.get_size("config.txt"), Some(8));
    }

    #[test]
    fn prefix_tier_beats_earlier_mount_without_prefix() {
        let mut fs = VirtualFs::new(Some("2711".into()));
        fs.add_mount(map_of(&[("start4.elf", b"generic")]));
        fs.add_mount(map_of(&[("2711/start4.elf", b"chip")]));
        assert_eq!(fs.get_file("start4.elf"), Some(&b"chip"[..]));
    }

    #[test]
    fn falls_back_to_bare_path() {
        let mut fs = VirtualFs::new(Some("2712".into()));
        fs.add_mount(map_of(&[("other", b"x")]));
        fs.add_mount(map_of(&[("bootcode5.bin", b"boot")]));
        assert_eq!(fs.get_file("bootcode5.bin"), Some(&b"boot"[..]));
        assert_eq!(fs.get_file("missing"), None);
        assert_eq!(fs.get_size("missing"), None);
    }

    #[test]
    fn empty_file_is_still_found() {
        let mut fs = VirtualFs::new(None);
        fs.add_mount(map_of(&[("empty", b"")]));
        fs.add_mount(map_of(&[("empty", b"not empty")]));
        assert_eq!(fs.get_size("empty"), Some(0));
    }

    #[test]
    fn tar_mount_lists_regular_files() {
        let archive = tar_of(&[("./2712/start4.elf", b"elf"), ("bootcode4.bin", b"code4")]);
        let mount = TarMount::from_bytes(&archive).unwrap();
        assert_eq!(mount.len(), 2);
        assert_eq!(mount.get_file("2712/start4.elf"), Some(&b"elf"[..]));
        assert_eq!(mount.get_size("bootcode4.bin"), Some(5));
        assert_eq!(mount.get_file("./2712/start4.elf"), None);
    }

    #[test]
    fn garbage_archive_is_an_error() {
        assert!(matches!(
            TarMount::from_bytes(&[0xffu8; 700]),
            Err(RpibootError::Archive(_))
        ));
    }
}
