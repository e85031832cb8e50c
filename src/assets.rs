use crate::cmd::{Result, RpibootError};

use std::path::PathBuf;
use tracing::debug;

/// Resolves a gadget asset location to its bytes
pub trait AssetSource {
    fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

/// Assets laid out under a local directory
#[derive(Debug, Clone)]
pub struct DirAssets {
    root: PathBuf,
}
impl DirAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirAssets { root: root.into() }
    }
}
impl AssetSource for DirAssets {
    fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.root.join(location);
        debug!("loading asset {}", path.display());
        std::fs::read(&path).map_err(|source| RpibootError::AssetUnavailable {
            location: location.to_string(),
            source,
        })
    }
}

impl<A: AssetSource + ?Sized> AssetSource for &A {
    fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        (**self).fetch(location)
    }
}
