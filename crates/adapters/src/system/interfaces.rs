use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use domain::chain::error::ChainError;
use domain::common::error::DomainError;
use ports::secondary::interface_port::InterfaceResolverPort;

/// Resolves interface names through `/sys/class/net/<name>/ifindex`.
pub struct SysfsInterfaceResolver {
    root: PathBuf,
}

impl SysfsInterfaceResolver {
    pub fn new() -> Self {
        Self::with_root(Path::new("/sys/class/net"))
    }

    pub fn with_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl Default for SysfsInterfaceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceResolverPort for SysfsInterfaceResolver {
    fn index_of(&self, name: &str) -> Result<u32, DomainError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(ChainError::UnknownInterface {
                name: name.to_string(),
            }
            .into());
        }
        let path = self.root.join(name).join("ifindex");
        let text = std::fs::read_to_string(&path).map_err(|_| ChainError::UnknownInterface {
            name: name.to_string(),
        })?;
        text.trim().parse::<u32>().map_err(|e| {
            DomainError::EngineError(format!("bad ifindex in {}: {e}", path.display()))
        })
    }
}

/// Fixed name → index table.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaceResolver {
    indexes: BTreeMap<String, u32>,
}

impl StaticInterfaceResolver {
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        Self {
            indexes: entries
                .into_iter()
                .map(|(name, index)| (name.to_string(), index))
                .collect(),
        }
    }
}

impl InterfaceResolverPort for StaticInterfaceResolver {
    fn index_of(&self, name: &str) -> Result<u32, DomainError> {
        self.indexes.get(name).copied().ok_or_else(|| {
            ChainError::UnknownInterface {
                name: name.to_string(),
            }
            .into()
        })
    }
}
