//! 资产层级：Site → Area → Line → Cell → Machine。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// 机台在资产层级中的完整路径。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetPath {
    pub site: String,
    pub area: String,
    pub line: String,
    pub cell: String,
    pub machine: String,
}

impl AssetPath {
    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.site, self.area, self.line, self.cell, self.machine
        )
    }

    /// 作为丰富阶段的元数据。
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("site".to_string(), self.site.clone());
        metadata.insert("area".to_string(), self.area.clone());
        metadata.insert("line".to_string(), self.line.clone());
        metadata.insert("cell".to_string(), self.cell.clone());
        metadata
    }
}

/// 只读的机台索引。
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    machines: HashMap<String, AssetPath>,
}

impl AssetRegistry {
    pub fn new(paths: impl IntoIterator<Item = AssetPath>) -> Self {
        Self {
            machines: paths
                .into_iter()
                .map(|path| (path.machine.clone(), path))
                .collect(),
        }
    }

    pub fn resolve(&self, machine_id: &str) -> Option<&AssetPath> {
        self.machines.get(machine_id)
    }

    pub fn machine_ids(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
