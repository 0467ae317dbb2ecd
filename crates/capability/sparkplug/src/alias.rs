use std::collections::HashMap;

/// 节点范围内的别名表（名称 ↔ 别名），每次出生证明重建。
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    by_name: HashMap<String, u64>,
    by_alias: HashMap<u64, String>,
    next: u64,
}

impl AliasTable {
    pub fn new() -> Self {
        Self {
            next: 1,
            ..Default::default()
        }
    }

    /// 返回已有别名，或分配新别名。
    pub fn assign(&mut self, name: &str) -> u64 {
        if let Some(alias) = self.by_name.get(name) {
            return *alias;
        }
        let alias = self.next.max(1);
        self.next = alias + 1;
        self.insert(name.to_string(), alias);
        alias
    }

    /// 登记对端声明的别名（主机侧使用）。
    pub fn insert(&mut self, name: String, alias: u64) {
        if let Some(previous) = self.by_alias.insert(alias, name.clone())
            && previous != name
        {
            self.by_name.remove(&previous);
        }
        self.by_name.insert(name, alias);
        self.next = self.next.max(alias + 1);
    }

    pub fn alias_of(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, alias: u64) -> Option<&str> {
        self.by_alias.get(&alias).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.by_alias.clear();
        self.next = 1;
    }

    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_is_stable_within_generation() {
        let mut table = AliasTable::new();
        let a = table.assign("press-01/counter.good");
        let b = table.assign("press-01/state.run");
        assert_ne!(a, b);
        assert_eq!(table.assign("press-01/counter.good"), a);
        assert_eq!(table.name_of(b), Some("press-01/state.run"));

        table.clear();
        assert!(table.name_of(a).is_none());
    }
}
