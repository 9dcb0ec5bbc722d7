//! 运行报告：本次结果相对运行前持久化状态的差异

use crate::relation::RelationSkip;
use crate::types::{Address, Alias, AliasMap, ProxyMap, ProxyRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change<T> {
    pub before: T,
    pub after: T,
}

/// 一次遍历的结果摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiderReport {
    pub run_id: Uuid,
    pub deployment: String,
    pub network: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 访问的节点数
    pub visited: usize,
    pub added_aliases: AliasMap,
    pub changed_aliases: BTreeMap<Alias, Change<Address>>,
    pub removed_aliases: Vec<Alias>,
    pub added_proxies: ProxyMap,
    pub changed_proxies: BTreeMap<Alias, Change<ProxyRecord>>,
    pub removed_proxies: Vec<Alias>,
    pub skipped: Vec<RelationSkip>,
    /// 因深度上限未展开的别名
    pub truncated: Vec<Alias>,
}

impl SpiderReport {
    pub fn is_unchanged(&self) -> bool {
        self.added_aliases.is_empty()
            && self.changed_aliases.is_empty()
            && self.removed_aliases.is_empty()
            && self.added_proxies.is_empty()
            && self.changed_proxies.is_empty()
            && self.removed_proxies.is_empty()
    }

    /// 填充别名和代理表的差异
    pub fn diff(
        &mut self,
        before_aliases: &AliasMap,
        after_aliases: &AliasMap,
        before_proxies: &ProxyMap,
        after_proxies: &ProxyMap,
    ) {
        let (added, changed, removed) = diff_maps(before_aliases, after_aliases);
        self.added_aliases = added;
        self.changed_aliases = changed;
        self.removed_aliases = removed;

        let (added, changed, removed) = diff_maps(before_proxies, after_proxies);
        self.added_proxies = added;
        self.changed_proxies = changed;
        self.removed_proxies = removed;
    }
}

type MapDiff<V> = (BTreeMap<Alias, V>, BTreeMap<Alias, Change<V>>, Vec<Alias>);

fn diff_maps<V: Clone + PartialEq>(before: &BTreeMap<Alias, V>, after: &BTreeMap<Alias, V>) -> MapDiff<V> {
    let mut added = BTreeMap::new();
    let mut changed = BTreeMap::new();
    for (alias, value) in after {
        match before.get(alias) {
            None => {
                added.insert(alias.clone(), value.clone());
            }
            Some(old) if old != value => {
                changed.insert(
                    alias.clone(),
                    Change {
                        before: old.clone(),
                        after: value.clone(),
                    },
                );
            }
            Some(_) => {}
        }
    }
    let removed = before
        .keys()
        .filter(|alias| !after.contains_key(*alias))
        .cloned()
        .collect();
    (added, changed, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_maps() {
        let one = Address::from_hex("0x0000000000000000000000000000000000000001").unwrap();
        let two = Address::from_hex("0x0000000000000000000000000000000000000002").unwrap();

        let mut before = AliasMap::new();
        before.insert("Comet".to_string(), one);
        before.insert("Old".to_string(), one);
        let mut after = AliasMap::new();
        after.insert("Comet".to_string(), two);
        after.insert("USDC".to_string(), two);

        let (added, changed, removed) = diff_maps(&before, &after);
        assert_eq!(added.keys().collect::<Vec<_>>(), vec!["USDC"]);
        assert_eq!(changed["Comet"], Change { before: one, after: two });
        assert_eq!(removed, vec!["Old".to_string()]);
    }
}
