//! 别名分配

use crate::error::{Error, Result};
use crate::relation::{AliasPolicy, Discovered};
use crate::types::{Alias, AliasMap};

/// 为新发现的地址分配别名
///
/// `taken` 是本次运行已分配的别名（含根别名）。派生别名冲突时追加从 2 开始的
/// 数字后缀；模板别名冲突视为歧义，直接报错。
pub fn assign(parent: &str, found: &Discovered, taken: &AliasMap) -> Result<Alias> {
    match &found.alias {
        AliasPolicy::Derived => {
            let base = match found.index {
                Some(index) => format!("{}{}", found.relation, index),
                None => found.relation.clone(),
            };
            if !taken.contains_key(&base) {
                return Ok(base);
            }
            (2u64..)
                .map(|n| format!("{}{}", base, n))
                .find(|candidate| !taken.contains_key(candidate))
                .ok_or_else(|| Error::InternalError(format!("无法为 {} 分配别名", base)))
        }
        AliasPolicy::Template(template) => {
            let alias = render(template, parent, found);
            match taken.get(&alias) {
                Some(existing) => Err(Error::RelationAmbiguity {
                    alias,
                    existing: *existing,
                    conflicting: found.address,
                    relation: format!("{}.{}", parent, found.relation),
                }),
                None => Ok(alias),
            }
        }
    }
}

fn render(template: &str, parent: &str, found: &Discovered) -> String {
    let index = found.index.map(|i| i.to_string()).unwrap_or_default();
    template
        .replace("{parent}", parent)
        .replace("{relation}", &found.relation)
        .replace("{index}", &index)
}
