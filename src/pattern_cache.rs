//! 正则模式配置缓存
//!
//! 配置键可以是正则表达式，一条模式配置扇出到所有匹配的资源。
//! 缓存维持两层：模式表（键 → 编译后的正则 + 配置值）与
//! 解析备忘（具体资源名 → 命中的模式键），避免热路径重复扫描。

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use regex::Regex;
use parking_lot::RwLock;
use tracing::{debug, warn};

/// 键中出现任一正则元字符即视为模式键，否则为精确键
pub fn is_pattern_key(key: &str) -> bool {
    key.chars()
        .any(|c| matches!(c, '*' | '?' | '+' | '[' | ']' | '(' | ')' | '^' | '$' | '|' | '\\' | '{' | '}'))
}

struct PatternEntry<V> {
    regex: Regex,
    value: V,
    /// 已扇出到的具体资源名
    matched: AHashSet<String>,
}

/// 模式缓存
///
/// `V` 为与模式关联的配置值，整体替换式更新。
pub struct PatternCache<V: Clone> {
    patterns: RwLock<AHashMap<String, PatternEntry<V>>>,
    /// 资源名 → 命中的模式键；`None` 表示确认无模式命中
    resolved: DashMap<String, Option<String>, ahash::RandomState>,
}

impl<V: Clone> Default for PatternCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> PatternCache<V> {
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(AHashMap::new()),
            resolved: DashMap::default(),
        }
    }

    /// 查找资源命中的模式配置
    ///
    /// 先查备忘，未备忘则按模式键字典序扫描（保证多模式命中时
    /// 结果确定），并将结论（含未命中）写入备忘。
    pub fn lookup(&self, resource: &str) -> Option<V> {
        // 备忘分片守卫先取值即放，之后才碰模式表锁；
        // 全局锁序固定为 模式表 → 备忘
        let memo = self.resolved.get(resource).map(|memo| memo.value().clone());
        if let Some(hit) = memo {
            return hit
                .and_then(|key| self.patterns.read().get(&key).map(|entry| entry.value.clone()));
        }

        let mut patterns = self.patterns.write();
        let mut keys: Vec<&String> = patterns.keys().collect();
        keys.sort();
        let hit = keys
            .into_iter()
            .find(|key| patterns[*key].regex.is_match(resource))
            .cloned();

        let value = hit.as_ref().and_then(|key| {
            patterns.get_mut(key).map(|entry| {
                entry.matched.insert(resource.to_string());
                entry.value.clone()
            })
        });
        self.resolved.insert(resource.to_string(), hit);
        value
    }

    /// 整体替换模式表
    ///
    /// 返回受影响的已解析资源及其新值：`None` 表示该资源
    /// 不再被任何模式覆盖。编译失败的模式键被跳过并告警。
    pub fn update_patterns(
        &self,
        new_patterns: impl IntoIterator<Item = (String, V)>,
    ) -> Vec<(String, Option<V>)> {
        let mut compiled = AHashMap::new();
        for (key, value) in new_patterns {
            match Regex::new(&key) {
                Ok(regex) => {
                    compiled.insert(
                        key,
                        PatternEntry {
                            regex,
                            value,
                            matched: AHashSet::new(),
                        },
                    );
                }
                Err(err) => {
                    warn!(pattern = %key, error = %err, "模式键编译失败，跳过");
                }
            }
        }

        let mut patterns = self.patterns.write();
        *patterns = compiled;
        debug!(patterns = patterns.len(), "模式表已整体替换");

        // 对所有已解析资源重新求值，备忘随之刷新
        let mut keys: Vec<String> = patterns.keys().cloned().collect();
        keys.sort();
        let mut changes = Vec::new();
        for mut memo in self.resolved.iter_mut() {
            let resource = memo.key().clone();
            let hit = keys.iter().find(|key| patterns[*key].regex.is_match(&resource));
            let value = hit.and_then(|key| {
                patterns.get_mut(key).map(|entry| {
                    entry.matched.insert(resource.clone());
                    entry.value.clone()
                })
            });
            *memo.value_mut() = hit.cloned();
            changes.push((resource, value));
        }
        changes
    }

    /// 模式数量
    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }

    /// 某模式当前扇出到的资源集合
    pub fn matched_resources(&self, pattern: &str) -> Vec<String> {
        self.patterns
            .read()
            .get(pattern)
            .map(|entry| entry.matched.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_key_detection() {
        assert!(is_pattern_key("user\\.get.*"));
        assert!(is_pattern_key("order.(create|cancel)"));
        assert!(is_pattern_key("^inventory$"));
        assert!(!is_pattern_key("user.get"));
        assert!(!is_pattern_key("plain_name"));
    }

    #[test]
    fn test_lookup_matches_and_memoizes() {
        let cache = PatternCache::new();
        cache.update_patterns(vec![("user\\..*".to_string(), 7u32)]);
        assert_eq!(cache.lookup("user.get"), Some(7));
        assert_eq!(cache.lookup("user.get"), Some(7));
        assert_eq!(cache.lookup("order.create"), None);
        assert_eq!(cache.matched_resources("user\\..*"), vec!["user.get"]);
    }

    #[test]
    fn test_lexicographically_first_pattern_wins() {
        let cache = PatternCache::new();
        cache.update_patterns(vec![
            ("user\\..*".to_string(), 1u32),
            ("user\\.get.*".to_string(), 2u32),
        ]);
        assert_eq!(cache.lookup("user.get"), Some(1));
    }

    #[test]
    fn test_update_reports_fanout_changes() {
        let cache = PatternCache::new();
        cache.update_patterns(vec![("user\\..*".to_string(), 1u32)]);
        assert_eq!(cache.lookup("user.get"), Some(1));
        assert_eq!(cache.lookup("order.create"), None);

        let mut changes = cache.update_patterns(vec![("order\\..*".to_string(), 2u32)]);
        changes.sort();
        assert_eq!(
            changes,
            vec![
                ("order.create".to_string(), Some(2)),
                ("user.get".to_string(), None),
            ]
        );
        assert_eq!(cache.lookup("user.get"), None);
        assert_eq!(cache.lookup("order.create"), Some(2));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let cache = PatternCache::new();
        cache.update_patterns(vec![
            ("user\\..*".to_string(), 1u32),
            ("broken(".to_string(), 2u32),
        ]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("user.get"), Some(1));
    }

    #[test]
    fn test_concurrent_lookup_with_update() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(PatternCache::new());
        cache.update_patterns(vec![("user\\..*".to_string(), 1u32)]);
        assert_eq!(cache.lookup("user.hot"), Some(1));

        // 备忘命中、首次解析与整体替换并发执行
        let mut workers = Vec::new();
        for worker in 0..4 {
            let cache = Arc::clone(&cache);
            workers.push(thread::spawn(move || {
                for round in 0..200 {
                    let _ = cache.lookup("user.hot");
                    let _ = cache.lookup(&format!("user.w{}.r{}", worker, round));
                }
            }));
        }
        let updater = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for round in 0..50u32 {
                    cache.update_patterns(vec![("user\\..*".to_string(), round)]);
                }
            })
        };
        for worker in workers {
            worker.join().unwrap();
        }
        updater.join().unwrap();
        assert!(cache.lookup("user.hot").is_some());
    }

    #[test]
    fn test_value_change_propagates_to_memoized_resource() {
        let cache = PatternCache::new();
        cache.update_patterns(vec![("user\\..*".to_string(), 1u32)]);
        assert_eq!(cache.lookup("user.get"), Some(1));
        let changes = cache.update_patterns(vec![("user\\..*".to_string(), 9u32)]);
        assert_eq!(changes, vec![("user.get".to_string(), Some(9))]);
        assert_eq!(cache.lookup("user.get"), Some(9));
    }
}
