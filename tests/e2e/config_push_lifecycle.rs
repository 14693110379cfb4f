//! 端到端测试：外部配置推送的完整生命周期
//!
//! 测试场景：
//! 1. 资源无配置时调用直通
//! 2. 精确键推送后守卫生效
//! 3. 模式键扇出到整个命名空间
//! 4. 分组配置被成员继承、被资源专属配置字段级覆盖
//! 5. 再次推送调整限额，统计不丢失
//! 6. 撤销推送后恢复直通

use ahash::AHashMap;
use resguard::prelude::*;

fn rate_limited(limit: u64) -> ExternalConfig {
    ExternalConfig {
        limit_for_period: Some(limit),
        limit_refresh_period: Some("60s".to_string()),
        ..Default::default()
    }
}

/// 消耗一个资源的全部速率许可，返回成功次数
fn drain(keeper: &Keeper, resource: &str) -> u64 {
    let mut granted = 0;
    loop {
        match keeper.invoke(resource, || Ok::<_, Fault>(())) {
            Ok(()) => granted += 1,
            Err(ResguardError::RejectedByRateLimit { .. }) => return granted,
            Err(other) => panic!("意外错误: {other}"),
        }
    }
}

#[test]
fn test_push_and_withdraw_lifecycle() {
    let keeper = Keeper::new();

    // 阶段 1：无配置直通
    assert!(keeper.invoke("user.get", || Ok::<_, Fault>(())).is_ok());
    assert!(keeper.stats("user.get").is_none());

    // 阶段 2：精确键推送
    let mut configs = AHashMap::new();
    configs.insert("user.get".to_string(), rate_limited(3));
    keeper.update_configs(configs).unwrap();
    assert_eq!(drain(&keeper, "user.get"), 3);

    // 阶段 3：调整限额，同窗口内已消耗的许可保留
    let mut configs = AHashMap::new();
    configs.insert("user.get".to_string(), rate_limited(5));
    keeper.update_configs(configs).unwrap();
    let stats = keeper.stats("user.get").unwrap().rate.unwrap();
    assert_eq!(stats.used_in_window, 3);

    // 阶段 4：撤销推送，集群移除，恢复直通
    keeper.update_configs(AHashMap::new()).unwrap();
    assert!(keeper.stats("user.get").is_none());
    for _ in 0..10 {
        assert!(keeper.invoke("user.get", || Ok::<_, Fault>(())).is_ok());
    }
}

#[test]
fn test_pattern_push_covers_namespace() {
    let keeper = Keeper::new();

    // 两个资源先被调用过，进入已知集合
    assert!(keeper.invoke("user.get", || Ok::<_, Fault>(())).is_ok());
    assert!(keeper.invoke("user.list", || Ok::<_, Fault>(())).is_ok());

    let mut configs = AHashMap::new();
    configs.insert("user\\..*".to_string(), rate_limited(2));
    keeper.update_configs(configs).unwrap();

    // 已解析的两个资源同时生效，且各自独立计数
    assert_eq!(drain(&keeper, "user.get"), 2);
    assert_eq!(drain(&keeper, "user.list"), 2);
    // 首次出现的匹配资源也被覆盖
    assert_eq!(drain(&keeper, "user.delete"), 2);
    // 命名空间之外不受影响
    assert!(keeper.invoke("order.create", || Ok::<_, Fault>(())).is_ok());
    assert!(keeper.stats("order.create").is_none());

    // 移除模式后全部回到直通
    keeper.update_configs(AHashMap::new()).unwrap();
    assert!(keeper.invoke("user.get", || Ok::<_, Fault>(())).is_ok());
    assert!(keeper.stats("user.get").is_none());
}

#[test]
fn test_group_inheritance_and_override() {
    let keeper = Keeper::new();

    let mut groups = AHashMap::new();
    groups.insert(
        "write-apis".to_string(),
        GroupExternalConfig {
            config: ExternalConfig {
                max_concurrency_limit: Some(4),
                ..Default::default()
            },
            members: vec!["order.create".to_string(), "order.cancel".to_string()],
        },
    );
    keeper.update_group_configs(groups).unwrap();

    // 成员继承分组并发限制
    assert!(keeper.invoke("order.create", || Ok::<_, Fault>(())).is_ok());
    assert_eq!(
        keeper
            .stats("order.create")
            .unwrap()
            .concurrency
            .unwrap()
            .threshold,
        4
    );

    // 资源专属配置字段级覆盖分组
    let mut configs = AHashMap::new();
    configs.insert(
        "order.cancel".to_string(),
        ExternalConfig {
            max_concurrency_limit: Some(1),
            ..Default::default()
        },
    );
    keeper.update_configs(configs).unwrap();
    assert!(keeper.invoke("order.cancel", || Ok::<_, Fault>(())).is_ok());
    assert_eq!(
        keeper
            .stats("order.cancel")
            .unwrap()
            .concurrency
            .unwrap()
            .threshold,
        1
    );
    // 另一个成员不受影响
    assert_eq!(
        keeper
            .stats("order.create")
            .unwrap()
            .concurrency
            .unwrap()
            .threshold,
        4
    );
}

#[test]
fn test_invalid_push_is_atomic() {
    let keeper = Keeper::new();

    let mut configs = AHashMap::new();
    configs.insert("user.get".to_string(), rate_limited(2));
    keeper.update_configs(configs).unwrap();
    assert_eq!(drain(&keeper, "user.get"), 2);

    // 坏推送整体拒绝：合法条目也不应用
    let mut bad = AHashMap::new();
    bad.insert("user.get".to_string(), rate_limited(100));
    bad.insert(
        "order.create".to_string(),
        ExternalConfig {
            limit_for_period: Some(1),
            limit_refresh_period: Some("每分钟".to_string()),
            ..Default::default()
        },
    );
    assert!(matches!(
        keeper.update_configs(bad),
        Err(ResguardError::ConfigError(_))
    ));

    // 旧限额仍然生效（窗口未刷新，许可已耗尽）
    assert!(keeper.invoke("user.get", || Ok::<_, Fault>(())).is_err());
    assert!(keeper.stats("order.create").is_none());
}
