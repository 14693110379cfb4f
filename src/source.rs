//! 外部配置源抽象
//!
//! 配置中心、配置文件等后端实现这两个 trait 即可接入：
//! `Keeper::refresh_from` 对资源和分组做一次全量对账。

use crate::config::{ExternalConfig, GroupExternalConfig};
use crate::resource::{GroupId, ResourceId};

/// 按资源提供外部配置
pub trait ConfigSource: Send + Sync {
    /// 指定资源当前的外部配置，`None` 表示该资源无外部配置
    fn config(&self, resource: &ResourceId) -> Option<ExternalConfig>;

    /// 当前全部分组配置
    fn all_groups(&self) -> Vec<(GroupId, GroupExternalConfig)> {
        Vec::new()
    }
}

/// 资源与分组的归属关系
pub trait GroupSource: Send + Sync {
    /// 资源归属的分组
    fn group_of(&self, resource: &ResourceId) -> Option<GroupId>;

    /// 分组的成员列表
    fn members(&self, group: &GroupId) -> Vec<ResourceId>;
}
