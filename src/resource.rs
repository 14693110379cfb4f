//! 资源标识模块
//!
//! 定义受保护资源的标识类型，作为所有集群/缓存/限额查找的键。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 资源标识
///
/// 三种形态：
/// - `Plain`: 普通资源（一个方法、一个接口）
/// - `ArgQualified`: 参数值限定资源（父资源 + 参数名 + 参数值）
/// - `Group`: 命名分组（一组普通资源共享一套外部配置）
///
/// 值语义，按结构相等/哈希，创建后不再变更。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceId {
    /// 普通资源
    Plain(String),
    /// 参数值限定资源
    ArgQualified {
        /// 父资源名
        parent: String,
        /// 参数名
        arg_name: String,
        /// 参数值
        value: String,
    },
    /// 命名分组
    Group(String),
}

impl ResourceId {
    /// 普通资源
    pub fn plain(name: impl Into<String>) -> Self {
        ResourceId::Plain(name.into())
    }

    /// 参数值限定资源
    pub fn arg(
        parent: impl Into<String>,
        arg_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        ResourceId::ArgQualified {
            parent: parent.into(),
            arg_name: arg_name.into(),
            value: value.into(),
        }
    }

    /// 命名分组
    pub fn group(name: impl Into<String>) -> Self {
        ResourceId::Group(name.into())
    }

    /// 点分名称，用于正则/通配匹配与日志输出
    pub fn dotted_name(&self) -> String {
        match self {
            ResourceId::Plain(name) => name.clone(),
            ResourceId::ArgQualified {
                parent,
                arg_name,
                value,
            } => format!("{}.{}.{}", parent, arg_name, value),
            ResourceId::Group(name) => name.clone(),
        }
    }

    /// 父资源名（参数限定资源返回其父资源，其余返回自身名称）
    pub fn parent_name(&self) -> &str {
        match self {
            ResourceId::Plain(name) => name,
            ResourceId::ArgQualified { parent, .. } => parent,
            ResourceId::Group(name) => name,
        }
    }

    /// 参数维度标识 `parent.argName`，仅参数限定资源有值
    ///
    /// 同一方法的不同参数名各自拥有独立的守卫创建预算。
    pub fn arg_scope(&self) -> Option<String> {
        match self {
            ResourceId::ArgQualified {
                parent, arg_name, ..
            } => Some(format!("{}.{}", parent, arg_name)),
            _ => None,
        }
    }

    /// 是否为参数值限定资源
    pub fn is_arg_qualified(&self) -> bool {
        matches!(self, ResourceId::ArgQualified { .. })
    }

    /// 是否为分组
    pub fn is_group(&self) -> bool {
        matches!(self, ResourceId::Group(_))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dotted_name())
    }
}

impl From<&str> for ResourceId {
    fn from(name: &str) -> Self {
        ResourceId::Plain(name.to_string())
    }
}

/// 分组标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(name: impl Into<String>) -> Self {
        GroupId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
