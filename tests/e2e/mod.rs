//! 端到端场景测试

mod breaker_recovery;
mod config_push_lifecycle;
