//! 端到端测试：熔断到恢复的完整流程
//!
//! 测试场景：
//! 1. 下游持续失败，填满关闭态环形缓冲
//! 2. 失败率超阈值，熔断器打开，请求被拒绝
//! 3. 恢复窗口到期，转入半开试探
//! 4. 试探成功，熔断器关闭，恢复正常访问
//! 5. 运维强制打开/清除，状态按指令切换

use resguard::prelude::*;
use std::thread::sleep;
use std::time::Duration;

/// 创建带快速恢复窗口的熔断资源
fn setup_keeper() -> Keeper {
    let keeper = Keeper::new();
    keeper
        .register(
            "downstream.call",
            CompositeConfig::builder()
                .breaker(
                    BreakerConfig::builder()
                        .ring_buffer_size_closed(4)
                        .ring_buffer_size_half_open(2)
                        .failure_rate_threshold(50.0)
                        .wait_duration_open(Duration::from_millis(100))
                        .build(),
                )
                .build(),
        )
        .unwrap();
    keeper
}

fn breaker_state(keeper: &Keeper) -> BreakerState {
    keeper
        .stats("downstream.call")
        .unwrap()
        .breaker
        .unwrap()
        .state
}

#[test]
fn test_breaker_opens_and_recovers() {
    let keeper = setup_keeper();

    // 阶段 1：持续失败填满环形缓冲
    for _ in 0..4 {
        let result = keeper.invoke("downstream.call", || {
            Err::<(), _>(Fault::new("IoError", "connection refused"))
        });
        assert!(result.unwrap_err().as_fault().is_some());
    }
    assert_eq!(breaker_state(&keeper), BreakerState::Open);

    // 阶段 2：打开期间请求被拒绝，底层调用不执行
    let mut called = false;
    let rejected = keeper.invoke("downstream.call", || {
        called = true;
        Ok::<_, Fault>(())
    });
    assert!(matches!(
        rejected.unwrap_err(),
        ResguardError::RejectedByBreaker { .. }
    ));
    assert!(!called);

    // 阶段 3：恢复窗口到期，半开试探放行
    sleep(Duration::from_millis(150));
    for _ in 0..2 {
        let result = keeper.invoke("downstream.call", || Ok::<_, Fault>("pong"));
        assert_eq!(result.unwrap(), "pong");
    }

    // 阶段 4：半开环填满且全部成功，熔断器关闭
    assert_eq!(breaker_state(&keeper), BreakerState::Closed);
    assert!(keeper
        .invoke("downstream.call", || Ok::<_, Fault>(()))
        .is_ok());
}

#[test]
fn test_breaker_reopens_on_failed_probe() {
    let keeper = setup_keeper();

    for _ in 0..4 {
        let _ = keeper.invoke("downstream.call", || {
            Err::<(), _>(Fault::new("IoError", "still down"))
        });
    }
    assert_eq!(breaker_state(&keeper), BreakerState::Open);

    // 半开试探仍然全部失败，回到打开态
    sleep(Duration::from_millis(150));
    for _ in 0..2 {
        let _ = keeper.invoke("downstream.call", || {
            Err::<(), _>(Fault::new("IoError", "still down"))
        });
    }
    assert_eq!(breaker_state(&keeper), BreakerState::Open);
}

#[test]
fn test_manual_override_beats_statistics() {
    let keeper = setup_keeper();

    // 统计完全健康，运维强制打开后仍拒绝
    assert!(keeper
        .invoke("downstream.call", || Ok::<_, Fault>(()))
        .is_ok());
    keeper.force_open("downstream.call").unwrap();
    assert!(keeper
        .invoke("downstream.call", || Ok::<_, Fault>(()))
        .is_err());
    assert_eq!(breaker_state(&keeper), BreakerState::ForcedOpen);

    // 强制停用：永远放行且不再统计
    keeper.force_disable("downstream.call").unwrap();
    for _ in 0..8 {
        let result = keeper.invoke("downstream.call", || {
            Err::<(), _>(Fault::new("IoError", "ignored"))
        });
        assert!(result.unwrap_err().as_fault().is_some());
    }
    assert_eq!(breaker_state(&keeper), BreakerState::ForcedDisabled);

    // 清除强制态回到关闭态，重新积累统计
    keeper.clear_forced("downstream.call").unwrap();
    assert_eq!(breaker_state(&keeper), BreakerState::Closed);
    assert!(keeper
        .invoke("downstream.call", || Ok::<_, Fault>(()))
        .is_ok());
}
