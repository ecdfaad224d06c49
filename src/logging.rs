// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 日志初始化

use tracing_subscriber::EnvFilter;

/// 安装全局 fmt 日志订阅器, 级别取自 `RUST_LOG` (默认 `info`)
///
/// 重复调用是安全的: 已有订阅器时直接返回 `false`
pub fn init() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_twice() {
        let _ = super::init();
        assert!(!super::init());
    }
}
