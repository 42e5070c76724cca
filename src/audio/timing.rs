//! 单调时钟
//!
//! 所有"样本何时到达扬声器"的绝对时间都以进程内单调时钟的微秒数表示。
//! 拉模式设备回调传入的 `out_time_us` 也必须使用同一参考系。

use std::sync::OnceLock;
use std::time::Instant;

/// 时钟原点（全局缓存，只初始化一次）
static EPOCH: OnceLock<Instant> = OnceLock::new();

#[inline]
fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// 获取当前时间（微秒）
#[inline]
pub fn now_us() -> i64 {
    epoch().elapsed().as_micros() as i64
}

/// 秒 → 微秒
#[inline]
pub fn secs_to_us(secs: f64) -> i64 {
    (secs * 1_000_000.0) as i64
}

/// 微秒 → 秒
#[inline]
pub fn us_to_secs(us: i64) -> f64 {
    us as f64 / 1_000_000.0
}
