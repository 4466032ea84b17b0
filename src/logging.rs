//! 日志初始化
//!
//! 级别优先取命令行给出的值, 其次是环境变量 `LOG`, 都没有时只输出警告和错误.

use log::LevelFilter;

pub fn init(level: Option<&str>) {
    let level = level
        .map(str::to_string)
        .or_else(|| std::env::var("LOG").ok())
        .and_then(|l| l.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Warn);
    // 重复初始化时保留第一次的设置
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .try_init();
}
