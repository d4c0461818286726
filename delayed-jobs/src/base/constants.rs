use std::time::Duration;

/// 默认优先级（数值越小越先被认领）
pub const DEFAULT_PRIORITY: i32 = 100;
/// 优先级上限
pub const MAXIMUM_PRIORITY: i32 = 100;
/// 优先级下限，低于它的值在入队时被截断
pub const MINIMUM_PRIORITY: i32 = -(1 << 20);

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// 最大重试次数上限
pub const MAXIMUM_MAX_RETRIES: u32 = 5;

/// 默认任务最大执行时间
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(25 * 60); // 25 分钟

/// 消费者回收周期
pub const DEFAULT_PULSE_TIME: Duration = Duration::from_secs(6 * 60 * 60);

/// 主机记录刷新间隔
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
/// 认领后等待再校验的时间
pub const DEFAULT_CLAIM_GRACE: Duration = Duration::from_millis(250);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// 归档默认值
pub const DEFAULT_ARCHIVE_TABLE: &str = "delayed_jobs_archive";
pub const DEFAULT_ARCHIVE_TIME_LIMIT: Duration = Duration::from_secs(90 * 24 * 60 * 60);
pub const DEFAULT_ARCHIVE_RECURRING: &str = "00:30";

/// 默认 Redis 键前缀
pub const DEFAULT_KEY_PREFIX: &str = "dj";

/// 超时强杀时写入的消息
pub const TIMEOUT_MESSAGE: &str = "Job ran too long, killed";
/// 进程已退出但任务仍为 BUSY 时写入的消息
pub const CRASHED_MESSAGE: &str = "Job not running, but db said it is, could be a runtime error";

/// 版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
