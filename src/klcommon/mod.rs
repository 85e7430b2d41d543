// 导出共享模块
pub mod config;
pub mod error;
pub mod log_targets;
pub mod logging_setup;
pub mod models;
pub mod store;
pub mod switch;
pub mod timeframe;

// 重新导出常用类型，方便使用
pub use config::{BackfillConfig, LiveConfig, LoggingConfig, RollupConfig, StoreConfig, SwitchConfig};
pub use error::{AppError, Result};
pub use logging_setup::{init_logging, LoggingGuard};
pub use models::{Candle, PersistedBucket, SourceBar};
pub use store::{MemoryStore, SeriesEvent, SeriesWatch, SqliteStore, TimeSeriesStore};
pub use switch::{ModeSignals, StoreSwitch, SwitchSource};
pub use timeframe::{bucket_end, bucket_start, default_timeframes, Timeframe, TimeframeKind, SOURCE_CODE};
