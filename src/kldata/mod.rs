// 导出数据服务相关模块
pub mod backfill;

// 重新导出常用模块，方便使用
pub use backfill::{BackfillReport, TimeframeBackfiller};
