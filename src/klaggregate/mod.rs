//! 多周期K线聚合模块
//!
//! 本模块把源周期（M1）K线滚动聚合成更粗的周期，包含以下核心组件：
//!
//! - `BucketAccumulator`: 单个桶的OHLC折叠规则，回填与实时共用
//! - `AggregatorState`: 实时聚合的每周期状态、脏标记与退役队列
//! - `LiveAggregator`: 订阅源系列并按刷新策略写回的实时聚合器
//! - `ModeCoordinator`: 根据外部开关在实时聚合与历史回填之间切换

pub mod aggregator_state;
pub mod live_aggregator;
pub mod mode_coordinator;
pub mod types;


// 重新导出核心类型
pub use aggregator_state::{AggregatorState, FlushSelect, PendingWrite, TickSummary};
pub use live_aggregator::{FlushReport, LiveAggregator, LiveStats};
pub use mode_coordinator::{CoordinatorState, ModeCoordinator};
pub use types::{merge_bucket, BucketAccumulator, FlushPolicy, WriteMode};
