//! Nightly and trend aggregation over merged sessions.

pub mod daily;
pub mod episodes;
pub mod flow_limitation;
pub mod intervals;
pub mod leak;
pub mod rolling;
pub mod timeline;
pub mod trend;

pub use daily::{aggregate_days, DailyAggregator, DailyBucket, SessionSlice};
pub use episodes::{Episode, EpisodeKind, SnoreContext};
pub use flow_limitation::Severity;
pub use intervals::{build_intervals, ChannelStats, WeightedInterval, WeightedSeries};
pub use leak::LeakModel;
pub use rolling::RollingAhi;
pub use trend::{monthly, rollup_trends, weekly, TrendBucket, TrendPeriod};
