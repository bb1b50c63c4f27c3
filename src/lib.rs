// perps-ledger: leveraged position ledger and conditional-order engine for WLD/NUMA style pairs.
// liquidation-first evaluation: funding, then mark, then liquidation, then orders.
// ledger math is synchronous and deterministic; I/O sits behind async traits.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: PositionId, OrderId, Pair, Side, Price, Timestamp
//   2.x  conditional.rs: stop loss, take profit, trailing stops, trigger sources
//   3.x  ledger.rs: position slots, margin reservation, close/reduce/liquidate
//   4.x  position.rs: position struct, PnL, margin ratio, partial reduce
//   5.x  funding.rs: 8-hour funding intervals, idempotent accrual
//   6.x  liquidation.rs: liquidation threshold, insurance fund
//   7.x  config.rs: engine params, retry, logging, env presets
//   8.x  engine/: per-tick evaluation: pricing, funding, liquidations, orders
//   9.x  price_feed.rs: feed normalization, pollers, TWAP mark
//   9.1  settlement.rs: chain-unit settlement instructions
//   9.2  store.rs: persisted records at 6dp
//   9.3  execution.rs: execution sink, persistence + settlement dispatchers
//   9.4  service.rs: per-pair async pipelines
//   10.x account.rs: account + collateral management
//   11.x events.rs: state transition events for audit

// core ledger modules
pub mod account;
pub mod conditional;
pub mod engine;
pub mod events;
pub mod funding;
pub mod ledger;
pub mod liquidation;
pub mod position;
pub mod types;

// integration modules
pub mod config;
pub mod execution;
pub mod price_feed;
pub mod service;
pub mod settlement;
pub mod store;

// re exports for convenience
pub use account::*;
pub use conditional::*;
pub use engine::*;
pub use events::*;
pub use funding::*;
pub use ledger::*;
pub use liquidation::*;
pub use position::*;
pub use types::*;
pub use config::{DegradedPolicy, EngineConfig, Environment, LoggingConfig, RetryPolicy};
pub use execution::{Applied, DispatchHandle, ExecutionIntent, ExecutionSink, Outbox};
pub use price_feed::{FeedNormalizer, PriceSource, PriceTick, TickSink, TwapCalculator};
pub use service::EngineService;
pub use settlement::{InMemorySettlement, SettlementContract, SettlementInstruction};
pub use store::{InMemoryRepository, Repository};
