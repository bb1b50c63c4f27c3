// 8.0: core engine. one tick in: funding, price, liquidation, then conditional
// orders for every open position of the tick's pair, each under its own lock.
// deterministic given the tick sequence; all I/O goes through the execution sink.

mod core;
mod funding;
mod liquidations;
mod orders;
mod positions;
mod pricing;
mod results;

pub use core::{Engine, MarketPrices};
pub use results::{EngineError, ErrorKind, TickReport};
