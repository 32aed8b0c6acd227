//! Market data clients

pub mod binance;

pub use binance::BinanceClient;
