pub mod binance;
pub mod error;
pub mod provider;
