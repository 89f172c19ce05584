pub mod calendar;
pub mod candle;
pub mod config;
pub mod error;
pub mod interval;
pub mod schema;
pub mod series;
pub mod store;
