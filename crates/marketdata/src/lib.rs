pub mod binance;
pub mod cache;
pub mod manager;
pub mod store;

pub use binance::{BinanceVenue, CandleSource, FetchReq};
pub use cache::{Series, SeriesCache, SeriesKey, MIN_CACHE_CANDLES};
pub use manager::{
    KlineManager, KlineManagerConfig, ManagerHandle, ProjectSymbolSource, SymbolSource,
};
pub use store::{KlineStore, MemKlineStore, PgKlineStore};
