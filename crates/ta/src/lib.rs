pub mod engine;
pub mod math;
pub mod source;

pub use engine::Indicators;
pub use math::{Bands, MacdPoint};
pub use source::Source;
