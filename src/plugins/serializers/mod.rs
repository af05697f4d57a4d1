#[cfg(feature = "line-protocol")]
pub mod influx;
pub mod json;
