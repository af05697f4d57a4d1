#[cfg(feature = "line-protocol")]
pub mod influx;
