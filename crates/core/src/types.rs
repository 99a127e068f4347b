/// Sonde identifiers are the serial numbers reported by the ground station.
///
/// Comparison is exact and case-sensitive.
pub type SondeId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
