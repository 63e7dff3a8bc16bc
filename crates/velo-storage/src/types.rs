/// Durable row for a single component. The component id is the keyspace
/// key; ownership and name live in the value.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComponentRow {
    pub bike_id: u64,
    pub name: String,
}

/// A command that was consumed from the log but could not be applied.
///
/// The entry is considered applied (the log prefix stays replayable); the
/// payload is parked here for operator inspection instead of being lost.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeadLetter {
    pub index: u64,
    pub payload: Vec<u8>,
    pub error: String,
}
