use serde::{Deserialize, Deserializer};

/// A catalog entry: one bike and the components it owns.
///
/// `id = 0` on input means "assign me an identity"; the store replaces it
/// with `max(existing ids) + 1` inside the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Bike {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub components: Vec<Component>,
}

/// A part owned by exactly one bike.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Component {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub bike_id: u64,
    pub name: String,
}

/// Clients may send `"components": null` (or omit the field) for an empty
/// list; both decode to an empty `Vec`.
fn null_as_empty<'de, D>(de: D) -> Result<Vec<Component>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<Vec<Component>>::deserialize(de)?;
    Ok(opt.unwrap_or_default())
}

/// Discriminator carried by every replicated log entry. The state machine
/// interprets `Command` payloads; every other kind applies as a successful
/// no-op so the log prefix stays replayable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    Command,
    Noop,
    Barrier,
    Configuration,
}

/// A single entry in the replicated log.
///
/// All fields round-trip through the durable codec, including `extensions`,
/// which the consensus library owns and the core never inspects.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
    #[serde(default)]
    pub extensions: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum VeloError {
    /// No such bike, log entry, or stable key. The consensus layer matches
    /// on this variant to detect missing log entries and first boot.
    #[error("not found")]
    NotFound,
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("operation timed out")]
    Timeout,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
