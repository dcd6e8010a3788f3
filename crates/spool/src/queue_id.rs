use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifies a message within the delivery queue.
///
/// The id is a v7 uuid, whose leading bits are a timestamp, so
/// ids (and their hex renderings) sort in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct QueueId(Uuid);

impl std::fmt::Display for QueueId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.simple().fmt(fmt)
    }
}

impl From<Uuid> for QueueId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<QueueId> for String {
    fn from(id: QueueId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for QueueId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl std::str::FromStr for QueueId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// When the id was allocated
    pub fn created(&self) -> Option<SystemTime> {
        let (seconds, nanos) = self.0.get_timestamp()?.to_unix();
        Some(UNIX_EPOCH + Duration::new(seconds, nanos))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order() {
        let ids: Vec<QueueId> = (0..64).map(|_| QueueId::new()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let rendered: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut sorted_rendered = rendered.clone();
        sorted_rendered.sort();
        assert_eq!(rendered, sorted_rendered);
    }

    #[test]
    fn parse_round_trip() {
        let id = QueueId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<QueueId>().unwrap(), id);
        assert!("not-an-id".parse::<QueueId>().is_err());
    }

    #[test]
    fn has_creation_time() {
        let id = QueueId::new();
        let created = id.created().unwrap();
        let age = SystemTime::now()
            .duration_since(created)
            .unwrap_or_default();
        assert!(age < Duration::from_secs(60));
    }
}
