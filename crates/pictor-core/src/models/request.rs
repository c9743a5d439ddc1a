use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

use super::artifact::ArtifactKind;

/// One unit of work carried by the upstream queue. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingRequest {
    pub kind: ArtifactKind,
    pub collection_id: Uuid,
    pub item_id: Uuid,
    /// Plain path or `container#entry` reference.
    pub source: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

/// Queue-assigned identifier used to acknowledge a delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DeliveryId(pub i64);

impl Display for DeliveryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

/// A request as handed out by the queue. Delivery is at-least-once, so the
/// same request may arrive again under a new or the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: DeliveryId,
    pub request: ProcessingRequest,
    /// Number of times this message has been handed out, including this one.
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_without_job_omits_the_field() {
        let request = ProcessingRequest {
            kind: ArtifactKind::Thumbnail,
            collection_id: Uuid::nil(),
            item_id: Uuid::nil(),
            source: "archive.cbz#001.png".into(),
            width: 320,
            height: 240,
            job_id: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("job_id").is_none());
        assert_eq!(json["kind"], "thumbnail");

        let parsed: ProcessingRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, request);
    }
}
