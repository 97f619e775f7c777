use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every Phabricator object reference starts with this marker.
pub const PHID_MARKER: &str = "PHID-";

pub const STORY_TEXT_FIELD: &str = "storyText";
pub const STORY_TYPE_FIELD: &str = "storyType";
pub const TAGGED_STORY_TYPE: &str = "PhabricatorFeedTaggedStory";

pub const TAG_KEY: &str = "tag";
pub const TITLE_KEY: &str = "title";

pub const MSGTYPE_TEXT: &str = "m.text";
pub const FORMAT_HTML: &str = "org.matrix.custom.html";

pub const BODY_START: &str = "<body>";
pub const BODY_END: &str = "</body>";

/// Conduit wraps every response in this envelope. `result` is `null` when
/// the call failed, with the reason in `error_code`/`error_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitEnvelope {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_info: Option<String>,
}

/// One entry of a `phid.query` result map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhidRecord {
    pub phid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uri: String,
}

/// Body of `PUT/POST /rooms/{room}/send/m.room.message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMessage {
    pub msgtype: String,
    pub body: String,
    pub format: String,
    pub formatted_body: String,
}

impl RoomMessage {
    pub fn html(body: String, formatted_body: String) -> Self {
        Self {
            msgtype: MSGTYPE_TEXT.to_string(),
            body,
            format: FORMAT_HTML.to_string(),
            formatted_body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_tolerates_missing_fields() {
        let env: ConduitEnvelope = serde_json::from_value(json!({})).unwrap();
        assert!(env.result.is_null());
        assert!(env.error_code.is_none());
    }

    #[test]
    fn phid_record_requires_phid_only() {
        let rec: PhidRecord = serde_json::from_value(json!({"phid": "PHID-TASK-1"})).unwrap();
        assert_eq!(rec.name, "");
        assert!(serde_json::from_value::<PhidRecord>(json!({"name": "T1"})).is_err());
    }

    #[test]
    fn room_message_serializes_matrix_fields() {
        let msg = RoomMessage::html("hi".to_string(), "<body>hi</body>".to_string());
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["msgtype"], "m.text");
        assert_eq!(v["format"], "org.matrix.custom.html");
        assert_eq!(v["formatted_body"], "<body>hi</body>");
    }
}
