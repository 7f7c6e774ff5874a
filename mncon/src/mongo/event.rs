//! Change event to outbound message mapping.

use mongodb::bson::{Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};

use crate::error::Error;

/// Message derived from one change event, ready for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub msg_id: String,
    pub payload: Vec<u8>,
}

/// Map a change event to `(subject, msg_id, payload)`.
///
/// Returns `Ok(None)` for collection lifecycle events (`rename`,
/// `invalidate`), which are suppressed from the output stream.
pub fn map_change_event(
    stream_name: &str,
    event: &ChangeStreamEvent<Document>,
) -> Result<Option<OutboundMessage>, Error> {
    let Some(op) = operation_name(&event.operation_type) else {
        return Ok(None);
    };

    let msg_id = msg_id(&event.id)?;
    let subject = format!("{}.{}", stream_name.to_uppercase(), op);
    let payload = serde_json::to_vec(event)
        .map_err(|e| Error::EventMalformed(format!("change event is not serializable: {e}")))?;

    Ok(Some(OutboundMessage {
        subject,
        msg_id,
        payload,
    }))
}

fn operation_name(op: &OperationType) -> Option<String> {
    let name = match op {
        OperationType::Insert => "insert",
        OperationType::Update => "update",
        OperationType::Replace => "replace",
        OperationType::Delete => "delete",
        OperationType::Drop => "drop",
        OperationType::DropDatabase => "dropDatabase",
        OperationType::Rename | OperationType::Invalidate => return None,
        OperationType::Other(other) => other.as_str(),
        _ => return None,
    };
    Some(name.to_string())
}

/// Canonical string encoding of the event's `_id` resume token. This is the
/// deduplication key, so it must be stable across restarts.
pub fn msg_id(token: &ResumeToken) -> Result<String, Error> {
    let bson = bson::to_bson(token)
        .map_err(|e| Error::EventMalformed(format!("resume token is not serializable: {e}")))?;
    canonical_token_string(bson)
}

fn canonical_token_string(token: Bson) -> Result<String, Error> {
    match token {
        Bson::String(s) if !s.is_empty() => Ok(s),
        Bson::Document(doc) => match doc.get("_data") {
            Some(Bson::String(data)) if !data.is_empty() => Ok(data.clone()),
            _ if !doc.is_empty() => Ok(Bson::Document(doc).into_canonical_extjson().to_string()),
            _ => Err(Error::EventMalformed(
                "change event carries an empty resume token".to_string(),
            )),
        },
        Bson::Null => Err(Error::EventMalformed(
            "change event is missing its _id resume token".to_string(),
        )),
        other => Ok(other.into_canonical_extjson().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn event(raw: Document) -> ChangeStreamEvent<Document> {
        bson::from_document(raw).expect("valid change event")
    }

    #[test]
    fn maps_insert_to_subject_msg_id_and_payload() {
        let raw = doc! {
            "_id": {"_data": "T1"},
            "operationType": "insert",
            "ns": {"db": "connector-db", "coll": "coll1"},
            "fullDocument": {"x": 1},
        };
        let event = event(raw);

        let msg = map_change_event("COLL1", &event).unwrap().unwrap();

        assert_eq!(msg.subject, "COLL1.insert");
        assert_eq!(msg.msg_id, "T1");

        let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(payload["operationType"], "insert");
        assert_eq!(payload["fullDocument"]["x"], 1);
    }

    #[test]
    fn uppercases_stream_name_in_subject() {
        let raw = doc! {
            "_id": {"_data": "T2"},
            "operationType": "delete",
            "ns": {"db": "connector-db", "coll": "coll1"},
            "documentKey": {"_id": 7},
        };

        let msg = map_change_event("coll1-stream", &event(raw)).unwrap().unwrap();
        assert_eq!(msg.subject, "COLL1-STREAM.delete");
    }

    #[test]
    fn maps_update_replace_and_delete() {
        for op in ["update", "replace", "delete"] {
            let raw = doc! {
                "_id": {"_data": format!("tok-{op}")},
                "operationType": op,
                "ns": {"db": "connector-db", "coll": "coll1"},
                "documentKey": {"_id": 1},
            };
            let msg = map_change_event("COLL1", &event(raw)).unwrap().unwrap();
            assert_eq!(msg.subject, format!("COLL1.{op}"));
            assert_eq!(msg.msg_id, format!("tok-{op}"));
        }
    }

    #[test]
    fn suppresses_rename_events() {
        let raw = doc! {
            "_id": {"_data": "T3"},
            "operationType": "rename",
            "ns": {"db": "connector-db", "coll": "coll1"},
            "to": {"db": "connector-db", "coll": "coll3"},
        };
        assert_eq!(map_change_event("COLL1", &event(raw)).unwrap(), None);
    }

    #[test]
    fn suppresses_invalidate_events() {
        let raw = doc! {
            "_id": {"_data": "T4"},
            "operationType": "invalidate",
        };
        assert_eq!(map_change_event("COLL1", &event(raw)).unwrap(), None);
    }

    #[test]
    fn rejects_empty_resume_token() {
        let raw = doc! {
            "_id": {},
            "operationType": "insert",
            "ns": {"db": "connector-db", "coll": "coll1"},
            "fullDocument": {"x": 1},
        };
        let err = map_change_event("COLL1", &event(raw)).unwrap_err();
        assert!(matches!(err, Error::EventMalformed(_)));
    }

    #[test]
    fn msg_id_is_stable_for_structured_tokens() {
        let raw = doc! {
            "_id": {"_data": "8263A1B2C3", "extra": 1},
            "operationType": "insert",
            "ns": {"db": "connector-db", "coll": "coll1"},
        };
        let a = map_change_event("COLL1", &event(raw.clone())).unwrap().unwrap();
        let b = map_change_event("COLL1", &event(raw)).unwrap().unwrap();
        assert_eq!(a.msg_id, b.msg_id);
        assert_eq!(a.msg_id, "8263A1B2C3");
    }
}
