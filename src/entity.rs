//! Entity trait and identifier helpers.

use bson::oid::ObjectId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record type persisted in a collection.
///
/// The logical name doubles as the physical collection name; which database
/// that collection lives in is decided per call by the environment. Fields
/// beyond the identifier are opaque to this layer and defined by the caller
/// through serde.
///
/// An entity whose identifier is the all-zero [`ObjectId`] is treated as not
/// yet persisted; the write paths assign a freshly generated identifier in
/// place, which callers can rely on after `save`/`insert` return.
///
/// # Example
///
/// ```rust,ignore
/// use bson::oid::ObjectId;
/// use corral::Entity;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct User {
///     #[serde(rename = "_id")]
///     id: ObjectId,
///     name: String,
/// }
///
/// impl Entity for User {
///     const COLLECTION: &'static str = "User";
///     fn id(&self) -> ObjectId { self.id }
///     fn set_id(&mut self, id: ObjectId) { self.id = id; }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    /// Collection this entity type maps to.
    const COLLECTION: &'static str;

    /// Current identifier (zero when not yet persisted).
    fn id(&self) -> ObjectId;

    /// Assign the identifier. Called by the write paths.
    fn set_id(&mut self, id: ObjectId);

    /// Whether the entity has not been persisted yet.
    fn is_new(&self) -> bool {
        self.id() == zero_id()
    }
}

/// The all-zero identifier marking a not-yet-persisted entity.
pub fn zero_id() -> ObjectId {
    ObjectId::from_bytes([0u8; 12])
}

/// Stub carrying only the identifier of a deleted document.
///
/// Delete change events cannot carry the full document, so the watcher wraps
/// the surviving identifier in this stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedStub {
    /// Identifier of the deleted document.
    #[serde(rename = "_id")]
    pub id: ObjectId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Sample {
        #[serde(rename = "_id")]
        id: ObjectId,
        name: String,
    }

    impl Entity for Sample {
        const COLLECTION: &'static str = "Sample";

        fn id(&self) -> ObjectId {
            self.id
        }

        fn set_id(&mut self, id: ObjectId) {
            self.id = id;
        }
    }

    #[test]
    fn test_is_new() {
        let mut sample = Sample {
            id: zero_id(),
            name: "a".into(),
        };
        assert!(sample.is_new());

        sample.set_id(ObjectId::new());
        assert!(!sample.is_new());
    }

    #[test]
    fn test_deleted_stub_roundtrip() {
        let id = ObjectId::new();
        let doc = bson::to_document(&DeletedStub { id }).unwrap();
        assert_eq!(doc.get_object_id("_id").unwrap(), id);

        let stub: DeletedStub = bson::from_document(doc).unwrap();
        assert_eq!(stub.id, id);
    }
}
