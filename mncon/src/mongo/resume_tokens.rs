//! Persistent storage for MongoDB change stream resume tokens.

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Client, Collection};

use crate::config::CollectionSpec;
use crate::error::Error;

/// Storage seam for resume tokens, so the per-event pipeline can be
/// exercised without a running MongoDB.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Newest persisted token, if any.
    async fn last(&self) -> Result<Option<Bson>, Error>;
    /// Persist `token` as the newest resume position.
    async fn save(&self, token: &Bson) -> Result<(), Error>;
}

/// Token collection keyed by the collection name, one record per watched
/// collection, updated in place. In capped mode records are append-only and
/// the newest one wins on resume.
pub struct ResumeTokensDb {
    collection: Collection<Document>,
    coll_name: String,
    capped: bool,
}

impl ResumeTokensDb {
    pub fn new(client: &Client, spec: &CollectionSpec) -> Self {
        let collection = client
            .database(&spec.tokens_db_name)
            .collection::<Document>(&spec.tokens_coll_name);
        Self {
            collection,
            coll_name: spec.tokens_coll_name.clone(),
            capped: spec.tokens_coll_capped,
        }
    }
}

#[async_trait]
impl TokenStore for ResumeTokensDb {
    async fn last(&self) -> Result<Option<Bson>, Error> {
        let found = if self.capped {
            // Capped collections preserve insertion order.
            self.collection
                .find_one(doc! {})
                .sort(doc! {"$natural": -1})
                .await?
        } else {
            self.collection
                .find_one(doc! {"_id": &self.coll_name})
                .await?
        };
        Ok(found.and_then(|d| d.get("value").cloned()))
    }

    async fn save(&self, token: &Bson) -> Result<(), Error> {
        if self.capped {
            self.collection
                .insert_one(doc! {"value": token.clone()})
                .await?;
        } else {
            let options = mongodb::options::UpdateOptions::builder()
                .upsert(true)
                .build();
            self.collection
                .update_one(
                    doc! {"_id": &self.coll_name},
                    doc! {"$set": {"value": token.clone()}},
                )
                .with_options(Some(options))
                .await?;
        }
        Ok(())
    }
}
