//! Document store (MongoDB): `raw_logs` and `parsed_logs` collections.
//! The Parser Worker marks the upstream `raw_logs` document
//! processed and writes a `parsed_logs` artifact (templates + feature dict)
//! per build.

use mongodb::bson::{self, doc, oid::ObjectId, DateTime as BsonDateTime, Document};
use mongodb::{Client, Collection};
use serde_json::Value;

use crate::drain::ParseResult;
use crate::error::{PipelineError, Result};
use crate::features::BuildFeatures;

pub struct DocumentStore {
    raw_logs: Collection<Document>,
    parsed_logs: Collection<Document>,
}

impl DocumentStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        Ok(Self {
            raw_logs: db.collection("raw_logs"),
            parsed_logs: db.collection("parsed_logs"),
        })
    }

    /// Mark the upstream `raw_logs` document processed, keyed by the
    /// ingester-assigned `mongo_id`.
    pub async fn mark_raw_log_processed(&self, mongo_id: &str) -> Result<()> {
        let oid = ObjectId::parse_str(mongo_id)
            .map_err(|e| PipelineError::malformed(format!("invalid mongo_id: {e}")))?;

        self.raw_logs
            .update_one(
                doc! { "_id": oid },
                doc! { "$set": { "processed": true, "processed_at": BsonDateTime::now() } },
            )
            .await?;
        Ok(())
    }

    /// Persist the parsed artifact (discovered templates + feature dict)
    /// for a build.
    pub async fn insert_parsed_log(
        &self,
        build_id: &str,
        parse_results: &[ParseResult],
        features: &BuildFeatures,
    ) -> Result<()> {
        let templates: Vec<Document> = parse_results
            .iter()
            .map(|r| {
                doc! {
                    "template_id": &r.template_id,
                    "template": &r.template,
                }
            })
            .collect();

        let feature_value = serde_json::to_value(features)?;
        let feature_doc = json_to_bson_document(&feature_value)?;

        let artifact = doc! {
            "build_id": build_id,
            "templates": templates,
            "features": feature_doc,
            "created_at": BsonDateTime::now(),
        };

        self.parsed_logs.insert_one(artifact).await?;
        Ok(())
    }
}

fn json_to_bson_document(value: &Value) -> Result<Document> {
    bson::to_document(value)
        .map_err(|e| PipelineError::internal(format!("feature dict is not a JSON object: {e}")))
}
