use crate::errors::{BridgeError, Result};
use chrono::Utc;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, UpdateOptions};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

/// One month of accrued bandwidth, keyed by "YYYY-MM". The counter only
/// ever grows within a month; timestamps ride along as RFC 3339 strings
/// and are for operators, not for the code.
#[derive(Debug, Serialize, Deserialize)]
pub struct BandwidthRecord {
    #[serde(rename = "_id")]
    pub month: String,
    pub bytes_used: i64,
}

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db_name: String,
}

impl MongoStore {
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        let mut client_options = ClientOptions::parse(uri).await?;
        client_options.app_name = Some("tgbridge".to_string());
        let client = Client::with_options(client_options)?;

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    fn bandwidth_collection(&self) -> Collection<BandwidthRecord> {
        self.client.database(&self.db_name).collection("bandwidth")
    }

    fn users_collection(&self) -> Collection<mongodb::bson::Document> {
        self.client.database(&self.db_name).collection("users")
    }

    /// Accrue bytes onto the month's record, creating it on first touch.
    /// `$inc` makes replays of the same flush batch additive, so the caller
    /// must only hand over each delta once.
    pub async fn add_bandwidth(&self, month: &str, bytes: u64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let options = UpdateOptions::builder().upsert(true).build();
        self.bandwidth_collection()
            .update_one(
                doc! { "_id": month },
                doc! {
                    "$inc": { "bytes_used": bytes as i64 },
                    "$set": { "last_updated": now.clone() },
                    "$setOnInsert": { "created_at": now },
                },
                options,
            )
            .await
            .map_err(BridgeError::Mongo)?;
        Ok(())
    }

    pub async fn get_bandwidth(&self, month: &str) -> Result<u64> {
        let record = self
            .bandwidth_collection()
            .find_one(doc! { "_id": month }, None)
            .await
            .map_err(BridgeError::Mongo)?;
        Ok(record.map(|r| r.bytes_used.max(0) as u64).unwrap_or(0))
    }

    /// Delete month records strictly older than `cutoff_month`. The current
    /// month is never deleted, whatever the cutoff says.
    pub async fn prune_bandwidth(&self, cutoff_month: &str, current_month: &str) -> Result<u64> {
        let result = self
            .bandwidth_collection()
            .delete_many(
                doc! { "_id": { "$lt": cutoff_month, "$ne": current_month } },
                None,
            )
            .await
            .map_err(BridgeError::Mongo)?;
        Ok(result.deleted_count)
    }

    /// Size of the `users` collection maintained by the command surface.
    pub async fn total_users(&self) -> Result<u64> {
        self.users_collection()
            .count_documents(doc! {}, None)
            .await
            .map_err(BridgeError::Mongo)
    }
}
