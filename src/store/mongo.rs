use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mongodb::{
    bson::{doc, to_document, Document},
    options::{ClientOptions, Credential, IndexOptions, ServerAddress},
    Client, Collection, IndexModel,
};
use tracing::info;

use super::{PriceStore, UpsertOutcome};
use crate::{
    connection::Connector,
    error::StoreError,
    event::PriceRecord,
    state::Dependency,
};

pub const COLLECTION: &str = "prices";
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MongoSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// MongoDB collection of price records
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
}

impl MongoStore {
    /// Connects, checks the server answers a ping and makes sure indexes exist
    pub async fn connect(settings: &MongoSettings) -> anyhow::Result<Self> {
        let mut credential = Credential::default();
        credential.username = Some(settings.username.clone());
        credential.password = Some(settings.password.clone());
        credential.source = Some("admin".to_string());

        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: settings.host.clone(),
            port: Some(settings.port),
        }];
        options.credential = Some(credential);
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        options.app_name = Some(crate::state::SERVICE_NAME.to_string());
        let client = Client::with_options(options).context("creating MongoDB client")?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .context("pinging MongoDB")?;

        let collection = client
            .database(&settings.database)
            .collection::<Document>(COLLECTION);
        let store = MongoStore { client, collection };
        store.ensure_indexes().await.context("creating indexes")?;
        Ok(store)
    }

    /// Index creation is a no-op for indexes that already exist with the same keys and options
    async fn ensure_indexes(&self) -> Result<(), mongodb::error::Error> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "event_id": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder().keys(doc! { "metal": 1 }).build(),
            IndexModel::builder().keys(doc! { "timestamp": 1 }).build(),
            IndexModel::builder().keys(doc! { "processed_at": 1 }).build(),
            IndexModel::builder()
                .keys(doc! { "metal": 1, "timestamp": -1 })
                .build(),
        ];
        self.collection.create_indexes(indexes).await?;
        Ok(())
    }
}

#[async_trait]
impl PriceStore for MongoStore {
    async fn upsert(&self, record: &PriceRecord) -> Result<UpsertOutcome, StoreError> {
        let document = to_document(record)?;
        let result = self
            .collection
            .update_one(
                doc! { "event_id": record.event_id() },
                doc! { "$set": document },
            )
            .upsert(true)
            .await?;
        Ok(match result.upserted_id {
            Some(_) => UpsertOutcome::Inserted,
            None => UpsertOutcome::Updated,
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.collection.count_documents(doc! {}).await?)
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

pub struct MongoConnector {
    settings: MongoSettings,
}

impl MongoConnector {
    pub fn new(settings: MongoSettings) -> Self {
        MongoConnector { settings }
    }
}

#[async_trait]
impl Connector for MongoConnector {
    type Connection = MongoStore;

    fn dependency(&self) -> Dependency {
        Dependency::MongoDb
    }

    fn target(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }

    async fn connect(&self) -> anyhow::Result<MongoStore> {
        let store = MongoStore::connect(&self.settings).await?;
        info!(
            database = %self.settings.database,
            collection = COLLECTION,
            "MongoDB collection ready"
        );
        Ok(store)
    }
}
