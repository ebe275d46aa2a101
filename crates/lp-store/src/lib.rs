//! Relational store for the LunchPlanner catalog: schema lifecycle,
//! per-entity upserts, and the durable record-failure sink.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lp_core::{EntityKind, Kitchen, Restaurant, RestaurantSubKitchen, SubKitchen};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

pub const CRATE_NAME: &str = "lp-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored schema version {stored} is ahead of target {target}")]
    SchemaAhead { stored: i32, target: i32 },
    #[error("unknown schema version {0}")]
    UnknownSchemaVersion(i32),
    #[error("{0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Schema lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    UpToDate { version: i32 },
    Migrated { from: i32, to: i32 },
}

/// Seam between the pipeline and the destructive DDL owner, substitutable in
/// tests.
#[async_trait]
pub trait SchemaLifecycle: Send + Sync {
    async fn ensure_schema(&self, target_version: i32) -> Result<SchemaStatus, StoreError>;
}

#[derive(Debug)]
struct Migration {
    version: i32,
    statements: &'static [&'static str],
}

pub const TARGET_SCHEMA_VERSION: i32 = 1;

/// Ordered migration steps. Each step moves the schema to its version by
/// dropping dependents in reverse dependency order and recreating everything
/// in forward order, so a step is safe to apply from any earlier shape.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    statements: &[
        "DROP TABLE IF EXISTS lunchplanner.restaurants_subkitchens",
        "DROP TABLE IF EXISTS lunchplanner.subkitchens",
        "DROP TABLE IF EXISTS lunchplanner.restaurants",
        "DROP TABLE IF EXISTS lunchplanner.kitchens",
        "CREATE TABLE lunchplanner.kitchens (\n\
         \tid int PRIMARY KEY,\n\
         \tdescription_de text NOT NULL,\n\
         \tdescription_en text NOT NULL,\n\
         \timageurl text NOT NULL\n\
         )",
        "CREATE TABLE lunchplanner.restaurants (\n\
         \tid text PRIMARY KEY,\n\
         \tname text NOT NULL,\n\
         \tlogourl text,\n\
         \tcity text NOT NULL,\n\
         \tstreet text NOT NULL,\n\
         \tdelivery boolean NOT NULL DEFAULT false,\n\
         \tpickup boolean NOT NULL DEFAULT false,\n\
         \tlocation point\n\
         )",
        "CREATE TABLE lunchplanner.subkitchens (\n\
         \tid int PRIMARY KEY,\n\
         \tdescription_de text NOT NULL,\n\
         \tdescription_en text NOT NULL,\n\
         \tkitchen_id int NOT NULL REFERENCES lunchplanner.kitchens(id)\n\
         )",
        "CREATE TABLE lunchplanner.restaurants_subkitchens (\n\
         \trestaurant_id text REFERENCES lunchplanner.restaurants(id),\n\
         \tsubkitchen_id int REFERENCES lunchplanner.subkitchens(id),\n\
         \tCONSTRAINT pk_restaurants_subkitchens PRIMARY KEY (restaurant_id, subkitchen_id)\n\
         )",
    ],
}];

fn pending_migrations(stored: i32, target: i32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS
        .iter()
        .filter(move |m| m.version > stored && m.version <= target)
}

/// Pure stored-vs-target decision. Destructive DDL only ever moves forward:
/// a store that is ahead of the binary is refused, never downgraded.
fn schema_transition(stored: i32, target: i32) -> Result<SchemaStatus, StoreError> {
    match stored.cmp(&target) {
        Ordering::Equal => Ok(SchemaStatus::UpToDate { version: stored }),
        Ordering::Greater => Err(StoreError::SchemaAhead { stored, target }),
        Ordering::Less => Ok(SchemaStatus::Migrated {
            from: stored,
            to: target,
        }),
    }
}

/// Owns all destructive DDL. `ensure_schema` is idempotent when the stored
/// version already matches the target; otherwise it applies every pending
/// migration step, each inside its own transaction together with its
/// `schema_migrations` version row.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn stored_version(&self) -> Result<i32, StoreError> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS lunchplanner")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS lunchplanner.schema_migrations (\n\
             \tversion int PRIMARY KEY,\n\
             \tapplied_at timestamptz NOT NULL\n\
             )",
        )
        .execute(&self.pool)
        .await?;

        let stored: Option<i32> =
            sqlx::query_scalar("SELECT MAX(version) FROM lunchplanner.schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        Ok(stored.unwrap_or(0))
    }
}

#[async_trait]
impl SchemaLifecycle for SchemaManager {
    async fn ensure_schema(&self, target_version: i32) -> Result<SchemaStatus, StoreError> {
        if !MIGRATIONS.iter().any(|m| m.version == target_version) {
            return Err(StoreError::UnknownSchemaVersion(target_version));
        }

        let stored = self.stored_version().await?;
        let status = schema_transition(stored, target_version)?;
        if let SchemaStatus::Migrated { from, to } = status {
            for migration in pending_migrations(from, to) {
                let mut tx = self.pool.begin().await?;
                for statement in migration.statements {
                    sqlx::query(statement).execute(&mut *tx).await?;
                }
                sqlx::query(
                    "INSERT INTO lunchplanner.schema_migrations (version, applied_at) \
                     VALUES ($1, NOW())",
                )
                .bind(migration.version)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                info!(version = migration.version, "applied schema migration");
            }
        }
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Catalog store (upsert executor)
// ---------------------------------------------------------------------------

/// One idempotent insert-or-replace per entity, keyed by its natural or
/// composite identity. Exactly one round trip per call, all non-key columns
/// overwritten on conflict, never a partial column update.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn upsert_kitchen(&self, kitchen: &Kitchen) -> Result<(), StoreError>;
    async fn upsert_sub_kitchen(&self, sub_kitchen: &SubKitchen) -> Result<(), StoreError>;
    async fn upsert_restaurant(&self, restaurant: &Restaurant) -> Result<(), StoreError>;
    async fn upsert_association(&self, link: &RestaurantSubKitchen) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn upsert_kitchen(&self, kitchen: &Kitchen) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO lunchplanner.kitchens (id, description_de, description_en, imageurl) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET \
             description_de = EXCLUDED.description_de, \
             description_en = EXCLUDED.description_en, \
             imageurl = EXCLUDED.imageurl",
        )
        .bind(kitchen.id)
        .bind(&kitchen.description_de)
        .bind(&kitchen.description_en)
        .bind(&kitchen.image_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_sub_kitchen(&self, sub_kitchen: &SubKitchen) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO lunchplanner.subkitchens (id, description_de, description_en, kitchen_id) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET \
             description_de = EXCLUDED.description_de, \
             description_en = EXCLUDED.description_en, \
             kitchen_id = EXCLUDED.kitchen_id",
        )
        .bind(sub_kitchen.id)
        .bind(&sub_kitchen.description_de)
        .bind(&sub_kitchen.description_en)
        .bind(sub_kitchen.kitchen_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_restaurant(&self, restaurant: &Restaurant) -> Result<(), StoreError> {
        // Postgres point takes (x, y) = (longitude, latitude).
        let lon = restaurant.location.map(|l| l.longitude);
        let lat = restaurant.location.map(|l| l.latitude);
        sqlx::query(
            "INSERT INTO lunchplanner.restaurants \
             (id, name, logourl, city, street, delivery, pickup, location) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, \
             CASE WHEN $8::float8 IS NULL THEN NULL ELSE point($8, $9) END) \
             ON CONFLICT (id) DO UPDATE SET \
             name = EXCLUDED.name, \
             logourl = EXCLUDED.logourl, \
             city = EXCLUDED.city, \
             street = EXCLUDED.street, \
             delivery = EXCLUDED.delivery, \
             pickup = EXCLUDED.pickup, \
             location = EXCLUDED.location",
        )
        .bind(&restaurant.id)
        .bind(&restaurant.name)
        .bind(&restaurant.logo_url)
        .bind(&restaurant.city)
        .bind(&restaurant.street)
        .bind(restaurant.delivery)
        .bind(restaurant.pickup)
        .bind(lon)
        .bind(lat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_association(&self, link: &RestaurantSubKitchen) -> Result<(), StoreError> {
        // The link row has no non-key columns, so "replace" degenerates to
        // keeping the existing row.
        sqlx::query(
            "INSERT INTO lunchplanner.restaurants_subkitchens (restaurant_id, subkitchen_id) \
             VALUES ($1, $2) \
             ON CONFLICT (restaurant_id, subkitchen_id) DO NOTHING",
        )
        .bind(&link.restaurant_id)
        .bind(link.sub_kitchen_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory [`CatalogStore`] with the same keying and referential rules as
/// the Postgres schema. Enforces foreign keys, records the attempted write
/// order, and can be poisoned per key to simulate constraint violations.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    inner: Mutex<MemoryTables>,
}

#[derive(Debug, Default)]
struct MemoryTables {
    kitchens: BTreeMap<i32, Kitchen>,
    sub_kitchens: BTreeMap<i32, SubKitchen>,
    restaurants: BTreeMap<String, Restaurant>,
    associations: BTreeSet<(String, i32)>,
    poisoned: HashSet<(EntityKind, String)>,
    write_log: Vec<(EntityKind, String)>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write for `key` fail, simulating a malformed record or a
    /// constraint violation on that row.
    pub async fn poison(&self, kind: EntityKind, key: impl Into<String>) {
        self.inner.lock().await.poisoned.insert((kind, key.into()));
    }

    pub async fn kitchens(&self) -> Vec<Kitchen> {
        self.inner.lock().await.kitchens.values().cloned().collect()
    }

    pub async fn sub_kitchens(&self) -> Vec<SubKitchen> {
        self.inner.lock().await.sub_kitchens.values().cloned().collect()
    }

    pub async fn restaurants(&self) -> Vec<Restaurant> {
        self.inner.lock().await.restaurants.values().cloned().collect()
    }

    pub async fn associations(&self) -> Vec<RestaurantSubKitchen> {
        self.inner
            .lock()
            .await
            .associations
            .iter()
            .map(|(restaurant_id, sub_kitchen_id)| RestaurantSubKitchen {
                restaurant_id: restaurant_id.clone(),
                sub_kitchen_id: *sub_kitchen_id,
            })
            .collect()
    }

    /// Every attempted write in order, successes and failures alike.
    pub async fn write_order(&self) -> Vec<(EntityKind, String)> {
        self.inner.lock().await.write_log.clone()
    }
}

impl MemoryTables {
    fn check(&mut self, kind: EntityKind, key: String) -> Result<(), StoreError> {
        self.write_log.push((kind, key.clone()));
        if self.poisoned.contains(&(kind, key.clone())) {
            return Err(StoreError::Rejected(format!("{kind} {key} rejected by test poison")));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn upsert_kitchen(&self, kitchen: &Kitchen) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        tables.check(EntityKind::Kitchen, kitchen.id.to_string())?;
        tables.kitchens.insert(kitchen.id, kitchen.clone());
        Ok(())
    }

    async fn upsert_sub_kitchen(&self, sub_kitchen: &SubKitchen) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        tables.check(EntityKind::SubKitchen, sub_kitchen.id.to_string())?;
        if !tables.kitchens.contains_key(&sub_kitchen.kitchen_id) {
            return Err(StoreError::Rejected(format!(
                "subkitchen {} references missing kitchen {}",
                sub_kitchen.id, sub_kitchen.kitchen_id
            )));
        }
        tables.sub_kitchens.insert(sub_kitchen.id, sub_kitchen.clone());
        Ok(())
    }

    async fn upsert_restaurant(&self, restaurant: &Restaurant) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        tables.check(EntityKind::Restaurant, restaurant.id.clone())?;
        tables.restaurants.insert(restaurant.id.clone(), restaurant.clone());
        Ok(())
    }

    async fn upsert_association(&self, link: &RestaurantSubKitchen) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        let key = format!("{}:{}", link.restaurant_id, link.sub_kitchen_id);
        tables.check(EntityKind::Association, key)?;
        if !tables.restaurants.contains_key(&link.restaurant_id) {
            return Err(StoreError::Rejected(format!(
                "association references missing restaurant {}",
                link.restaurant_id
            )));
        }
        if !tables.sub_kitchens.contains_key(&link.sub_kitchen_id) {
            return Err(StoreError::Rejected(format!(
                "association references missing subkitchen {}",
                link.sub_kitchen_id
            )));
        }
        tables
            .associations
            .insert((link.restaurant_id.clone(), link.sub_kitchen_id));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error sink
// ---------------------------------------------------------------------------

/// One structured line per record-level failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub entity: EntityKind,
    pub key: String,
    pub error: String,
}

/// Durable observability boundary for record-level failures. Recording never
/// raises into the pipeline and nothing here retries anything.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn record(&self, entity: EntityKind, key: &str, detail: &str);
}

/// Append-only JSON-lines file sink.
#[derive(Debug, Clone)]
pub struct JsonlErrorSink {
    path: PathBuf,
}

impl JsonlErrorSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: &ErrorLogEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[async_trait]
impl ErrorSink for JsonlErrorSink {
    async fn record(&self, entity: EntityKind, key: &str, detail: &str) {
        let entry = ErrorLogEntry {
            timestamp: Utc::now(),
            entity,
            key: key.to_string(),
            error: detail.to_string(),
        };
        if let Err(err) = self.append(&entry).await {
            error!(
                path = %self.path.display(),
                entity = %entity,
                key,
                %err,
                "failed to append to the error log"
            );
        }
    }
}

/// In-memory sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    entries: Mutex<Vec<ErrorLogEntry>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ErrorLogEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl ErrorSink for MemoryErrorSink {
    async fn record(&self, entity: EntityKind, key: &str, detail: &str) {
        self.entries.lock().await.push(ErrorLogEntry {
            timestamp: Utc::now(),
            entity,
            key: key.to_string(),
            error: detail.to_string(),
        });
    }
}
