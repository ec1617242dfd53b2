//! src/services/catalog.rs
//!
//! Capabilities the orchestrator needs from the management database, and
//! `SqliteCatalog`, which implements all of them on top of SQLite.
//!
//! The traits are deliberately narrow: the orchestrator only reads the
//! template catalog (apart from size backfill) and owns every write to the
//! association and zone-association tables.

use crate::{
    errors::{OrchestratorError, OrchestratorResult},
    models::{
        association::{
            DownloadStatus, InstallInfo, NewAssociation, ObjectState, TemplateDataStore,
        },
        store::{DataStore, StoreRole},
        template::{HypervisorType, VmTemplate},
        zone::TemplateZone,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};

const TEMPLATE_COLUMNS: &str = "id, unique_name, name, account_id, is_public, featured, url, \
     hypervisor_type, template_type, size";

const ASSOCIATION_COLUMNS: &str = "id, store_id, template_id, state, download_pct, \
     download_state, install_path, size, physical_size, error_str, url, store_role, last_updated";

const STORE_COLUMNS: &str = "id, uuid, name, zone_id, role, url";

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Read access to the template catalog.
#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn find_template(&self, id: i64) -> OrchestratorResult<Option<VmTemplate>>;
    async fn list_all(&self) -> OrchestratorResult<Vec<VmTemplate>>;
    /// Templates registered to `zone_id`.
    async fn list_all_in_zone(&self, zone_id: i64) -> OrchestratorResult<Vec<VmTemplate>>;
    async fn list_system_vm_templates(&self) -> OrchestratorResult<Vec<VmTemplate>>;
    async fn list_default_builtin_templates(&self) -> OrchestratorResult<Vec<VmTemplate>>;
    /// Backfill the real byte size once it is known.
    async fn update_size(&self, id: i64, size: i64) -> OrchestratorResult<()>;
}

/// Field changes written together with a state compare-and-set.
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
    pub download_state: Option<DownloadStatus>,
    pub download_pct: Option<i64>,
    pub install: Option<InstallInfo>,
    pub error_str: Option<String>,
}

/// Persistence of association rows.
#[async_trait]
pub trait AssociationStore: Send + Sync {
    async fn find(
        &self,
        store_id: i64,
        template_id: i64,
    ) -> OrchestratorResult<Option<TemplateDataStore>>;

    async fn list_by_store(&self, store_id: i64) -> OrchestratorResult<Vec<TemplateDataStore>>;

    /// Return the row for the pair, inserting an `Allocated` one if absent.
    async fn allocate(
        &self,
        store: &DataStore,
        template: &VmTemplate,
    ) -> OrchestratorResult<TemplateDataStore>;

    /// Insert a row with explicit contents. An existing row wins and is returned unchanged.
    async fn persist(&self, row: NewAssociation) -> OrchestratorResult<TemplateDataStore>;

    /// Move the row from `expected` to `next`, applying `update`.
    ///
    /// Returns false when the row is no longer in `expected`.
    async fn compare_and_set(
        &self,
        store_id: i64,
        template_id: i64,
        expected: ObjectState,
        next: ObjectState,
        update: &StateUpdate,
    ) -> OrchestratorResult<bool>;

    /// Delete the row if it is still in `expected`. Returns false otherwise.
    async fn delete_if_state(
        &self,
        store_id: i64,
        template_id: i64,
        expected: ObjectState,
    ) -> OrchestratorResult<bool>;

    /// Write the download bookkeeping columns of `row`. Never touches `state`.
    ///
    /// Applies only while the row is still in `row.state`; returns false when
    /// a transition moved it since `row` was read.
    async fn update_download(&self, row: &TemplateDataStore) -> OrchestratorResult<bool>;
}

/// Zones and template availability per zone.
#[async_trait]
pub trait ZoneDirectory: Send + Sync {
    async fn list_zone_ids(&self) -> OrchestratorResult<Vec<i64>>;

    async fn find_zone_template(
        &self,
        zone_id: i64,
        template_id: i64,
    ) -> OrchestratorResult<Option<TemplateZone>>;

    /// Insert the pair or refresh its `last_updated`.
    async fn upsert_zone_template(&self, zone_id: i64, template_id: i64)
    -> OrchestratorResult<()>;

    /// Hypervisors with clusters in `zone_id`; every zone when `None`.
    async fn available_hypervisors(
        &self,
        zone_id: Option<i64>,
    ) -> OrchestratorResult<Vec<HypervisorType>>;
}

#[async_trait]
pub trait DataStoreDirectory: Send + Sync {
    async fn find_store(&self, id: i64) -> OrchestratorResult<Option<DataStore>>;

    /// Image stores serving `zone_id` (zone-scoped plus region-wide), or
    /// every image store when `None`.
    async fn list_image_stores(&self, zone_id: Option<i64>) -> OrchestratorResult<Vec<DataStore>>;
}

/// Running workloads that may still reference an object on a store.
#[async_trait]
pub trait WorkloadIndex: Send + Sync {
    async fn count_vms_using(&self, template_id: i64) -> OrchestratorResult<i64>;
}

/// Secondary-storage accounting.
#[async_trait]
pub trait ResourceLimitService: Send + Sync {
    /// Fails with `ResourceLimitExceeded` if `delta` more bytes would break the account's limit.
    async fn check_resource_limit(&self, account_id: i64, delta: i64) -> OrchestratorResult<()>;

    /// Recompute the account's usage from the rows on image stores.
    async fn recalculate_resource_count(&self, account_id: i64) -> OrchestratorResult<i64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertType {
    ResourceLimitExceeded,
}

pub trait AlertManager: Send + Sync {
    fn send_alert(&self, kind: AlertType, zone_id: Option<i64>, subject: &str);
}

/// Alerts land in the log stream.
#[derive(Clone, Debug, Default)]
pub struct LogAlertManager;

impl AlertManager for LogAlertManager {
    fn send_alert(&self, kind: AlertType, zone_id: Option<i64>, subject: &str) {
        warn!(alert = ?kind, zone = ?zone_id, "{}", subject);
    }
}

/// SQLite-backed implementation of every persistence capability.
#[derive(Clone)]
pub struct SqliteCatalog {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl SqliteCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> OrchestratorResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    async fn list_templates_where(
        &self,
        clause: &str,
        bind: Option<i64>,
    ) -> OrchestratorResult<Vec<VmTemplate>> {
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM vm_templates WHERE removed = 0 {clause} ORDER BY id"
        );
        let mut query = sqlx::query_as::<_, VmTemplate>(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        Ok(query.fetch_all(&*self.db).await?)
    }
}

#[async_trait]
impl TemplateCatalog for SqliteCatalog {
    async fn find_template(&self, id: i64) -> OrchestratorResult<Option<VmTemplate>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM vm_templates WHERE id = ? AND removed = 0");
        Ok(sqlx::query_as::<_, VmTemplate>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?)
    }

    async fn list_all(&self) -> OrchestratorResult<Vec<VmTemplate>> {
        self.list_templates_where("", None).await
    }

    async fn list_all_in_zone(&self, zone_id: i64) -> OrchestratorResult<Vec<VmTemplate>> {
        self.list_templates_where(
            "AND id IN (SELECT template_id FROM template_zone_ref WHERE zone_id = ?)",
            Some(zone_id),
        )
        .await
    }

    async fn list_system_vm_templates(&self) -> OrchestratorResult<Vec<VmTemplate>> {
        self.list_templates_where("AND template_type = 'SYSTEM'", None)
            .await
    }

    async fn list_default_builtin_templates(&self) -> OrchestratorResult<Vec<VmTemplate>> {
        self.list_templates_where("AND template_type = 'BUILTIN'", None)
            .await
    }

    async fn update_size(&self, id: i64, size: i64) -> OrchestratorResult<()> {
        let result = sqlx::query("UPDATE vm_templates SET size = ? WHERE id = ?")
            .bind(size)
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::TemplateNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl AssociationStore for SqliteCatalog {
    async fn find(
        &self,
        store_id: i64,
        template_id: i64,
    ) -> OrchestratorResult<Option<TemplateDataStore>> {
        let sql = format!(
            "SELECT {ASSOCIATION_COLUMNS} FROM template_store_ref
             WHERE store_id = ? AND template_id = ?"
        );
        Ok(sqlx::query_as::<_, TemplateDataStore>(&sql)
            .bind(store_id)
            .bind(template_id)
            .fetch_optional(&*self.db)
            .await?)
    }

    async fn list_by_store(&self, store_id: i64) -> OrchestratorResult<Vec<TemplateDataStore>> {
        let sql = format!(
            "SELECT {ASSOCIATION_COLUMNS} FROM template_store_ref
             WHERE store_id = ? ORDER BY template_id"
        );
        Ok(sqlx::query_as::<_, TemplateDataStore>(&sql)
            .bind(store_id)
            .fetch_all(&*self.db)
            .await?)
    }

    async fn allocate(
        &self,
        store: &DataStore,
        template: &VmTemplate,
    ) -> OrchestratorResult<TemplateDataStore> {
        self.persist(NewAssociation {
            store_id: store.id,
            template_id: template.id,
            state: ObjectState::Allocated,
            download_pct: 0,
            download_state: DownloadStatus::NotDownloaded,
            install: None,
            error_str: None,
            url: template.url.clone(),
            store_role: store.role,
        })
        .await
    }

    async fn persist(&self, row: NewAssociation) -> OrchestratorResult<TemplateDataStore> {
        let install = row.install.unwrap_or_default();
        let install_path = (!install.install_path.is_empty()).then_some(install.install_path);

        // Losing an insert race is fine: the winner's row is read back below.
        sqlx::query(
            r#"
            INSERT INTO template_store_ref (
                store_id, template_id, state, download_pct, download_state,
                install_path, size, physical_size, error_str, url, store_role, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(store_id, template_id) DO NOTHING
            "#,
        )
        .bind(row.store_id)
        .bind(row.template_id)
        .bind(row.state)
        .bind(row.download_pct)
        .bind(row.download_state)
        .bind(install_path)
        .bind(install.size)
        .bind(install.physical_size)
        .bind(row.error_str)
        .bind(row.url)
        .bind(row.store_role)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        self.find(row.store_id, row.template_id)
            .await?
            .ok_or(OrchestratorError::AssociationNotFound {
                store: row.store_id,
                template: row.template_id,
            })
    }

    async fn compare_and_set(
        &self,
        store_id: i64,
        template_id: i64,
        expected: ObjectState,
        next: ObjectState,
        update: &StateUpdate,
    ) -> OrchestratorResult<bool> {
        let install = update.install.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE template_store_ref SET
                state = ?,
                download_state = COALESCE(?, download_state),
                download_pct = COALESCE(?, download_pct),
                install_path = COALESCE(?, install_path),
                size = COALESCE(?, size),
                physical_size = COALESCE(?, physical_size),
                error_str = COALESCE(?, error_str),
                last_updated = ?
            WHERE store_id = ? AND template_id = ? AND state = ?
            "#,
        )
        .bind(next)
        .bind(update.download_state)
        .bind(update.download_pct)
        .bind(install.map(|i| i.install_path.clone()))
        .bind(install.map(|i| i.size))
        .bind(install.map(|i| i.physical_size))
        .bind(update.error_str.clone())
        .bind(Utc::now())
        .bind(store_id)
        .bind(template_id)
        .bind(expected)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_state(
        &self,
        store_id: i64,
        template_id: i64,
        expected: ObjectState,
    ) -> OrchestratorResult<bool> {
        let result = sqlx::query(
            "DELETE FROM template_store_ref WHERE store_id = ? AND template_id = ? AND state = ?",
        )
        .bind(store_id)
        .bind(template_id)
        .bind(expected)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_download(&self, row: &TemplateDataStore) -> OrchestratorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE template_store_ref SET
                download_pct = ?, download_state = ?, install_path = ?,
                size = ?, physical_size = ?, error_str = ?, last_updated = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(row.download_pct)
        .bind(row.download_state)
        .bind(&row.install_path)
        .bind(row.size)
        .bind(row.physical_size)
        .bind(&row.error_str)
        .bind(row.last_updated)
        .bind(row.id)
        .bind(row.state)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ZoneDirectory for SqliteCatalog {
    async fn list_zone_ids(&self) -> OrchestratorResult<Vec<i64>> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT id FROM zones ORDER BY id")
                .fetch_all(&*self.db)
                .await?,
        )
    }

    async fn find_zone_template(
        &self,
        zone_id: i64,
        template_id: i64,
    ) -> OrchestratorResult<Option<TemplateZone>> {
        Ok(sqlx::query_as::<_, TemplateZone>(
            "SELECT id, zone_id, template_id, created, last_updated
             FROM template_zone_ref WHERE zone_id = ? AND template_id = ?",
        )
        .bind(zone_id)
        .bind(template_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    async fn upsert_zone_template(
        &self,
        zone_id: i64,
        template_id: i64,
    ) -> OrchestratorResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO template_zone_ref (zone_id, template_id, created, last_updated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(zone_id, template_id) DO UPDATE SET
                last_updated = excluded.last_updated
            "#,
        )
        .bind(zone_id)
        .bind(template_id)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn available_hypervisors(
        &self,
        zone_id: Option<i64>,
    ) -> OrchestratorResult<Vec<HypervisorType>> {
        let rows = match zone_id {
            Some(zone) => {
                sqlx::query_scalar::<_, HypervisorType>(
                    "SELECT DISTINCT hypervisor_type FROM clusters WHERE zone_id = ?",
                )
                .bind(zone)
                .fetch_all(&*self.db)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, HypervisorType>(
                    "SELECT DISTINCT hypervisor_type FROM clusters",
                )
                .fetch_all(&*self.db)
                .await?
            }
        };
        Ok(rows)
    }
}

#[async_trait]
impl DataStoreDirectory for SqliteCatalog {
    async fn find_store(&self, id: i64) -> OrchestratorResult<Option<DataStore>> {
        let sql = format!("SELECT {STORE_COLUMNS} FROM data_stores WHERE id = ?");
        Ok(sqlx::query_as::<_, DataStore>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?)
    }

    async fn list_image_stores(&self, zone_id: Option<i64>) -> OrchestratorResult<Vec<DataStore>> {
        let stores = match zone_id {
            Some(zone) => {
                let sql = format!(
                    "SELECT {STORE_COLUMNS} FROM data_stores
                     WHERE role = ? AND (zone_id = ? OR zone_id IS NULL) ORDER BY id"
                );
                sqlx::query_as::<_, DataStore>(&sql)
                    .bind(StoreRole::Image)
                    .bind(zone)
                    .fetch_all(&*self.db)
                    .await?
            }
            None => {
                let sql =
                    format!("SELECT {STORE_COLUMNS} FROM data_stores WHERE role = ? ORDER BY id");
                sqlx::query_as::<_, DataStore>(&sql)
                    .bind(StoreRole::Image)
                    .fetch_all(&*self.db)
                    .await?
            }
        };
        Ok(stores)
    }
}

#[async_trait]
impl WorkloadIndex for SqliteCatalog {
    async fn count_vms_using(&self, template_id: i64) -> OrchestratorResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM user_vms
             WHERE (template_id = ? OR iso_id = ?) AND state <> 'Expunged'",
        )
        .bind(template_id)
        .bind(template_id)
        .fetch_one(&*self.db)
        .await?)
    }
}

#[async_trait]
impl ResourceLimitService for SqliteCatalog {
    async fn check_resource_limit(&self, account_id: i64, delta: i64) -> OrchestratorResult<()> {
        let (limit, count) = sqlx::query_as::<_, (Option<i64>, i64)>(
            "SELECT secondary_storage_limit, secondary_storage_count FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(OrchestratorError::AccountNotFound(account_id))?;

        match limit {
            Some(limit) if count + delta > limit => Err(OrchestratorError::ResourceLimitExceeded {
                account: account_id,
                requested: count + delta,
                limit,
            }),
            _ => Ok(()),
        }
    }

    async fn recalculate_resource_count(&self, account_id: i64) -> OrchestratorResult<i64> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(t.size), 0) FROM vm_templates t
            WHERE t.account_id = ? AND t.removed = 0 AND EXISTS (
                SELECT 1 FROM template_store_ref r
                WHERE r.template_id = t.id AND r.store_role = ? AND r.download_state = ?
            )
            "#,
        )
        .bind(account_id)
        .bind(StoreRole::Image)
        .bind(DownloadStatus::Downloaded)
        .fetch_one(&*self.db)
        .await?;

        sqlx::query("UPDATE accounts SET secondary_storage_count = ? WHERE id = ?")
            .bind(total)
            .bind(account_id)
            .execute(&*self.db)
            .await?;

        Ok(total)
    }
}

/// Registrar-side inserts used to stage fixtures in tests.
#[cfg(test)]
impl SqliteCatalog {
    pub async fn in_memory() -> Self {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let catalog = Self::new(Arc::new(pool));
        catalog.migrate().await.unwrap();
        catalog
    }

    pub async fn add_zone(&self, id: i64, hypervisors: &[HypervisorType]) {
        sqlx::query("INSERT INTO zones (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(format!("zone-{id}"))
            .execute(&*self.db)
            .await
            .unwrap();
        for hv in hypervisors {
            sqlx::query("INSERT INTO clusters (zone_id, hypervisor_type) VALUES (?, ?)")
                .bind(id)
                .bind(*hv)
                .execute(&*self.db)
                .await
                .unwrap();
        }
    }

    pub async fn add_store(&self, store: &DataStore) {
        sqlx::query(
            "INSERT INTO data_stores (id, uuid, name, zone_id, role, url) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(store.id)
        .bind(store.uuid)
        .bind(&store.name)
        .bind(store.zone_id)
        .bind(store.role)
        .bind(&store.url)
        .execute(&*self.db)
        .await
        .unwrap();
    }

    pub async fn add_account(&self, id: i64, limit: Option<i64>) {
        sqlx::query("INSERT INTO accounts (id, secondary_storage_limit) VALUES (?, ?)")
            .bind(id)
            .bind(limit)
            .execute(&*self.db)
            .await
            .unwrap();
    }

    /// Register `template` and make it available to `zones`.
    pub async fn add_template(&self, template: &VmTemplate, zones: &[i64]) {
        sqlx::query(
            r#"
            INSERT INTO vm_templates (
                id, unique_name, name, account_id, is_public, featured, url,
                hypervisor_type, template_type, size
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(template.id)
        .bind(&template.unique_name)
        .bind(&template.name)
        .bind(template.account_id)
        .bind(template.is_public)
        .bind(template.featured)
        .bind(&template.url)
        .bind(template.hypervisor_type)
        .bind(template.template_type)
        .bind(template.size)
        .execute(&*self.db)
        .await
        .unwrap();
        for zone in zones {
            self.upsert_zone_template(*zone, template.id).await.unwrap();
        }
    }

    pub async fn add_vm(&self, template_id: Option<i64>, iso_id: Option<i64>) {
        sqlx::query("INSERT INTO user_vms (name, template_id, iso_id, state) VALUES (?, ?, ?, ?)")
            .bind("vm")
            .bind(template_id)
            .bind(iso_id)
            .bind("Running")
            .execute(&*self.db)
            .await
            .unwrap();
    }

    pub async fn zone_template_count(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM template_zone_ref")
            .fetch_one(&*self.db)
            .await
            .unwrap()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::models::template::TemplateType;
    use uuid::Uuid;

    pub fn image_store(id: i64, zone_id: Option<i64>, url: &str) -> DataStore {
        DataStore {
            id,
            uuid: Uuid::new_v4(),
            name: format!("store-{id}"),
            zone_id,
            role: StoreRole::Image,
            url: url.to_string(),
        }
    }

    pub fn template(id: i64, unique_name: &str) -> VmTemplate {
        VmTemplate {
            id,
            unique_name: unique_name.to_string(),
            name: unique_name.to_string(),
            account_id: 2,
            is_public: true,
            featured: false,
            url: Some(format!("file:///images/{unique_name}.qcow2")),
            hypervisor_type: HypervisorType::KVM,
            template_type: TemplateType::User,
            size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::models::template::TemplateType;

    async fn seeded() -> (SqliteCatalog, DataStore, VmTemplate) {
        let catalog = SqliteCatalog::in_memory().await;
        catalog.add_zone(1, &[HypervisorType::KVM]).await;
        let store = image_store(10, Some(1), "/tmp/store-10");
        catalog.add_store(&store).await;
        let tmpl = template(7, "tmpl-7");
        catalog.add_template(&tmpl, &[1]).await;
        (catalog, store, tmpl)
    }

    #[tokio::test]
    async fn allocate_is_insert_if_absent() {
        let (catalog, store, tmpl) = seeded().await;
        let first = catalog.allocate(&store, &tmpl).await.unwrap();
        assert_eq!(first.state, ObjectState::Allocated);
        assert_eq!(first.download_state, DownloadStatus::NotDownloaded);

        let second = catalog.allocate(&store, &tmpl).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(catalog.list_by_store(store.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_state() {
        let (catalog, store, tmpl) = seeded().await;
        catalog.allocate(&store, &tmpl).await.unwrap();

        let moved = catalog
            .compare_and_set(
                store.id,
                tmpl.id,
                ObjectState::Allocated,
                ObjectState::Creating,
                &StateUpdate::default(),
            )
            .await
            .unwrap();
        assert!(moved);

        let stale = catalog
            .compare_and_set(
                store.id,
                tmpl.id,
                ObjectState::Allocated,
                ObjectState::Creating,
                &StateUpdate::default(),
            )
            .await
            .unwrap();
        assert!(!stale);

        let update = StateUpdate {
            download_state: Some(DownloadStatus::Downloaded),
            download_pct: Some(100),
            install: Some(InstallInfo {
                install_path: "template/tmpl/2/7/tmpl-7".into(),
                size: 42,
                physical_size: 40,
            }),
            error_str: None,
        };
        assert!(
            catalog
                .compare_and_set(
                    store.id,
                    tmpl.id,
                    ObjectState::Creating,
                    ObjectState::Ready,
                    &update
                )
                .await
                .unwrap()
        );
        let row = catalog.find(store.id, tmpl.id).await.unwrap().unwrap();
        assert_eq!(row.state, ObjectState::Ready);
        assert_eq!(row.size, 42);
        assert_eq!(row.install_path.as_deref(), Some("template/tmpl/2/7/tmpl-7"));
    }

    #[tokio::test]
    async fn download_update_skips_row_moved_by_transition() {
        let (catalog, store, tmpl) = seeded().await;
        catalog.allocate(&store, &tmpl).await.unwrap();
        catalog
            .compare_and_set(
                store.id,
                tmpl.id,
                ObjectState::Allocated,
                ObjectState::Creating,
                &StateUpdate::default(),
            )
            .await
            .unwrap();
        let snapshot = catalog.find(store.id, tmpl.id).await.unwrap().unwrap();

        let update = StateUpdate {
            download_state: Some(DownloadStatus::Downloaded),
            download_pct: Some(100),
            install: Some(InstallInfo {
                install_path: "template/tmpl/2/7/tmpl-7".into(),
                size: 42,
                physical_size: 42,
            }),
            error_str: Some(String::new()),
        };
        catalog
            .compare_and_set(
                store.id,
                tmpl.id,
                ObjectState::Creating,
                ObjectState::Ready,
                &update,
            )
            .await
            .unwrap();

        let mut stale = snapshot.clone();
        stale.download_state = DownloadStatus::DownloadError;
        stale.error_str = Some("corrupted".into());
        assert!(!catalog.update_download(&stale).await.unwrap());

        let row = catalog.find(store.id, tmpl.id).await.unwrap().unwrap();
        assert_eq!(row.state, ObjectState::Ready);
        assert_eq!(row.download_state, DownloadStatus::Downloaded);
        assert_eq!(row.install_path.as_deref(), Some("template/tmpl/2/7/tmpl-7"));
        assert_eq!(row.size, 42);

        let mut fresh = row.clone();
        fresh.download_pct = 99;
        assert!(catalog.update_download(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_state_only_matches_expected() {
        let (catalog, store, tmpl) = seeded().await;
        catalog.allocate(&store, &tmpl).await.unwrap();
        assert!(
            !catalog
                .delete_if_state(store.id, tmpl.id, ObjectState::Failed)
                .await
                .unwrap()
        );
        assert!(
            catalog
                .delete_if_state(store.id, tmpl.id, ObjectState::Allocated)
                .await
                .unwrap()
        );
        assert!(catalog.find(store.id, tmpl.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zone_association_is_idempotent() {
        let (catalog, _, tmpl) = seeded().await;
        let before = catalog.find_zone_template(1, tmpl.id).await.unwrap().unwrap();
        catalog.upsert_zone_template(1, tmpl.id).await.unwrap();
        let after = catalog.find_zone_template(1, tmpl.id).await.unwrap().unwrap();
        assert_eq!(before.id, after.id);
        assert!(after.last_updated >= before.last_updated);
        assert_eq!(catalog.zone_template_count().await, 1);
    }

    #[tokio::test]
    async fn lists_by_template_type_and_zone() {
        let (catalog, _, _) = seeded().await;
        let mut sys = template(1, "routing-1");
        sys.template_type = TemplateType::System;
        catalog.add_template(&sys, &[]).await;

        assert_eq!(catalog.list_all().await.unwrap().len(), 2);
        assert_eq!(catalog.list_all_in_zone(1).await.unwrap().len(), 1);
        let system = catalog.list_system_vm_templates().await.unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].unique_name, "routing-1");
        assert!(catalog.list_default_builtin_templates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_stores_include_region_wide() {
        let (catalog, _, _) = seeded().await;
        catalog.add_zone(2, &[]).await;
        catalog.add_store(&image_store(11, None, "/tmp/region")).await;
        catalog.add_store(&image_store(12, Some(2), "/tmp/z2")).await;

        let zone1: Vec<i64> = catalog
            .list_image_stores(Some(1))
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(zone1, vec![10, 11]);
        assert_eq!(catalog.list_image_stores(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn resource_limit_check_and_recalculate() {
        let (catalog, store, tmpl) = seeded().await;
        catalog.add_account(2, Some(100)).await;
        assert!(catalog.check_resource_limit(2, 50).await.is_ok());
        assert!(matches!(
            catalog.check_resource_limit(2, 150).await,
            Err(OrchestratorError::ResourceLimitExceeded { account: 2, .. })
        ));

        catalog.update_size(tmpl.id, 80).await.unwrap();
        catalog
            .persist(NewAssociation {
                store_id: store.id,
                template_id: tmpl.id,
                state: ObjectState::Ready,
                download_pct: 100,
                download_state: DownloadStatus::Downloaded,
                install: None,
                error_str: None,
                url: None,
                store_role: StoreRole::Image,
            })
            .await
            .unwrap();
        assert_eq!(catalog.recalculate_resource_count(2).await.unwrap(), 80);
        assert!(catalog.check_resource_limit(2, 30).await.is_err());
    }

    #[tokio::test]
    async fn workloads_reference_templates_or_isos() {
        let (catalog, _, _) = seeded().await;
        catalog.add_vm(Some(7), None).await;
        catalog.add_vm(None, Some(9)).await;
        assert_eq!(catalog.count_vms_using(7).await.unwrap(), 1);
        assert_eq!(catalog.count_vms_using(9).await.unwrap(), 1);
        assert_eq!(catalog.count_vms_using(3).await.unwrap(), 0);
    }
}
