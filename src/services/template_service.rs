//! src/services/template_service.rs
//!
//! TemplateService: drives templates through their lifecycle on a store.
//!
//! Every operation that talks to an endpoint follows the same shape:
//! apply the "requested" event, hand the work to the data motion layer with
//! an `OpContext`, and when the continuation fires apply the success or
//! failure event before completing the caller's continuation and/or future.
//! The reconciliation sweep lives in `template_sync`.

use crate::{
    errors::{OrchestratorError, OrchestratorResult},
    models::{
        association::{
            DownloadStatus, InstallInfo, NewAssociation, ObjectState, TemplateDataStore,
        },
        data_object::{DataObject, SnapshotInfo, TemplateOnStore, VolumeInfo},
        store::DataStore,
        template::{HypervisorType, VmTemplate},
    },
    services::{
        async_call::{
            AsyncCallFuture, AsyncCompletionCallback, OpContext, async_call_future, settle,
        },
        catalog::{
            AlertManager, AssociationStore, DataStoreDirectory, ResourceLimitService,
            SqliteCatalog, StateUpdate, TemplateCatalog, WorkloadIndex, ZoneDirectory,
        },
        data_motion::{CommandResult, DataMotionService},
        endpoint::{Answer, AnswerPayload, EndpointGateway},
        state_machine::{self, Event, SideEffect},
    },
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory pre-seeded system VM templates are expected under.
pub const DEFAULT_SYSTEM_VM_TEMPLATE_PATH: &str = "template/tmpl/1/";

const COMPLETION_PANICKED: &str = "internal error while recording the operation outcome";

/// Outcome delivered to callers of every asynchronous operation.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TemplateApiResult {
    pub template_id: i64,
    pub store_id: i64,
    /// The association row after the operation, when one still exists.
    pub association: Option<TemplateDataStore>,
    /// Failure message; `None` on success.
    pub error: Option<String>,
}

impl TemplateApiResult {
    fn success(object: &TemplateOnStore, association: Option<TemplateDataStore>) -> Self {
        Self {
            template_id: object.template.id,
            store_id: object.store.id,
            association,
            error: None,
        }
    }

    fn failure(object: &TemplateOnStore, error: impl Into<String>) -> Self {
        Self {
            template_id: object.template.id,
            store_id: object.store.id,
            association: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

type TemplateOpContext = OpContext<TemplateOnStore, TemplateApiResult>;

/// Extra data written alongside a transition.
#[derive(Clone, Debug)]
enum EventDetail {
    None,
    Installed(Option<InstallInfo>),
    Error(String),
}

/// Columns to write for a transition, derived from its side effect.
fn state_update(from: ObjectState, effect: SideEffect, detail: EventDetail) -> StateUpdate {
    match effect {
        SideEffect::EnsureRow => StateUpdate {
            download_state: Some(DownloadStatus::DownloadInProgress),
            download_pct: Some(0),
            ..Default::default()
        },
        SideEffect::RecordInstall => StateUpdate {
            download_state: Some(DownloadStatus::Downloaded),
            download_pct: Some(100),
            install: match detail {
                EventDetail::Installed(info) => info,
                _ => None,
            },
            error_str: Some(String::new()),
        },
        SideEffect::RecordError => StateUpdate {
            // A failed destroy leaves the bytes where they were.
            download_state: (from == ObjectState::Creating)
                .then_some(DownloadStatus::DownloadError),
            error_str: Some(match detail {
                EventDetail::Error(msg) => msg,
                _ => "operation failed".to_string(),
            }),
            ..Default::default()
        },
        SideEffect::RemoveRow | SideEffect::Nothing => StateUpdate::default(),
    }
}

fn installed(answer: &Answer) -> Option<InstallInfo> {
    match &answer.payload {
        AnswerPayload::Installed(info) => Some(info.clone()),
        _ => None,
    }
}

/// Everything the orchestrator talks to, passed in explicitly.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn TemplateCatalog>,
    pub associations: Arc<dyn AssociationStore>,
    pub zones: Arc<dyn ZoneDirectory>,
    pub stores: Arc<dyn DataStoreDirectory>,
    pub workloads: Arc<dyn WorkloadIndex>,
    pub limits: Arc<dyn ResourceLimitService>,
    pub alerts: Arc<dyn AlertManager>,
    pub gateway: Arc<dyn EndpointGateway>,
    pub motion: Arc<dyn DataMotionService>,
}

impl Collaborators {
    /// Wire every persistence capability to one SQLite catalog.
    pub fn with_sqlite(
        catalog: SqliteCatalog,
        alerts: Arc<dyn AlertManager>,
        gateway: Arc<dyn EndpointGateway>,
        motion: Arc<dyn DataMotionService>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        Self {
            catalog: catalog.clone(),
            associations: catalog.clone(),
            zones: catalog.clone(),
            stores: catalog.clone(),
            workloads: catalog.clone(),
            limits: catalog,
            alerts,
            gateway,
            motion,
        }
    }
}

#[derive(Clone)]
pub struct TemplateService {
    pub(crate) deps: Collaborators,
}

impl TemplateService {
    pub fn new(deps: Collaborators) -> Self {
        Self { deps }
    }

    pub async fn find_store(&self, store_id: i64) -> OrchestratorResult<DataStore> {
        self.deps
            .stores
            .find_store(store_id)
            .await?
            .ok_or(OrchestratorError::StoreNotFound(store_id))
    }

    /// Load a template bound to a store, including its install path there if any.
    pub async fn template_on_store(
        &self,
        template_id: i64,
        store_id: i64,
    ) -> OrchestratorResult<TemplateOnStore> {
        let template = self
            .deps
            .catalog
            .find_template(template_id)
            .await?
            .ok_or(OrchestratorError::TemplateNotFound(template_id))?;
        let store = self.find_store(store_id).await?;
        let row = self.deps.associations.find(store_id, template_id).await?;

        let mut object = TemplateOnStore::new(template, store);
        object.install_path = row.and_then(|r| r.install_path);
        Ok(object)
    }

    /// Association rows on a store.
    pub async fn list_associations(
        &self,
        store_id: i64,
    ) -> OrchestratorResult<Vec<TemplateDataStore>> {
        let store = self.find_store(store_id).await?;
        self.deps.associations.list_by_store(store.id).await
    }

    /// Associations on image stores with a remote operation outstanding.
    pub async fn count_in_flight(&self) -> OrchestratorResult<usize> {
        let mut count = 0;
        for store in self.deps.stores.list_image_stores(None).await? {
            count += self
                .deps
                .associations
                .list_by_store(store.id)
                .await?
                .iter()
                .filter(|row| state_machine::is_in_flight(row.state))
                .count();
        }
        Ok(count)
    }

    /// Make `template_id` available in `zone_id`, or in every zone when the
    /// store it landed on is region-wide.
    pub async fn associate_template_to_zone(
        &self,
        template_id: i64,
        zone_id: Option<i64>,
    ) -> OrchestratorResult<()> {
        let zones = match zone_id {
            Some(zone) => vec![zone],
            None => self.deps.zones.list_zone_ids().await?,
        };
        for zone in zones {
            if self.deps.zones.find_zone_template(zone, template_id).await?.is_none() {
                debug!("template {} now available in zone {}", template_id, zone);
            }
            self.deps.zones.upsert_zone_template(zone, template_id).await?;
        }
        Ok(())
    }

    /// Apply `event` to the association of `object`, persisting the result
    /// with a compare-and-set against the state it was read in.
    ///
    /// A missing row reads as `Allocated`; the create event allocates it.
    /// Returns the row afterwards, or `None` once it has been removed.
    async fn process_event(
        &self,
        object: &TemplateOnStore,
        event: Event,
        detail: EventDetail,
    ) -> OrchestratorResult<Option<TemplateDataStore>> {
        let (store_id, template_id) = (object.store.id, object.template.id);
        let current = self
            .deps
            .associations
            .find(store_id, template_id)
            .await?
            .map(|row| row.state)
            .unwrap_or(ObjectState::Allocated);

        let transition = state_machine::transition(current, event)?;
        if transition.effect == SideEffect::EnsureRow {
            self.deps
                .associations
                .allocate(&object.store, &object.template)
                .await?;
        }

        let applied = match transition.to {
            Some(next) => {
                let update = state_update(transition.from, transition.effect, detail);
                self.deps
                    .associations
                    .compare_and_set(store_id, template_id, current, next, &update)
                    .await?
            }
            None => {
                self.deps
                    .associations
                    .delete_if_state(store_id, template_id, current)
                    .await?
            }
        };

        if !applied {
            // Lost the race: report against whatever is persisted now.
            let state = self
                .deps
                .associations
                .find(store_id, template_id)
                .await?
                .map(|row| row.state)
                .ok_or(OrchestratorError::AssociationNotFound {
                    store: store_id,
                    template: template_id,
                })?;
            return Err(OrchestratorError::IllegalStateTransition { state, event });
        }

        debug!(
            "template {} on store {}: {:?} moved {} to {:?}",
            template_id, store_id, event, current, transition.to
        );
        match transition.to {
            Some(_) => self.deps.associations.find(store_id, template_id).await,
            None => Ok(None),
        }
    }

    async fn backfill_size(&self, template: &VmTemplate, installed: Option<&InstallInfo>) {
        let Some(info) = installed else {
            return;
        };
        if info.size <= 0 || info.size == template.size {
            return;
        }
        if let Err(err) = self.deps.catalog.update_size(template.id, info.size).await {
            warn!("failed to record size of template {}: {}", template.id, err);
        }
    }

    /// Start creating `object` on its store.
    ///
    /// The outcome is reported to `callback` when given. If the create cannot
    /// be requested (an operation is already in flight, or the row is in a
    /// state that does not allow it) the callback fires immediately with the
    /// rejection and nothing is sent to the endpoint.
    pub async fn create_template_async(
        &self,
        object: TemplateOnStore,
        callback: Option<AsyncCompletionCallback<TemplateApiResult>>,
    ) {
        if let Err(err) = self
            .process_event(&object, Event::CreateOnlyRequested, EventDetail::None)
            .await
        {
            warn!(
                "cannot create template {} on store {}: {}",
                object.template.unique_name, object.store.id, err
            );
            if let Some(callback) = callback {
                callback
                    .complete(TemplateApiResult::failure(&object, err.to_string()))
                    .await;
            }
            return;
        }

        let context = TemplateOpContext::new(object.clone(), callback, None);
        let service = self.clone();
        self.deps.motion.create_async(
            object,
            AsyncCompletionCallback::new(move |result| async move {
                service.create_template_callback(result, context).await
            }),
        );
    }

    async fn create_template_callback(&self, result: CommandResult, context: TemplateOpContext) {
        let object = context.subject();
        let api_result = settle(self.create_outcome(object, result), || {
            TemplateApiResult::failure(object, COMPLETION_PANICKED)
        })
        .await;
        context.complete(api_result).await;
    }

    async fn create_outcome(
        &self,
        object: &TemplateOnStore,
        result: CommandResult,
    ) -> TemplateApiResult {
        match result {
            Err(err) => {
                let msg = err.to_string();
                warn!(
                    "failed to create template {} on store {}: {}",
                    object.template.unique_name, object.store.id, msg
                );
                match self
                    .process_event(object, Event::OperationFailed, EventDetail::Error(msg.clone()))
                    .await
                {
                    Ok(_) => TemplateApiResult::failure(object, msg),
                    Err(err) => TemplateApiResult::failure(object, format!("{msg}; {err}")),
                }
            }
            Ok(answer) => {
                let installed = installed(&answer);
                match self
                    .process_event(
                        object,
                        Event::OperationSucceeded,
                        EventDetail::Installed(installed.clone()),
                    )
                    .await
                {
                    Ok(row) => {
                        self.backfill_size(&object.template, installed.as_ref()).await;
                        info!(
                            "template {} is ready on store {}",
                            object.template.unique_name, object.store.id
                        );
                        TemplateApiResult::success(object, row)
                    }
                    Err(err) => TemplateApiResult::failure(object, err.to_string()),
                }
            }
        }
    }

    /// Copy `source` into `dest`. Shared by every copy-shaped entry point.
    ///
    /// On failure the destination row is removed, so a failed copy never
    /// leaves a half-created template behind.
    async fn copy_async(
        &self,
        source: DataObject,
        dest: TemplateOnStore,
    ) -> AsyncCallFuture<TemplateApiResult> {
        if let Err(err) = self
            .process_event(&dest, Event::CreateOnlyRequested, EventDetail::None)
            .await
        {
            warn!(
                "cannot copy {} to store {}: {}",
                source.describe(),
                dest.store.id,
                err
            );
            return AsyncCallFuture::completed(TemplateApiResult::failure(&dest, err.to_string()));
        }

        let (completer, future) = async_call_future();
        let context = TemplateOpContext::new(dest.clone(), None, Some(completer));
        let service = self.clone();
        self.deps.motion.copy_async(
            source,
            dest,
            AsyncCompletionCallback::new(move |result| async move {
                service.copy_template_callback(result, context).await
            }),
        );
        future
    }

    async fn copy_template_callback(&self, result: CommandResult, context: TemplateOpContext) {
        let object = context.subject();
        let api_result = settle(self.copy_outcome(object, result), || {
            TemplateApiResult::failure(object, COMPLETION_PANICKED)
        })
        .await;
        context.complete(api_result).await;
    }

    async fn copy_outcome(
        &self,
        object: &TemplateOnStore,
        result: CommandResult,
    ) -> TemplateApiResult {
        let outcome = match result {
            Err(err) => {
                let msg = err.to_string();
                let discarded = self.discard_failed_copy(object, &msg).await;
                discarded.map(|_| TemplateApiResult::failure(object, msg))
            }
            Ok(answer) => {
                let installed = installed(&answer);
                let row = self
                    .process_event(
                        object,
                        Event::OperationSucceeded,
                        EventDetail::Installed(installed.clone()),
                    )
                    .await;
                if row.is_ok() {
                    self.backfill_size(&object.template, installed.as_ref()).await;
                }
                row.map(|row| TemplateApiResult::success(object, row))
            }
        };

        outcome.unwrap_or_else(|err| {
            debug!("failed to process copy template callback: {}", err);
            TemplateApiResult::failure(object, err.to_string())
        })
    }

    /// Fail the destination and drop its row.
    async fn discard_failed_copy(
        &self,
        object: &TemplateOnStore,
        msg: &str,
    ) -> OrchestratorResult<()> {
        warn!(
            "copy of template {} to store {} failed: {}",
            object.template.unique_name, object.store.id, msg
        );
        self.process_event(
            object,
            Event::OperationFailed,
            EventDetail::Error(msg.to_string()),
        )
        .await?;
        self.deps
            .associations
            .delete_if_state(object.store.id, object.template.id, ObjectState::Failed)
            .await?;
        Ok(())
    }

    pub async fn create_template_from_snapshot_async(
        &self,
        snapshot: SnapshotInfo,
        template: VmTemplate,
        store: DataStore,
    ) -> AsyncCallFuture<TemplateApiResult> {
        self.copy_async(
            DataObject::Snapshot(snapshot),
            TemplateOnStore::new(template, store),
        )
        .await
    }

    pub async fn create_template_from_volume_async(
        &self,
        volume: VolumeInfo,
        template: VmTemplate,
        store: DataStore,
    ) -> AsyncCallFuture<TemplateApiResult> {
        self.copy_async(
            DataObject::Volume(volume),
            TemplateOnStore::new(template, store),
        )
        .await
    }

    /// Copy an installed template to another image store.
    pub async fn copy_template(
        &self,
        source: TemplateOnStore,
        dest_store: DataStore,
    ) -> AsyncCallFuture<TemplateApiResult> {
        let dest = TemplateOnStore::new(source.template.clone(), dest_store);
        self.copy_async(DataObject::Template(source), dest).await
    }

    /// Stage an installed template onto a primary pool.
    pub async fn prepare_template_on_primary(
        &self,
        source: TemplateOnStore,
        pool: DataStore,
    ) -> AsyncCallFuture<TemplateApiResult> {
        let dest = TemplateOnStore::new(source.template.clone(), pool);
        self.copy_async(DataObject::Template(source), dest).await
    }

    /// Delete `object` from its store. Legal from `Ready` or `Failed`.
    pub async fn delete_template_async(
        &self,
        mut object: TemplateOnStore,
    ) -> AsyncCallFuture<TemplateApiResult> {
        match self
            .process_event(&object, Event::DestroyRequested, EventDetail::None)
            .await
        {
            Ok(row) => {
                if let Some(path) = row.and_then(|r| r.install_path) {
                    object.install_path = Some(path);
                }
            }
            Err(err) => {
                return AsyncCallFuture::completed(TemplateApiResult::failure(
                    &object,
                    err.to_string(),
                ));
            }
        }

        let (completer, future) = async_call_future();
        let context = TemplateOpContext::new(object.clone(), None, Some(completer));
        let service = self.clone();
        self.deps.motion.delete_async(
            object,
            AsyncCompletionCallback::new(move |result| async move {
                service.delete_template_callback(result, context).await
            }),
        );
        future
    }

    async fn delete_template_callback(&self, result: CommandResult, context: TemplateOpContext) {
        let object = context.subject();
        let api_result = settle(self.delete_outcome(object, result), || {
            TemplateApiResult::failure(object, COMPLETION_PANICKED)
        })
        .await;
        context.complete(api_result).await;
    }

    async fn delete_outcome(
        &self,
        object: &TemplateOnStore,
        result: CommandResult,
    ) -> TemplateApiResult {
        let (event, detail, error) = match result {
            Ok(_) => (Event::OperationSucceeded, EventDetail::None, None),
            Err(err) => {
                let msg = err.to_string();
                (Event::OperationFailed, EventDetail::Error(msg.clone()), Some(msg))
            }
        };

        match (self.process_event(object, event, detail).await, error) {
            (Ok(row), None) => TemplateApiResult::success(object, row),
            (Ok(row), Some(msg)) => TemplateApiResult {
                association: row,
                ..TemplateApiResult::failure(object, msg)
            },
            (Err(err), _) => TemplateApiResult::failure(object, err.to_string()),
        }
    }

    /// Whether a bootstrap download should be requested for the pair.
    async fn needs_download(
        &self,
        store: &DataStore,
        template: &VmTemplate,
    ) -> OrchestratorResult<bool> {
        let state = self
            .deps
            .associations
            .find(store.id, template.id)
            .await?
            .map(|row| row.state);
        match state {
            None | Some(ObjectState::Allocated) => Ok(true),
            Some(state) if state_machine::is_in_flight(state) => {
                debug!(
                    "template {} already {} on store {}",
                    template.unique_name, state, store.id
                );
                Ok(false)
            }
            Some(_) => Ok(false),
        }
    }

    /// Request every system VM template not yet on `store`.
    pub async fn download_bootstrap_sys_template(
        &self,
        store: &DataStore,
    ) -> OrchestratorResult<usize> {
        let mut requested = 0;
        for template in self.deps.catalog.list_system_vm_templates().await? {
            if self.needs_download(store, &template).await? {
                info!(
                    "downloading bootstrap template {} to store {}",
                    template.unique_name, store.id
                );
                self.create_template_async(TemplateOnStore::new(template, store.clone()), None)
                    .await;
                requested += 1;
            }
        }
        Ok(requested)
    }

    /// Request the system and built-in templates for `hypervisor` on every
    /// image store serving `zone_id`.
    pub async fn handle_sys_template_download(
        &self,
        hypervisor: HypervisorType,
        zone_id: i64,
    ) -> OrchestratorResult<usize> {
        let stores = self.deps.stores.list_image_stores(Some(zone_id)).await?;
        if stores.is_empty() {
            debug!("no image store in zone {}, skipping system templates", zone_id);
            return Ok(0);
        }

        let mut templates = self.deps.catalog.list_system_vm_templates().await?;
        templates.extend(self.deps.catalog.list_default_builtin_templates().await?);
        templates.retain(|t| t.hypervisor_type == hypervisor);

        let mut requested = 0;
        for store in &stores {
            for template in &templates {
                if self.needs_download(store, template).await? {
                    self.create_template_async(
                        TemplateOnStore::new(template.clone(), store.clone()),
                        None,
                    )
                    .await;
                    requested += 1;
                }
            }
        }
        Ok(requested)
    }

    /// Record system VM templates that were placed on `store` out of band.
    pub async fn add_system_vm_templates_to_secondary(
        &self,
        store: &DataStore,
    ) -> OrchestratorResult<Vec<TemplateDataStore>> {
        let mut rows = Vec::new();
        for template in self.deps.catalog.list_system_vm_templates().await? {
            let row = self
                .deps
                .associations
                .persist(NewAssociation {
                    store_id: store.id,
                    template_id: template.id,
                    state: ObjectState::Ready,
                    download_pct: 100,
                    download_state: DownloadStatus::Downloaded,
                    install: Some(InstallInfo {
                        install_path: format!(
                            "{DEFAULT_SYSTEM_VM_TEMPLATE_PATH}{}/",
                            template.id
                        ),
                        size: 0,
                        physical_size: 0,
                    }),
                    error_str: None,
                    url: template.url.clone(),
                    store_role: store.role,
                })
                .await?;
            rows.push(row);
        }
        Ok(rows)
    }
}
