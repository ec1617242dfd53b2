//! Reconciliation sweep: brings the association rows of one image store in
//! line with what its endpoint actually holds.
//!
//! The sweep runs in stages. Stage inputs are captured once in a `SyncPlan`
//! before anything is written, and each later stage only consumes the value
//! produced by the one before it:
//!
//! 1. list the endpoint (unreachable aborts before any write)
//! 2. compute the expected set from the catalog
//! 3. reconcile each expected template against its row and the listing
//! 4. request downloads for what is still missing
//! 5. delete unclaimed objects nobody references

use crate::{
    errors::{OrchestratorError, OrchestratorResult},
    models::{
        association::{DownloadStatus, InstallInfo, NewAssociation, ObjectState, TemplateDataStore},
        data_object::TemplateOnStore,
        store::DataStore,
        template::{HypervisorType, VmTemplate},
    },
    services::{
        catalog::AlertType,
        endpoint::{AnswerPayload, Command, TemplateProp},
        template_service::TemplateService,
    },
};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// What one sweep changed, by template unique name.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct SyncReport {
    pub store_id: i64,
    /// Found on the endpoint without a row; recorded as downloaded.
    pub discovered: Vec<String>,
    /// Existing rows whose download bookkeeping was brought up to date.
    pub refreshed: Vec<String>,
    pub corrupted: Vec<String>,
    /// Rows created as not downloaded, ahead of a download request.
    pub seeded: Vec<String>,
    pub download_requested: Vec<String>,
    pub orphans_deleted: Vec<String>,
    /// Orphans left in place because a workload still uses them.
    pub orphans_retained: Vec<String>,
}

impl SyncReport {
    /// True when the sweep wrote nothing and requested nothing.
    pub fn is_quiet(&self) -> bool {
        self.discovered.is_empty()
            && self.refreshed.is_empty()
            && self.corrupted.is_empty()
            && self.seeded.is_empty()
            && self.download_requested.is_empty()
            && self.orphans_deleted.is_empty()
    }
}

/// Everything the sweep decides from, captured before the first write.
struct SyncPlan {
    store: DataStore,
    /// Endpoint listing keyed by unique name.
    listing: HashMap<String, TemplateProp>,
    expected: Vec<VmTemplate>,
    /// Rows on the store when the sweep started, by template id.
    existing: HashMap<i64, TemplateDataStore>,
}

/// Output of stage 3.
#[derive(Debug, Default)]
struct Reconciled {
    to_download: Vec<VmTemplate>,
    unclaimed: Vec<TemplateProp>,
}

/// Pick the templates stage 4 should start downloading.
///
/// Skips templates without a source URL, templates whose hypervisor is not
/// available, private templates with nothing to resume, and anything that
/// already had a row before the sweep.
fn select_downloads(
    candidates: &[VmTemplate],
    existing: &HashMap<i64, TemplateDataStore>,
    hypervisors: &[HypervisorType],
) -> Vec<VmTemplate> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|t| seen.insert(t.id))
        .filter(|t| {
            if t.url.is_none() {
                debug!("template {} has no url, cannot download it", t.unique_name);
                return false;
            }
            if !hypervisors.contains(&t.hypervisor_type) {
                return false;
            }
            let tracked = existing.contains_key(&t.id);
            if t.is_private() && !tracked {
                debug!(
                    "private template {} was never on this store, skipping",
                    t.unique_name
                );
                return false;
            }
            !tracked
        })
        .cloned()
        .collect()
}

/// `row` as it should read once `prop` is confirmed present and intact.
fn downloaded_row(row: &TemplateDataStore, prop: &TemplateProp) -> TemplateDataStore {
    let mut next = row.clone();
    if row.download_state != DownloadStatus::Downloaded {
        next.error_str = Some(String::new());
    }
    next.download_state = DownloadStatus::Downloaded;
    next.download_pct = 100;
    next.install_path = Some(prop.install_path.clone());
    next.size = prop.size;
    next.physical_size = prop.physical_size;
    next
}

fn corruption_message(template: &VmTemplate, store_id: i64) -> String {
    format!(
        "template {}:{} is corrupted on store {}",
        template.name, template.id, store_id
    )
}

impl TemplateService {
    /// Reconcile one image store against its endpoint.
    pub async fn handle_template_sync(&self, store: &DataStore) -> OrchestratorResult<SyncReport> {
        let plan = self.plan_sync(store).await?;
        info!(
            "syncing {} store {}: {} listed, {} expected",
            if store.is_region_wide() { "region-wide" } else { "zone" },
            store.id,
            plan.listing.len(),
            plan.expected.len()
        );

        let mut report = SyncReport {
            store_id: store.id,
            ..Default::default()
        };
        let reconciled = self.reconcile(&plan, &mut report).await?;
        self.queue_downloads(&plan, &reconciled, &mut report).await?;
        self.cleanup_orphans(&plan.store, &reconciled.unclaimed, &mut report)
            .await;

        if report.is_quiet() {
            debug!("store {} already in sync", store.id);
            return Ok(report);
        }
        info!(
            "store {} synced: {} discovered, {} refreshed, {} corrupted, {} seeded, \
             {} downloads requested, {} orphans deleted",
            store.id,
            report.discovered.len(),
            report.refreshed.len(),
            report.corrupted.len(),
            report.seeded.len(),
            report.download_requested.len(),
            report.orphans_deleted.len()
        );
        Ok(report)
    }

    /// Sweep every image store. A failing store is logged and skipped.
    pub async fn sync_all_stores(&self) -> OrchestratorResult<Vec<SyncReport>> {
        let mut reports = Vec::new();
        for store in self.deps.stores.list_image_stores(None).await? {
            match self.handle_template_sync(&store).await {
                Ok(report) => reports.push(report),
                Err(err) => warn!("sync of store {} aborted: {}", store.id, err),
            }
        }
        Ok(reports)
    }

    /// Stages 1 and 2.
    async fn plan_sync(&self, store: &DataStore) -> OrchestratorResult<SyncPlan> {
        let listing = self.list_templates(store).await?;
        let expected = self.expected_templates(store).await?;
        let existing = self
            .deps
            .associations
            .list_by_store(store.id)
            .await?
            .into_iter()
            .map(|row| (row.template_id, row))
            .collect();

        Ok(SyncPlan {
            store: store.clone(),
            listing,
            expected,
            existing,
        })
    }

    async fn list_templates(
        &self,
        store: &DataStore,
    ) -> OrchestratorResult<HashMap<String, TemplateProp>> {
        let answer = self.deps.gateway.send(store, Command::ListTemplates).await?;
        match answer.payload {
            AnswerPayload::Templates(listing) if answer.result => Ok(listing),
            _ => Err(OrchestratorError::EndpointUnreachable {
                store: store.id,
                reason: answer
                    .details
                    .unwrap_or_else(|| "endpoint returned no template listing".to_string()),
            }),
        }
    }

    /// Templates this store should hold, deduplicated by id.
    async fn expected_templates(&self, store: &DataStore) -> OrchestratorResult<Vec<VmTemplate>> {
        let mut templates = match store.zone_id {
            Some(zone) => self.deps.catalog.list_all_in_zone(zone).await?,
            None => self.deps.catalog.list_all().await?,
        };
        templates.extend(self.deps.catalog.list_system_vm_templates().await?);
        templates.extend(self.deps.catalog.list_default_builtin_templates().await?);

        let mut seen = HashSet::new();
        templates.retain(|t| seen.insert(t.id));
        Ok(templates)
    }

    /// Stage 3.
    async fn reconcile(
        &self,
        plan: &SyncPlan,
        report: &mut SyncReport,
    ) -> OrchestratorResult<Reconciled> {
        let mut reconciled = Reconciled::default();
        let mut claimed = HashSet::new();

        for template in &plan.expected {
            let Some(prop) = plan.listing.get(&template.unique_name) else {
                reconciled.to_download.push(template.clone());
                self.record_missing(plan, template, report).await?;
                continue;
            };

            claimed.insert(prop.unique_name.as_str());
            if !prop.corrupted {
                self.record_present(plan, template, prop, report).await?;
                continue;
            }

            self.record_corrupted(plan, template, report).await?;
            if template.url.is_some() {
                reconciled.to_download.push(template.clone());
            } else {
                warn!(
                    "template {} is corrupted on store {} and has no url to download it again",
                    template.unique_name, plan.store.id
                );
            }
        }

        reconciled.unclaimed = plan
            .listing
            .values()
            .filter(|prop| !claimed.contains(prop.unique_name.as_str()))
            .cloned()
            .collect();
        reconciled
            .unclaimed
            .sort_by(|a, b| a.unique_name.cmp(&b.unique_name));
        Ok(reconciled)
    }

    async fn record_present(
        &self,
        plan: &SyncPlan,
        template: &VmTemplate,
        prop: &TemplateProp,
        report: &mut SyncReport,
    ) -> OrchestratorResult<()> {
        let store = &plan.store;
        let row_changed = match plan.existing.get(&template.id) {
            Some(row) => {
                let mut next = downloaded_row(row, prop);
                if next == *row {
                    false
                } else {
                    next.last_updated = Utc::now();
                    if self.deps.associations.update_download(&next).await? {
                        report.refreshed.push(template.unique_name.clone());
                        true
                    } else {
                        debug!(
                            "template {} on store {} moved during sync, leaving it",
                            template.unique_name, store.id
                        );
                        false
                    }
                }
            }
            None => {
                self.deps
                    .associations
                    .persist(NewAssociation {
                        store_id: store.id,
                        template_id: template.id,
                        state: ObjectState::Ready,
                        download_pct: 100,
                        download_state: DownloadStatus::Downloaded,
                        install: Some(InstallInfo {
                            install_path: prop.install_path.clone(),
                            size: prop.size,
                            physical_size: prop.physical_size,
                        }),
                        error_str: None,
                        url: template.url.clone(),
                        store_role: store.role,
                    })
                    .await?;
                self.associate_template_to_zone(template.id, store.zone_id)
                    .await?;
                report.discovered.push(template.unique_name.clone());
                true
            }
        };

        let size_changed = prop.size != template.size;
        if !row_changed && !size_changed {
            return Ok(());
        }

        // An empty payload has nothing to charge.
        let limit_check = if prop.size > 0 {
            Some(
                self.deps
                    .limits
                    .check_resource_limit(template.account_id, prop.size - template.size)
                    .await,
            )
        } else {
            None
        };
        if size_changed {
            self.deps.catalog.update_size(template.id, prop.size).await?;
        }
        if let Some(limit_check) = limit_check {
            self.settle_usage(template, store.zone_id, limit_check).await;
        }
        Ok(())
    }

    /// Accounting never blocks availability: failures are logged and
    /// alerted, and usage is recalculated either way.
    async fn settle_usage(
        &self,
        template: &VmTemplate,
        zone_id: Option<i64>,
        limit_check: OrchestratorResult<()>,
    ) {
        if let Err(err) = limit_check {
            warn!(
                "storage accounting for template {}: {}",
                template.unique_name, err
            );
            if matches!(err, OrchestratorError::ResourceLimitExceeded { .. }) {
                self.deps.alerts.send_alert(
                    AlertType::ResourceLimitExceeded,
                    zone_id,
                    &err.to_string(),
                );
            }
        }

        if let Err(err) = self
            .deps
            .limits
            .recalculate_resource_count(template.account_id)
            .await
        {
            warn!(
                "failed to recalculate storage usage of account {}: {}",
                template.account_id, err
            );
        }
    }

    async fn record_corrupted(
        &self,
        plan: &SyncPlan,
        template: &VmTemplate,
        report: &mut SyncReport,
    ) -> OrchestratorResult<()> {
        let msg = corruption_message(template, plan.store.id);
        match plan.existing.get(&template.id) {
            Some(row) => {
                let mut next = row.clone();
                next.download_state = DownloadStatus::DownloadError;
                next.error_str = Some(msg.clone());
                if next == *row {
                    return Ok(());
                }
                next.last_updated = Utc::now();
                if !self.deps.associations.update_download(&next).await? {
                    debug!(
                        "template {} on store {} moved during sync, leaving it",
                        template.unique_name, plan.store.id
                    );
                    return Ok(());
                }
            }
            None => {
                self.deps
                    .associations
                    .persist(NewAssociation {
                        store_id: plan.store.id,
                        template_id: template.id,
                        state: ObjectState::Allocated,
                        download_pct: 0,
                        download_state: DownloadStatus::DownloadError,
                        install: None,
                        error_str: Some(msg.clone()),
                        url: template.url.clone(),
                        store_role: plan.store.role,
                    })
                    .await?;
            }
        }
        info!("{}", msg);
        report.corrupted.push(template.unique_name.clone());
        Ok(())
    }

    async fn record_missing(
        &self,
        plan: &SyncPlan,
        template: &VmTemplate,
        report: &mut SyncReport,
    ) -> OrchestratorResult<()> {
        match plan.existing.get(&template.id) {
            Some(row) if row.download_state != DownloadStatus::Downloaded => {
                info!(
                    "template {} not yet on store {}, download will start or resume shortly",
                    template.unique_name, plan.store.id
                );
            }
            Some(_) => {
                debug!(
                    "template {} recorded as downloaded but not listed by store {}",
                    template.unique_name, plan.store.id
                );
            }
            None => {
                self.deps
                    .associations
                    .allocate(&plan.store, template)
                    .await?;
                self.associate_template_to_zone(template.id, plan.store.zone_id)
                    .await?;
                report.seeded.push(template.unique_name.clone());
            }
        }
        Ok(())
    }

    /// Hypervisors downloads are made for: the zone's own (KVM when it has
    /// none), plus `None` for installable media, never `BareMetal`.
    async fn download_hypervisors(
        &self,
        zone_id: Option<i64>,
    ) -> OrchestratorResult<Vec<HypervisorType>> {
        let mut hypervisors = self.deps.zones.available_hypervisors(zone_id).await?;
        if hypervisors.is_empty() {
            hypervisors.push(HypervisorType::KVM);
        }
        hypervisors.retain(|hv| *hv != HypervisorType::BareMetal);
        if !hypervisors.contains(&HypervisorType::None) {
            hypervisors.push(HypervisorType::None);
        }
        Ok(hypervisors)
    }

    /// Stage 4.
    async fn queue_downloads(
        &self,
        plan: &SyncPlan,
        reconciled: &Reconciled,
        report: &mut SyncReport,
    ) -> OrchestratorResult<()> {
        let hypervisors = self.download_hypervisors(plan.store.zone_id).await?;
        let downloads = select_downloads(&reconciled.to_download, &plan.existing, &hypervisors);

        for template in downloads {
            info!(
                "requesting download of template {} to store {}",
                template.unique_name, plan.store.id
            );
            report.download_requested.push(template.unique_name.clone());
            self.create_template_async(TemplateOnStore::new(template, plan.store.clone()), None)
                .await;
        }
        Ok(())
    }

    /// Stage 5. Deletes go straight to the endpoint: orphans have no row.
    async fn cleanup_orphans(
        &self,
        store: &DataStore,
        unclaimed: &[TemplateProp],
        report: &mut SyncReport,
    ) {
        for prop in unclaimed {
            let references = match prop.template_id {
                Some(id) => match self.deps.workloads.count_vms_using(id).await {
                    Ok(count) => count,
                    Err(err) => {
                        warn!(
                            "cannot tell whether orphan {} is in use, keeping it: {}",
                            prop.unique_name, err
                        );
                        continue;
                    }
                },
                None => 0,
            };
            if references > 0 {
                info!(
                    "template {} on store {} is still used by {} vms, keeping it",
                    prop.unique_name, store.id, references
                );
                report.orphans_retained.push(prop.unique_name.clone());
                continue;
            }

            let command = Command::DeleteTemplate {
                install_path: prop.install_path.clone(),
            };
            match self.deps.gateway.send(store, command).await {
                Ok(answer) if answer.result => {
                    info!(
                        "deleted orphan template {} from store {}",
                        prop.unique_name, store.id
                    );
                    report.orphans_deleted.push(prop.unique_name.clone());
                }
                Ok(answer) => warn!(
                    "failed to delete orphan template {} from store {}: {}",
                    prop.unique_name,
                    store.id,
                    answer.details.unwrap_or_default()
                ),
                Err(err) => warn!(
                    "failed to delete orphan template {} from store {}: {}",
                    prop.unique_name, store.id, err
                ),
            }
        }
    }
}
