//! Represents a catalog template: the store-independent handle to content.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Hypervisor a template targets.
///
/// `None` covers installable media (ISOs) which any zone can host.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
pub enum HypervisorType {
    KVM,
    XenServer,
    VMware,
    Hyperv,
    LXC,
    BareMetal,
    None,
}

/// Catalog classification of a template.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TemplateType {
    /// Templates backing system VMs (routers, proxies). Always expected on every store.
    System,
    /// Default templates shipped with the platform. Always expected on every store.
    Builtin,
    User,
    Perhost,
}

/// A VM disk template registered in the catalog.
///
/// The catalog is owned by the registrar; the orchestrator only reads it,
/// except for backfilling `size` once the real byte count is known.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct VmTemplate {
    pub id: i64,

    /// Name the storage endpoints report the template under.
    pub unique_name: String,

    /// Display name.
    pub name: String,

    /// Owning account, charged for secondary storage.
    pub account_id: i64,

    pub is_public: bool,

    pub featured: bool,

    /// Source URL. `None` means the template cannot be (re)downloaded.
    pub url: Option<String>,

    pub hypervisor_type: HypervisorType,

    pub template_type: TemplateType,

    /// Declared size in bytes.
    pub size: i64,
}

impl VmTemplate {
    /// Private templates are neither public nor featured.
    pub fn is_private(&self) -> bool {
        !self.is_public && !self.featured
    }
}
