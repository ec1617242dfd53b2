//! Represents a storage endpoint's store: an image (secondary) store or a
//! primary pool.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Role a store plays for the templates it holds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
pub enum StoreRole {
    Primary,
    Image,
}

/// A concrete store that template bytes can live on.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct DataStore {
    pub id: i64,

    pub uuid: Uuid,

    pub name: String,

    /// Zone scope. `None` marks a region-wide store that serves every zone.
    pub zone_id: Option<i64>,

    pub role: StoreRole,

    /// Location of the store as understood by its endpoint.
    pub url: String,
}

impl DataStore {
    pub fn is_region_wide(&self) -> bool {
        self.zone_id.is_none()
    }
}
