//! Typed commands sent to a storage endpoint and the answers it returns.
//!
//! The gateway is transport only: it carries a command to whichever agent
//! serves the store and hands back the answer. Business decisions stay in
//! the template service.

use crate::{
    errors::OrchestratorResult,
    models::{association::InstallInfo, store::DataStore},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Directory every template payload on an image store lives under.
pub const TEMPLATE_ROOT: &str = "template/tmpl";

/// Directory holding one template on an image store, trailing slash included.
///
/// Known before anything is written, so it also names whatever a failed
/// install may have left behind.
pub fn template_dir(account_id: i64, template_id: i64) -> String {
    format!("{}/{}/{}/", TEMPLATE_ROOT, account_id, template_id)
}

/// An object an endpoint reports as physically present on its store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TemplateProp {
    /// Catalog id recorded when the object was written, if known.
    pub template_id: Option<i64>,
    pub unique_name: String,
    pub install_path: String,
    pub size: i64,
    pub physical_size: i64,
    pub corrupted: bool,
}

/// Stage a template from an image store onto a primary pool.
///
/// Always executed in sequence with other commands to the same pool.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PrimaryStorageDownloadCommand {
    /// Location of the source payload.
    pub url: String,
    pub pool_id: i64,
    pub pool_uuid: String,
    /// Destination path relative to the pool root.
    pub local_path: String,
    pub secondary_storage_url: String,
}

/// Install a template on an image store from `source`.
///
/// Used both for downloads from the template URL and for copies whose
/// source is another store, snapshot or volume.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InstallTemplateCommand {
    pub source: String,
    pub template_id: i64,
    pub account_id: i64,
    pub unique_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ListTemplates,
    InstallTemplate(InstallTemplateCommand),
    DeleteTemplate { install_path: String },
    PrimaryStorageDownload(PrimaryStorageDownloadCommand),
}

impl Command {
    /// Commands that must never run concurrently with others to the same target.
    pub fn execute_in_sequence(&self) -> bool {
        matches!(self, Command::PrimaryStorageDownload(_))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub enum AnswerPayload {
    #[default]
    None,
    /// Listing keyed by unique name.
    Templates(HashMap<String, TemplateProp>),
    Installed(InstallInfo),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Answer {
    pub result: bool,
    pub details: Option<String>,
    pub payload: AnswerPayload,
}

impl Answer {
    pub fn success(payload: AnswerPayload) -> Self {
        Self {
            result: true,
            details: None,
            payload,
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: Some(details.into()),
            payload: AnswerPayload::None,
        }
    }
}

/// Sends commands to the endpoint serving a store.
///
/// Transport failures surface as `EndpointUnreachable`; command-level
/// failures come back as an `Answer` with `result == false`.
#[async_trait]
pub trait EndpointGateway: Send + Sync {
    async fn send(&self, store: &DataStore, command: Command) -> OrchestratorResult<Answer>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_primary_download_is_sequential() {
        let download = Command::PrimaryStorageDownload(PrimaryStorageDownloadCommand {
            url: "/secondary/template/tmpl/2/9/tmpl-9".into(),
            pool_id: 4,
            pool_uuid: "pool-4".into(),
            local_path: "template/tmpl-9".into(),
            secondary_storage_url: "/secondary".into(),
        });
        assert!(download.execute_in_sequence());
        assert!(!Command::ListTemplates.execute_in_sequence());
        assert!(
            !Command::DeleteTemplate {
                install_path: "x".into()
            }
            .execute_in_sequence()
        );
    }

    #[test]
    fn failure_answer_carries_details() {
        let answer = Answer::failure("disk full");
        assert!(!answer.result);
        assert_eq!(answer.details.as_deref(), Some("disk full"));
        assert_eq!(answer.payload, AnswerPayload::None);
    }
}
