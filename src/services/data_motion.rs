//! Data motion: the layer that actually moves template bytes.
//!
//! Each operation returns immediately and reports back exactly once through
//! the supplied continuation. `EndpointDataMotion` turns every request into
//! a command for the endpoint serving the destination store.

use crate::{
    errors::{OrchestratorError, OrchestratorResult},
    models::{
        data_object::{DataObject, TemplateOnStore},
        store::StoreRole,
    },
    services::{
        async_call::AsyncCompletionCallback,
        endpoint::{
            Answer, Command, EndpointGateway, InstallTemplateCommand,
            PrimaryStorageDownloadCommand, template_dir,
        },
    },
};
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, warn};

/// Outcome of a data motion request: the endpoint's answer on success.
pub type CommandResult = OrchestratorResult<Answer>;

pub trait DataMotionService: Send + Sync {
    /// Bring `object` into existence on its store from the template URL.
    fn create_async(&self, object: TemplateOnStore, callback: AsyncCompletionCallback<CommandResult>);

    /// Copy `source` into `dest`.
    fn copy_async(
        &self,
        source: DataObject,
        dest: TemplateOnStore,
        callback: AsyncCompletionCallback<CommandResult>,
    );

    /// Remove `object` from its store.
    fn delete_async(&self, object: TemplateOnStore, callback: AsyncCompletionCallback<CommandResult>);
}

#[derive(Clone)]
pub struct EndpointDataMotion {
    gateway: Arc<dyn EndpointGateway>,
}

impl EndpointDataMotion {
    pub fn new(gateway: Arc<dyn EndpointGateway>) -> Self {
        Self { gateway }
    }

    fn dispatch(
        &self,
        object: TemplateOnStore,
        command: OrchestratorResult<Command>,
        callback: AsyncCompletionCallback<CommandResult>,
    ) {
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let result = match command {
                Ok(command) => {
                    debug!(
                        "sending {:?} for {} to store {}",
                        command, object.template.unique_name, object.store.id
                    );
                    execute(gateway.as_ref(), &object, command).await
                }
                Err(err) => Err(err),
            };
            if AssertUnwindSafe(callback.complete(result))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(
                    "continuation for {} on store {} panicked",
                    object.template.unique_name, object.store.id
                );
            }
        });
    }
}

async fn execute(
    gateway: &dyn EndpointGateway,
    object: &TemplateOnStore,
    command: Command,
) -> CommandResult {
    match gateway.send(&object.store, command).await {
        Ok(answer) if answer.result => Ok(answer),
        Ok(answer) => Err(OrchestratorError::RemoteOperationFailed(
            answer
                .details
                .unwrap_or_else(|| "endpoint reported failure".to_string()),
        )),
        Err(err) => Err(err),
    }
}

fn install_command(object: &TemplateOnStore, source: String) -> Command {
    let template = &object.template;
    if object.store.role == StoreRole::Primary {
        return Command::PrimaryStorageDownload(PrimaryStorageDownloadCommand {
            secondary_storage_url: source
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .unwrap_or_default(),
            url: source,
            pool_id: object.store.id,
            pool_uuid: object.store.uuid.to_string(),
            local_path: template.unique_name.clone(),
        });
    }
    Command::InstallTemplate(InstallTemplateCommand {
        source,
        template_id: template.id,
        account_id: template.account_id,
        unique_name: template.unique_name.clone(),
    })
}

impl DataMotionService for EndpointDataMotion {
    fn create_async(&self, object: TemplateOnStore, callback: AsyncCompletionCallback<CommandResult>) {
        let command = match object.template.url.clone() {
            Some(url) => Ok(install_command(&object, url)),
            None => Err(OrchestratorError::RemoteOperationFailed(format!(
                "template {} has no source url to download from",
                object.template.unique_name
            ))),
        };
        self.dispatch(object, command, callback);
    }

    fn copy_async(
        &self,
        source: DataObject,
        dest: TemplateOnStore,
        callback: AsyncCompletionCallback<CommandResult>,
    ) {
        let command = match source.location() {
            Some(location) => Ok(install_command(&dest, location)),
            None => Err(OrchestratorError::RemoteOperationFailed(format!(
                "{} is not installed anywhere",
                source.describe()
            ))),
        };
        self.dispatch(dest, command, callback);
    }

    /// Without a recorded install path (a create that failed part way) the
    /// location the template would have been installed at is removed.
    fn delete_async(&self, object: TemplateOnStore, callback: AsyncCompletionCallback<CommandResult>) {
        let install_path = match (&object.install_path, object.store.role) {
            (Some(path), _) => path.clone(),
            (None, StoreRole::Primary) => object.template.unique_name.clone(),
            (None, StoreRole::Image) => template_dir(object.template.account_id, object.template.id),
        };
        let command = Command::DeleteTemplate { install_path };
        self.dispatch(object, Ok(command), callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{association::InstallInfo, data_object::SnapshotInfo, store::DataStore},
        services::{
            catalog::fixtures::{image_store, template},
            endpoint::AnswerPayload,
        },
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<Command>>,
        unreachable: bool,
    }

    #[async_trait]
    impl EndpointGateway for RecordingGateway {
        async fn send(&self, store: &DataStore, command: Command) -> OrchestratorResult<Answer> {
            if self.unreachable {
                return Err(OrchestratorError::EndpointUnreachable {
                    store: store.id,
                    reason: "connection refused".into(),
                });
            }
            self.sent.lock().unwrap().push(command);
            Ok(Answer::success(AnswerPayload::Installed(InstallInfo {
                install_path: "template/tmpl/2/9/tmpl-9".into(),
                size: 9,
                physical_size: 9,
            })))
        }
    }

    fn capture() -> (AsyncCompletionCallback<CommandResult>, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        let callback = AsyncCompletionCallback::new(move |result| async move {
            let _ = tx.send(result);
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn create_downloads_from_template_url() {
        let gateway = Arc::new(RecordingGateway::default());
        let motion = EndpointDataMotion::new(gateway.clone());
        let (callback, rx) = capture();

        let object = TemplateOnStore::new(template(9, "tmpl-9"), image_store(1, Some(1), "/s"));
        motion.create_async(object, callback);

        assert!(rx.await.unwrap().is_ok());
        let sent = gateway.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![Command::InstallTemplate(InstallTemplateCommand {
                source: "file:///images/tmpl-9.qcow2".into(),
                template_id: 9,
                account_id: 2,
                unique_name: "tmpl-9".into(),
            })]
        );
    }

    #[tokio::test]
    async fn create_without_url_fails_without_sending() {
        let gateway = Arc::new(RecordingGateway::default());
        let motion = EndpointDataMotion::new(gateway.clone());
        let (callback, rx) = capture();

        let mut tmpl = template(3, "tmpl-3");
        tmpl.url = None;
        motion.create_async(TemplateOnStore::new(tmpl, image_store(1, None, "/s")), callback);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, OrchestratorError::RemoteOperationFailed(_)));
        assert!(err.to_string().contains("no source url"));
        assert!(gateway.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn copy_to_primary_is_a_sequential_download() {
        let gateway = Arc::new(RecordingGateway::default());
        let motion = EndpointDataMotion::new(gateway.clone());
        let (callback, rx) = capture();

        let mut pool = image_store(4, Some(1), "/pool");
        pool.role = StoreRole::Primary;
        let source = DataObject::Snapshot(SnapshotInfo {
            id: 11,
            store: image_store(1, Some(1), "/secondary"),
            install_path: "snapshots/11/snap".into(),
        });
        motion.copy_async(source, TemplateOnStore::new(template(9, "tmpl-9"), pool), callback);

        assert!(rx.await.unwrap().is_ok());
        let sent = gateway.sent.lock().unwrap();
        match &sent[0] {
            Command::PrimaryStorageDownload(cmd) => {
                assert_eq!(cmd.url, "/secondary/snapshots/11/snap");
                assert_eq!(cmd.secondary_storage_url, "/secondary/snapshots/11");
                assert_eq!(cmd.pool_id, 4);
                assert!(sent[0].execute_in_sequence());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_becomes_failure_result() {
        let gateway = Arc::new(RecordingGateway {
            unreachable: true,
            ..Default::default()
        });
        let motion = EndpointDataMotion::new(gateway);
        let (callback, rx) = capture();

        let object = TemplateOnStore::new(template(9, "tmpl-9"), image_store(1, Some(1), "/s"))
            .with_install_path("template/tmpl/2/9/tmpl-9");
        motion.delete_async(object, callback);

        assert!(matches!(
            rx.await.unwrap(),
            Err(OrchestratorError::EndpointUnreachable { store: 1, .. })
        ));
    }

    #[tokio::test]
    async fn delete_without_install_path_targets_template_dir() {
        let gateway = Arc::new(RecordingGateway::default());
        let motion = EndpointDataMotion::new(gateway.clone());

        let (callback, rx) = capture();
        let object = TemplateOnStore::new(template(9, "tmpl-9"), image_store(1, Some(1), "/s"));
        motion.delete_async(object, callback);
        assert!(rx.await.unwrap().is_ok());

        let mut pool = image_store(4, Some(1), "/pool");
        pool.role = StoreRole::Primary;
        let (callback, rx) = capture();
        motion.delete_async(TemplateOnStore::new(template(9, "tmpl-9"), pool), callback);
        assert!(rx.await.unwrap().is_ok());

        assert_eq!(
            *gateway.sent.lock().unwrap(),
            vec![
                Command::DeleteTemplate {
                    install_path: "template/tmpl/2/9/".into()
                },
                Command::DeleteTemplate {
                    install_path: "tmpl-9".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn panicking_continuation_does_not_stop_later_dispatches() {
        let gateway = Arc::new(RecordingGateway::default());
        let motion = EndpointDataMotion::new(gateway.clone());
        let object = TemplateOnStore::new(template(9, "tmpl-9"), image_store(1, Some(1), "/s"));

        let (tx, rx) = oneshot::channel::<()>();
        motion.create_async(
            object.clone(),
            AsyncCompletionCallback::new(move |_: CommandResult| async move {
                let _tx = tx;
                panic!("continuation blew up");
            }),
        );
        // The sender is dropped while unwinding.
        assert!(rx.await.is_err());

        let (callback, rx) = capture();
        motion.create_async(object, callback);
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(gateway.sent.lock().unwrap().len(), 2);
    }
}
