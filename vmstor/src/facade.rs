//! Command-handling surface.
//!
//! Every command is consumed by [`StorageOperationFacade::handle`], so any
//! passphrase it carried is zeroed when the call returns, whatever the
//! outcome. Failures never escape: they become failed [`Answer`]s.

use std::sync::Arc;
use std::time::Instant;

use vmstor_shared::command::{Answer, Command};
use vmstor_shared::errors::VmstorResult;

use crate::attach::DiskAttachmentController;
use crate::metrics::{StorageMetrics, StorageMetricsStorage};
use crate::options::{ResolvedScripts, StorageOptions};
use crate::provision::{VolumeProvisioner, volume_result};
use crate::snapshot::{FlattenOutcome, SnapshotEngine};
use crate::tools::Collaborators;
use crate::util::CancelToken;

pub struct StorageOperationFacade {
    attach: DiskAttachmentController,
    snapshots: SnapshotEngine,
    provisioner: VolumeProvisioner,
    options: Arc<StorageOptions>,
    metrics: StorageMetricsStorage,
    cancel: CancelToken,
}

impl StorageOperationFacade {
    /// Build the facade, locating the external scripts first.
    ///
    /// # Returns
    /// * `Err(Config)` - A required script is missing; the processor must not start
    pub fn new(collab: Collaborators, options: StorageOptions) -> VmstorResult<Self> {
        let scripts = options.resolve_scripts()?;
        Ok(Self::with_resolved_scripts(collab, options, scripts))
    }

    pub fn with_resolved_scripts(collab: Collaborators, options: StorageOptions, scripts: ResolvedScripts) -> Self {
        let options = Arc::new(options);
        let metrics = StorageMetricsStorage::new();
        let cancel = CancelToken::new();

        Self {
            attach: DiskAttachmentController::new(
                collab.clone(),
                options.detach_poll_interval(),
                cancel.clone(),
                metrics.clone(),
            ),
            snapshots: SnapshotEngine::new(
                collab.clone(),
                options.clone(),
                scripts.manage_snapshot,
                metrics.clone(),
            ),
            provisioner: VolumeProvisioner::new(collab, options.clone(), scripts.create_template),
            options,
            metrics,
            cancel,
        }
    }

    pub fn handle(&self, command: Command) -> Answer {
        let name = command.name();
        let started = Instant::now();
        StorageMetricsStorage::incr(&self.metrics.commands_total);
        tracing::debug!(command = name, "Handling storage command");

        let answer = match self.dispatch(command) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(command = name, error = %e, "Storage command failed");
                Answer::failed(e.to_string())
            }
        };

        if !answer.success {
            StorageMetricsStorage::incr(&self.metrics.commands_failed);
        }
        tracing::debug!(
            command = name,
            success = answer.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Storage command finished"
        );
        answer
    }

    fn dispatch(&self, command: Command) -> VmstorResult<Answer> {
        match command {
            Command::CreateVolume { volume, migration } => {
                let disk = self.provisioner.create_volume(&volume, migration.as_ref())?;
                Ok(Answer::with_object(volume_result(&disk, volume.size)))
            }
            Command::DeleteVolume { volume } => {
                self.provisioner.delete_volume(&volume)?;
                Ok(Answer::ok())
            }
            Command::CloneVolumeFromTemplate { template, volume } => {
                let disk = self.provisioner.clone_volume_from_base_template(&template, &volume)?;
                Ok(Answer::with_object(volume_result(&disk, volume.size)))
            }
            Command::CreateSnapshot { snapshot } => {
                let object = self.snapshots.create_snapshot(&snapshot)?;
                Ok(Answer::with_object(object))
            }
            Command::DeleteSnapshot { snapshot } => {
                self.snapshots.delete_snapshot(&snapshot)?;
                Ok(Answer::ok())
            }
            Command::AttachVolume { attachment, vm_name } => {
                self.attach.attach(&vm_name, &attachment)?;
                Ok(Answer::ok())
            }
            Command::DetachVolume {
                attachment,
                vm_name,
                wait_timeout_ms,
            } => {
                let wait = if wait_timeout_ms == 0 {
                    self.options.default_detach_wait_ms
                } else {
                    wait_timeout_ms
                };
                self.attach.detach(&vm_name, &attachment, wait)?;
                Ok(Answer::ok())
            }
            Command::CopyVolume { src, dst } => {
                let object = self.provisioner.copy_volume(&src, &dst)?;
                Ok(Answer::with_object(object))
            }
            Command::CreateVolumeFromSnapshot { snapshot, dst } => {
                let object = self.provisioner.create_volume_from_snapshot(&snapshot, &dst)?;
                Ok(Answer::with_object(object))
            }
            Command::CreateTemplateFromVolumeOrSnapshot { source, dst } => {
                let object = self.provisioner.create_template(&source, &dst)?;
                Ok(Answer::with_object(object))
            }
            Command::FlattenFromSnapshot { snapshot } => match self.snapshots.flatten_from_snapshot(&snapshot)? {
                FlattenOutcome::Final => Ok(Answer::ok()),
                FlattenOutcome::Partial => Ok(Answer::failed(format!(
                    "Snapshot {} still has dependent clones",
                    snapshot.path
                ))),
            },
        }
    }

    pub fn metrics(&self) -> StorageMetrics {
        StorageMetrics::new(self.metrics.clone())
    }

    /// Interrupt in-flight detach waits; they fail with `Cancelled`.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down storage facade");
        self.cancel.cancel();
    }
}
