//! Template export to secondary storage.

use std::path::Path;

use vmstor_shared::command::{ResultObject, TemplateSource};
use vmstor_shared::constants::{details, template};
use vmstor_shared::descriptor::{
    DataStore, ImageFormat, StoragePoolType, TemplateDescriptor, VolumeDescriptor,
};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use super::VolumeProvisioner;
use crate::disk::qcow2_virtual_size;
use crate::pool::{ConnectedPath, CopyDisk, MountedStore, PhysicalDisk, PoolInfo};
use crate::snapshot::PartialArtifact;
use crate::tools::{ConvertRequest, ImageFile};
use crate::util::KeyFile;

/// Which kind of source a `template.properties` stamp describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Volume,
    Snapshot,
}

impl SourceKind {
    fn property(&self) -> &'static str {
        match self {
            SourceKind::Volume => "volume.name",
            SourceKind::Snapshot => "snapshot.name",
        }
    }
}

impl VolumeProvisioner {
    pub fn create_template(&self, source: &TemplateSource, dst: &TemplateDescriptor) -> VmstorResult<ResultObject> {
        let DataStore::Secondary { url } = &dst.store else {
            return Err(VmstorError::Validation(
                "unsupported protocol: templates are written to secondary storage".to_string(),
            ));
        };

        match source {
            TemplateSource::Volume(volume) => match volume.managed_path() {
                Some(path) => self.managed_template(volume, path, SourceKind::Volume, url, dst),
                None => self.volume_template(volume, url, dst),
            },
            TemplateSource::Snapshot(snapshot) => {
                let path = snapshot
                    .details
                    .get(details::PATH)
                    .or_else(|| snapshot.details.get(details::IQN))
                    .filter(|p| !p.is_empty());
                match path {
                    Some(path) => {
                        let mut volume = snapshot.volume.clone();
                        volume.store = snapshot.store.clone();
                        volume.details = snapshot.details.clone();
                        self.managed_template(&volume, path, SourceKind::Snapshot, url, dst)
                    }
                    None => Err(VmstorError::Unsupported("operation not supported".to_string())),
                }
            }
        }
    }

    /// Copy a connected managed disk into the template folder.
    fn managed_template(
        &self,
        volume: &VolumeDescriptor,
        path: &str,
        kind: SourceKind,
        url: &str,
        dst: &TemplateDescriptor,
    ) -> VmstorResult<ResultObject> {
        let manager = self.collab.pools.as_ref();
        let pool_ref = volume.pool()?;

        let _conn = ConnectedPath::connect(manager, pool_ref.pool_type, &pool_ref.uuid, path, &volume.details)?;
        let src_disk = manager.physical_disk(pool_ref.pool_type, &pool_ref.uuid, path)?;

        let store = MountedStore::mount(manager, url)?;
        let folder = dst.path.trim_matches('/');
        let template_dir = create_template_dir(&store.pool().info().local_path, folder)?;
        let name = uuid::Uuid::new_v4().to_string();
        let file_name = format!("{}.qcow2", name);

        tracing::debug!(src = %src_disk.path, format = %src_disk.format, template = %name, "Copying managed disk into template");
        let artifact = PartialArtifact::new(Path::new(&template_dir).join(&file_name));
        manager.copy_physical_disk(&CopyDisk {
            src: &src_disk,
            dest_name: &format!("{}/{}", folder, file_name),
            dest_pool: store.pool(),
            timeout: self.options.command_timeout(),
            src_secret: None,
            dest_secret: None,
            provisioning: None,
            dest_format: Some(ImageFormat::Qcow2),
        })?;

        let result = finish_template(&template_dir, folder, &name, kind)?;
        artifact.persist();
        Ok(result)
    }

    /// Export an unmanaged volume with the converter or the template script.
    fn volume_template(&self, volume: &VolumeDescriptor, url: &str, dst: &TemplateDescriptor) -> VmstorResult<ResultObject> {
        let manager = self.collab.pools.as_ref();
        let pool_ref = volume.pool()?;
        let store = MountedStore::mount(manager, url)?;
        let pool = manager.storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;
        let disk = pool.physical_disk(&volume.path)?;

        let folder = dst.path.trim_matches('/');
        let template_dir = create_template_dir(&store.pool().info().local_path, folder)?;
        let name = uuid::Uuid::new_v4().to_string();
        let file_name = format!("{}.qcow2", name);
        let artifact = PartialArtifact::new(Path::new(&template_dir).join(&file_name));

        if pool_ref.pool_type == StoragePoolType::Rbd {
            tracing::debug!(disk = %disk.path, template = %name, "Converting object-store disk into template");
            self.convert_object_store_disk(pool.info(), &disk, &format!("{}/{}", template_dir, file_name))?;
        } else {
            let args = vec![
                "-f".to_string(),
                disk.path.clone(),
                "-t".to_string(),
                template_dir.clone(),
                "-n".to_string(),
                file_name.clone(),
            ];
            self.collab
                .scripts
                .run(&self.create_template_script, &args, self.options.command_timeout())?;
        }

        let result = finish_template(&template_dir, folder, &name, SourceKind::Volume)?;
        artifact.persist();
        Ok(result)
    }

    fn convert_object_store_disk(&self, pool: &PoolInfo, disk: &PhysicalDisk, dest: &str) -> VmstorResult<()> {
        let key_file = match &pool.auth_secret {
            Some(secret) => Some(KeyFile::write(secret)?),
            None => None,
        };
        let src = object_store_uri(pool, &disk.path, key_file.as_ref().map(|k| k.path()));

        self.collab
            .converter
            .convert(&ConvertRequest {
                src: ImageFile::new(src, ImageFormat::Raw),
                dst: ImageFile::new(dest.to_string(), ImageFormat::Qcow2),
                src_secret: None,
                src_snapshot: None,
                force_share: false,
                timeout: self.options.command_timeout(),
            })
            .map_err(|e| {
                VmstorError::ExternalTool(format!(
                    "Failed to create new template while converting {} to {}: {}",
                    disk.path, dest, e
                ))
            })
    }
}

/// `rbd:` URI understood by the image converter.
fn object_store_uri(pool: &PoolInfo, image: &str, key_file: Option<&Path>) -> String {
    let mut uri = format!("rbd:{}", image);
    if !pool.source_host.is_empty() {
        uri.push_str(&format!(":mon_host={}", pool.source_host));
        if pool.source_port > 0 {
            uri.push_str(&format!("\\:{}", pool.source_port));
        }
    }
    if let Some(user) = &pool.auth_user {
        uri.push_str(&format!(":id={}", user));
    }
    if let Some(key_file) = key_file {
        uri.push_str(&format!(":keyfile={}", key_file.display()));
    }
    uri
}

fn create_template_dir(local_path: &str, folder: &str) -> VmstorResult<String> {
    let dir = format!("{}/{}", local_path.trim_end_matches('/'), folder);
    std::fs::create_dir_all(&dir).map_err(|e| {
        VmstorError::Storage(format!("Failed to create template directory {}: {}", dir, e))
    })?;
    Ok(dir)
}

/// Probe the written template, record it in `template.properties` and build
/// the answer object.
fn finish_template(template_dir: &str, folder: &str, name: &str, kind: SourceKind) -> VmstorResult<ResultObject> {
    let file_name = format!("{}.qcow2", name);
    let file = Path::new(template_dir).join(&file_name);

    let virtual_size = qcow2_virtual_size(&file)?;
    let physical_size = std::fs::metadata(&file)
        .map_err(|e| VmstorError::Storage(format!("Failed to stat {}: {}", file.display(), e)))?
        .len();

    let stamp = chrono::Local::now().format(template::DATE_FORMAT);
    let properties = format!(
        "filename={}\n{}={}\nqcow2=true\nqcow2.filename={}\nqcow2.size={}\nqcow2.virtualsize={}\nvirtualsize={}\nsize={}\n",
        file_name,
        kind.property(),
        stamp,
        file_name,
        physical_size,
        virtual_size,
        virtual_size,
        physical_size
    );
    let properties_path = Path::new(template_dir).join(template::PROPERTIES_FILE);
    std::fs::write(&properties_path, properties).map_err(|e| {
        VmstorError::Storage(format!(
            "Failed to write {}: {}",
            properties_path.display(),
            e
        ))
    })?;

    tracing::info!(template = %name, path = %file.display(), virtual_size, physical_size, "Created template");
    Ok(ResultObject {
        path: format!("{}/{}", folder, file_name),
        name: Some(name.to_string()),
        format: Some(ImageFormat::Qcow2),
        size: Some(virtual_size),
        physical_size: Some(physical_size),
        encrypt_format: None,
    })
}
