//! `virsh`-backed hypervisor adapter.
//!
//! Talks to the local libvirt daemon through the `virsh` CLI. Device and
//! snapshot definitions are written to temporary XML files and passed by path.

use std::sync::Arc;
use std::time::Duration;

use vmstor_shared::descriptor::DiskBus;
use vmstor_shared::errors::{VmstorError, VmstorResult};
use vmstor_shared::secret::Passphrase;

use super::{DeviceKind, DiskDef, Domain, DomainSnapshotSpec, DomainState, Hypervisor, LiveDisk};
use crate::util::{KeyFile, ToolOutput, run_tool, temp_document};

#[derive(Debug, Clone)]
struct VirshCli {
    binary: String,
    timeout: Duration,
}

impl VirshCli {
    fn run(&self, args: Vec<String>) -> VmstorResult<ToolOutput> {
        let output = run_tool(&self.binary, &args, self.timeout)?;
        if output.success() {
            return Ok(output);
        }
        // Hypervisor failures keep libvirt's own message so callers can
        // pattern-match on it.
        Err(VmstorError::Libvirt(output.error_text()))
    }
}

/// Hypervisor connection through `virsh`.
pub struct VirshHypervisor {
    cli: VirshCli,
}

impl VirshHypervisor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cli: VirshCli {
                binary: binary.into(),
                timeout,
            },
        }
    }

    fn versions(&self) -> VmstorResult<String> {
        Ok(self.cli.run(vec!["version".into()])?.stdout)
    }
}

impl Hypervisor for VirshHypervisor {
    fn lookup_domain(&self, vm_name: &str) -> VmstorResult<Arc<dyn Domain>> {
        match self.cli.run(vec!["domuuid".into(), vm_name.into()]) {
            Ok(_) => Ok(Arc::new(VirshDomain {
                cli: self.cli.clone(),
                name: vm_name.to_string(),
            })),
            Err(VmstorError::Libvirt(msg)) if msg.contains("failed to get domain") => Err(
                VmstorError::NotFound(format!("VM {} not found: {}", vm_name, msg)),
            ),
            Err(e) => Err(e),
        }
    }

    fn libvirt_version(&self) -> VmstorResult<u64> {
        let out = self.versions()?;
        parse_version(&out, "Using library: libvirt").ok_or_else(|| {
            VmstorError::Libvirt(format!("Unable to parse libvirt version from: {}", out.trim()))
        })
    }

    fn qemu_version(&self) -> VmstorResult<u64> {
        let out = self.versions()?;
        parse_version(&out, "Running hypervisor: QEMU").ok_or_else(|| {
            VmstorError::Libvirt(format!("Unable to parse QEMU version from: {}", out.trim()))
        })
    }

    fn define_volume_secret(&self, usage: &str, passphrase: &Passphrase) -> VmstorResult<String> {
        let xml = format!(
            "<secret ephemeral='no' private='yes'><usage type='volume'><volume>{}</volume></usage></secret>",
            super::disk_def::escape(usage)
        );
        let doc = temp_document(&xml)?;
        let out = self.cli.run(vec![
            "secret-define".into(),
            "--file".into(),
            doc.path().display().to_string(),
        ])?;

        // "Secret 0b5c...-... created"
        let uuid = out
            .stdout
            .split_whitespace()
            .nth(1)
            .map(str::to_string)
            .ok_or_else(|| {
                VmstorError::Libvirt(format!("Unexpected secret-define output: {}", out.stdout.trim()))
            })?;

        let key = KeyFile::write(passphrase)?;
        self.cli.run(vec![
            "secret-set-value".into(),
            "--secret".into(),
            uuid.clone(),
            "--file".into(),
            key.path().display().to_string(),
            "--plain".into(),
        ])?;

        tracing::debug!(usage = %usage, secret = %uuid, "Defined volume secret");
        Ok(uuid)
    }
}

/// A single libvirt domain reached through `virsh`.
pub struct VirshDomain {
    cli: VirshCli,
    name: String,
}

impl VirshDomain {
    fn device_op(&self, op: &str, def: &DiskDef) -> VmstorResult<()> {
        let doc = temp_document(&def.to_xml())?;
        self.cli.run(vec![
            op.into(),
            self.name.clone(),
            doc.path().display().to_string(),
            "--live".into(),
        ])?;
        Ok(())
    }
}

impl Domain for VirshDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> VmstorResult<String> {
        let out = self.cli.run(vec!["domuuid".into(), self.name.clone()])?;
        Ok(out.stdout.trim().to_string())
    }

    fn state(&self) -> VmstorResult<DomainState> {
        let out = self.cli.run(vec!["domstate".into(), self.name.clone()])?;
        Ok(parse_domain_state(&out.stdout))
    }

    fn live_disks(&self) -> VmstorResult<Vec<LiveDisk>> {
        let out = self
            .cli
            .run(vec!["domblklist".into(), self.name.clone(), "--details".into()])?;
        Ok(parse_domblklist(&out.stdout))
    }

    fn xml_desc(&self) -> VmstorResult<String> {
        Ok(self.cli.run(vec!["dumpxml".into(), self.name.clone()])?.stdout)
    }

    fn attach_device(&self, def: &DiskDef) -> VmstorResult<()> {
        self.device_op("attach-device", def)
    }

    fn detach_device(&self, def: &DiskDef) -> VmstorResult<()> {
        self.device_op("detach-device", def)
    }

    fn create_snapshot(&self, spec: &DomainSnapshotSpec) -> VmstorResult<()> {
        let doc = temp_document(&spec.to_xml())?;
        let mut args = vec![
            "snapshot-create".into(),
            self.name.clone(),
            "--xmlfile".into(),
            doc.path().display().to_string(),
        ];
        if spec.is_disk_only() {
            args.push("--disk-only".into());
        }
        self.cli.run(args)?;
        Ok(())
    }

    fn delete_snapshot(&self, name: &str) -> VmstorResult<()> {
        self.cli
            .run(vec!["snapshot-delete".into(), self.name.clone(), name.into()])?;
        Ok(())
    }

    fn resume(&self) -> VmstorResult<()> {
        self.cli.run(vec!["resume".into(), self.name.clone()])?;
        Ok(())
    }
}

fn parse_domain_state(raw: &str) -> DomainState {
    match raw.trim() {
        "running" => DomainState::Running,
        "paused" => DomainState::Paused,
        "shut off" => DomainState::Shutoff,
        _ => DomainState::Other,
    }
}

fn bus_from_label(label: &str) -> DiskBus {
    if label.starts_with("sd") {
        DiskBus::Scsi
    } else if label.starts_with("hd") {
        DiskBus::Ide
    } else {
        DiskBus::Virtio
    }
}

/// Parse `virsh domblklist --details` output.
fn parse_domblklist(raw: &str) -> Vec<LiveDisk> {
    raw.lines()
        .skip_while(|line| !line.trim_start().starts_with('-'))
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let _kind = cols.next()?;
            let device = match cols.next()? {
                "disk" => DeviceKind::Disk,
                "cdrom" => DeviceKind::Cdrom,
                "floppy" => DeviceKind::Floppy,
                "lun" => DeviceKind::Lun,
                _ => return None,
            };
            let label = cols.next()?.to_string();
            let source = cols.collect::<Vec<_>>().join(" ");
            let path = match source.as_str() {
                "" | "-" => None,
                _ => Some(source),
            };
            Some(LiveDisk {
                bus: bus_from_label(&label),
                label,
                path,
                device,
            })
        })
        .collect()
}

/// Extract `X.Y.Z` following `prefix` and encode it as `X * 1_000_000 + Y * 1_000 + Z`.
pub fn parse_version(output: &str, prefix: &str) -> Option<u64> {
    let line = output.lines().find(|l| l.trim_start().starts_with(prefix))?;
    let version = line.trim_start()[prefix.len()..].split_whitespace().next()?;
    let mut parts = version.split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let micro = parts.next().unwrap_or(Ok(0)).ok()?;
    Some(major * 1_000_000 + minor * 1_000 + micro)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let out = "Compiled against library: libvirt 8.0.0\n\
                   Using library: libvirt 6.0.0\n\
                   Using API: QEMU 8.0.0\n\
                   Running hypervisor: QEMU 4.2.1\n";
        assert_eq!(parse_version(out, "Using library: libvirt"), Some(6_000_000));
        assert_eq!(parse_version(out, "Running hypervisor: QEMU"), Some(4_002_001));
        assert_eq!(parse_version(out, "Running hypervisor: Xen"), None);
        assert_eq!(parse_version("Using library: libvirt 10.1", "Using library: libvirt"), Some(10_001_000));
    }

    #[test]
    fn test_parse_domblklist() {
        let out = " Type   Device   Target   Source\n\
                   ------------------------------------------------------\n \
                   file   disk     vda      /mnt/p1/root.qcow2\n \
                   block  disk     sdb      /dev/mapper/data\n \
                   file   cdrom    hdc      -\n";
        let disks = parse_domblklist(out);
        assert_eq!(disks.len(), 3);
        assert_eq!(disks[0].label, "vda");
        assert_eq!(disks[0].path.as_deref(), Some("/mnt/p1/root.qcow2"));
        assert_eq!(disks[0].bus, DiskBus::Virtio);
        assert_eq!(disks[1].bus, DiskBus::Scsi);
        assert_eq!(disks[2].device, DeviceKind::Cdrom);
        assert_eq!(disks[2].path, None);
    }

    #[test]
    fn test_parse_domain_state() {
        assert_eq!(parse_domain_state("running\n\n"), DomainState::Running);
        assert_eq!(parse_domain_state("shut off"), DomainState::Shutoff);
        assert_eq!(parse_domain_state("paused"), DomainState::Paused);
        assert_eq!(parse_domain_state("crashed"), DomainState::Other);
    }
}
