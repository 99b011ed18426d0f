//! Disk device definitions and their libvirt XML rendering.

use std::fmt::Write as _;

use vmstor_shared::descriptor::{CacheMode, DiskBus, ImageFormat, IoLimits, RateLimit, positive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProtocol {
    Rbd,
    Gluster,
}

impl NetworkProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkProtocol::Rbd => "rbd",
            NetworkProtocol::Gluster => "gluster",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAuth {
    pub username: String,
    /// UUID of the libvirt secret holding the key.
    pub secret_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    File {
        path: String,
    },
    Block {
        dev: String,
    },
    Network {
        protocol: NetworkProtocol,
        /// `pool/image` for rbd, `volume/path` for gluster
        name: String,
        hosts: Vec<(String, u16)>,
        auth: Option<NetworkAuth>,
    },
}

impl DiskSource {
    /// The value the hypervisor reports as this device's source.
    pub fn path(&self) -> &str {
        match self {
            DiskSource::File { path } => path,
            DiskSource::Block { dev } => dev,
            DiskSource::Network { name, .. } => name,
        }
    }

    fn disk_type(&self) -> &'static str {
        match self {
            DiskSource::File { .. } => "file",
            DiskSource::Block { .. } => "block",
            DiskSource::Network { .. } => "network",
        }
    }
}

/// Fully decorated disk device, ready to attach or detach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDef {
    pub source: DiskSource,
    pub target_dev: String,
    pub bus: DiskBus,
    pub format: ImageFormat,
    pub serial: Option<String>,
    pub cache_mode: Option<CacheMode>,
    pub discard_unmap: bool,
    /// `native`, `threads` or `io_uring`
    pub io_policy: Option<String>,
    pub io_limits: IoLimits,
    /// LUKS secret UUID for encrypted volumes.
    pub encryption_secret: Option<String>,
    pub shareable: bool,
    pub dedup: bool,
    pub logical_block_size: Option<u32>,
    pub physical_block_size: Option<u32>,
}

impl DiskDef {
    pub fn new(source: DiskSource, target_dev: String, bus: DiskBus, format: ImageFormat) -> Self {
        Self {
            source,
            target_dev,
            bus,
            format,
            serial: None,
            cache_mode: None,
            discard_unmap: false,
            io_policy: None,
            io_limits: IoLimits::default(),
            encryption_secret: None,
            shareable: false,
            dedup: false,
            logical_block_size: None,
            physical_block_size: None,
        }
    }

    pub fn source_path(&self) -> &str {
        self.source.path()
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        let _ = writeln!(
            xml,
            "<disk type='{}' device='disk'>",
            self.source.disk_type()
        );

        let mut driver = format!("<driver name='qemu' type='{}'", self.format.as_str());
        if let Some(cache) = self.cache_mode {
            let _ = write!(driver, " cache='{}'", cache.as_str());
        }
        if self.discard_unmap {
            driver.push_str(" discard='unmap'");
        }
        if self.dedup {
            driver.push_str(" detect_zeroes='on'");
        }
        if let Some(io) = &self.io_policy {
            let _ = write!(driver, " io='{}'", escape(io));
        }
        driver.push_str("/>");
        let _ = writeln!(xml, "  {}", driver);

        match &self.source {
            DiskSource::File { path } => {
                let _ = writeln!(xml, "  <source file='{}'/>", escape(path));
            }
            DiskSource::Block { dev } => {
                let _ = writeln!(xml, "  <source dev='{}'/>", escape(dev));
            }
            DiskSource::Network {
                protocol,
                name,
                hosts,
                auth,
            } => {
                let _ = writeln!(
                    xml,
                    "  <source protocol='{}' name='{}'>",
                    protocol.as_str(),
                    escape(name)
                );
                for (host, port) in hosts {
                    let _ = writeln!(xml, "    <host name='{}' port='{}'/>", escape(host), port);
                }
                xml.push_str("  </source>\n");
                if let Some(auth) = auth {
                    let _ = writeln!(xml, "  <auth username='{}'>", escape(&auth.username));
                    let _ = writeln!(
                        xml,
                        "    <secret type='ceph' uuid='{}'/>",
                        escape(&auth.secret_uuid)
                    );
                    xml.push_str("  </auth>\n");
                }
            }
        }

        let _ = writeln!(
            xml,
            "  <target dev='{}' bus='{}'/>",
            escape(&self.target_dev),
            self.bus.as_str()
        );

        if let Some(serial) = &self.serial {
            let _ = writeln!(xml, "  <serial>{}</serial>", escape(serial));
        }

        if self.logical_block_size.is_some() || self.physical_block_size.is_some() {
            xml.push_str("  <blockio");
            if let Some(size) = self.logical_block_size {
                let _ = write!(xml, " logical_block_size='{}'", size);
            }
            if let Some(size) = self.physical_block_size {
                let _ = write!(xml, " physical_block_size='{}'", size);
            }
            xml.push_str("/>\n");
        }

        if !self.io_limits.is_empty() {
            xml.push_str("  <iotune>\n");
            push_limit(&mut xml, "read_bytes_sec", &self.io_limits.bytes_read);
            push_limit(&mut xml, "write_bytes_sec", &self.io_limits.bytes_write);
            push_limit(&mut xml, "read_iops_sec", &self.io_limits.iops_read);
            push_limit(&mut xml, "write_iops_sec", &self.io_limits.iops_write);
            xml.push_str("  </iotune>\n");
        }

        if let Some(secret) = &self.encryption_secret {
            xml.push_str("  <encryption format='luks'>\n");
            let _ = writeln!(
                xml,
                "    <secret type='passphrase' uuid='{}'/>",
                escape(secret)
            );
            xml.push_str("  </encryption>\n");
        }

        if self.shareable {
            xml.push_str("  <shareable/>\n");
        }

        xml.push_str("</disk>\n");
        xml
    }
}

fn push_limit(xml: &mut String, name: &str, limit: &RateLimit) {
    if let Some(rate) = positive(limit.rate) {
        let _ = writeln!(xml, "    <{name}>{rate}</{name}>");
    }
    if let Some(max) = positive(limit.max) {
        let _ = writeln!(xml, "    <{name}_max>{max}</{name}_max>");
    }
    if let Some(len) = positive(limit.max_length) {
        let _ = writeln!(xml, "    <{name}_max_length>{len}</{name}_max_length>");
    }
}

pub(crate) fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

/// Guest device label for a slot index: 0 -> `vda`, 25 -> `vdz`, 26 -> `vdaa`.
pub fn device_label(bus: DiskBus, index: u32) -> String {
    let mut suffix = Vec::new();
    let mut n = index;
    loop {
        suffix.push(char::from(b'a' + (n % 26) as u8));
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    let mut label = bus.device_prefix().to_string();
    label.extend(suffix.iter().rev());
    label
}
