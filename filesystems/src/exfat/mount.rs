// Mount and unmount of an exFAT volume
// Validates the boot region, builds the root node, discovers the bitmap and
// the upcase table, and maintains the "mounted" volume state bit.

use super::bitmap::ClusterBitmap;
use super::checksum::{vbr_add_checksum, vbr_start_checksum};
use super::node::{Node, NodeArena, NodeData, NodeFlags, NodeId};
use super::structures::{
    cluster_invalid, SuperBlock, EXFAT_SIGNATURE, EXFAT_STATE_MOUNTED, SUPER_BLOCK_SIZE,
};
use super::upcase::UpcaseTable;
use byteorder::{ByteOrder, LittleEndian};
use exfat_core::{Device, ErrorCounter, ExFatError, ExFatResult, MountOptions, OpenMode};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell, RefMut};
use std::path::Path;

/// Why a volume is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadOnlyState {
    /// Requested with the `ro` option.
    Explicit,
    /// `ro_fallback` was given and the device could not be opened read-write.
    Fallback,
}

/// State of one mounted volume. Everything below the public [`ExFat`] API
/// works on this with plain node ids.
pub(crate) struct Volume {
    pub dev: Device,
    pub sb: SuperBlock,
    pub upcase: UpcaseTable,
    pub cmap: ClusterBitmap,
    pub label: String,
    pub zero_cluster: Vec<u8>,
    pub nodes: NodeArena,
    pub root: NodeId,
    pub options: MountOptions,
    pub ro: Option<ReadOnlyState>,
    pub errors: ErrorCounter,
}

impl Volume {
    /// Record an Error-severity event and hand the error back for returning.
    pub(crate) fn fail(&self, err: ExFatError) -> ExFatError {
        error!("{}", err);
        self.errors.record();
        err
    }

    pub(crate) fn check_writable(&self) -> ExFatResult<()> {
        match self.ro {
            Some(_) => Err(ExFatError::ReadOnly),
            None => Ok(()),
        }
    }

    fn rootdir_size(&self) -> ExFatResult<u64> {
        let mut clusters = 0u64;
        let mut cluster = self.sb.rootdir_cluster;
        // The root directory has no CONTIGUOUS flag, its chain is always in the FAT.
        while !cluster_invalid(cluster) {
            if clusters == self.sb.cluster_count as u64 {
                return Err(self.fail(ExFatError::Corrupted(
                    "root directory cannot occupy all clusters".to_string(),
                )));
            }
            clusters += 1;
            cluster = self.next_cluster(self.root, cluster);
        }
        Ok(clusters * self.cluster_size())
    }

    fn verify_vbr_checksum(&self) -> ExFatResult<()> {
        let sector_size = self.sb.sector_size() as usize;
        let mut sector = vec![0u8; sector_size];

        self.dev.read_at(&mut sector, 0);
        let mut vbr_checksum = vbr_start_checksum(&sector);
        for i in 1..11 {
            self.dev.read_at(&mut sector, (i * sector_size) as u64);
            vbr_checksum = vbr_add_checksum(&sector, vbr_checksum);
        }

        self.dev.read_at(&mut sector, (11 * sector_size) as u64);
        for word in sector.chunks_exact(4) {
            let stored = LittleEndian::read_u32(word);
            if stored != vbr_checksum {
                return Err(self.fail(ExFatError::InvalidVolume(format!(
                    "invalid VBR checksum {:#x} (expected {:#x})",
                    stored, vbr_checksum
                ))));
            }
        }
        Ok(())
    }

    fn commit_super_block(&self) -> ExFatResult<()> {
        self.dev.write_at(&self.sb.to_bytes(), 0);
        self.dev.fsync()
    }

    fn prepare_super_block(&mut self) -> ExFatResult<()> {
        if self.sb.is_mounted() {
            warn!("volume was not unmounted cleanly");
        }
        if self.ro.is_some() {
            return Ok(());
        }
        self.sb.volume_state |= EXFAT_STATE_MOUNTED;
        self.commit_super_block()
    }

    fn finalize_super_block(&mut self) -> ExFatResult<()> {
        if self.ro.is_some() {
            return Ok(());
        }
        self.sb.volume_state &= !EXFAT_STATE_MOUNTED;

        // Some implementations set the allocated percentage to 0xff when the
        // volume is created and never touch it again; leave it alone then.
        if self.sb.allocated_percent != 0xff {
            let free = self.count_free_clusters() as u64;
            let total = self.sb.cluster_count as u64;
            if total != 0 {
                self.sb.allocated_percent = (((total - free) * 100 + total / 2) / total) as u8;
            }
        }
        self.commit_super_block()
    }

    /// Release the root reference and drop the whole cache.
    fn teardown(&mut self) {
        let root = self.root;
        self.put_node(root);
        self.reset_cache();
        self.nodes.remove(root);
    }
}

fn check_super_block(sb: &SuperBlock) -> Result<(), ExFatError> {
    if &sb.oem_name != EXFAT_SIGNATURE {
        return Err(ExFatError::InvalidVolume(
            "exFAT file system is not found".to_string(),
        ));
    }
    if sb.version_major != 1 || sb.version_minor != 0 {
        return Err(ExFatError::InvalidVolume(format!(
            "unsupported exFAT version: {}.{}",
            sb.version_major, sb.version_minor
        )));
    }
    if sb.fat_count != 1 {
        return Err(ExFatError::InvalidVolume(format!(
            "unsupported FAT count: {}",
            sb.fat_count
        )));
    }
    // Cluster size is limited to 32 MiB.
    if sb.sector_bits as u32 + sb.spc_bits as u32 > 25 {
        return Err(ExFatError::InvalidVolume(format!(
            "too big cluster size: 2^{}",
            sb.sector_bits as u32 + sb.spc_bits as u32
        )));
    }
    Ok(())
}

/// A mounted exFAT volume.
///
/// All operations take `&self`; the volume is single-threaded and keeps its
/// state behind a `RefCell`. [`Node`] handles borrow the volume, so it can
/// only be unmounted once every handle is gone.
pub struct ExFat {
    volume: RefCell<Volume>,
}

impl ExFat {
    /// Mount the volume on `spec` (a block device or an image file).
    pub fn mount(spec: impl AsRef<Path>, options: MountOptions) -> ExFatResult<Self> {
        let spec = spec.as_ref();
        let errors = ErrorCounter::new();

        let dev = Device::open(spec, options.mode).map_err(|e| {
            errors.record();
            e
        })?;
        let ro = match (dev.mode(), options.mode) {
            (OpenMode::ReadOnly, OpenMode::Any) => Some(ReadOnlyState::Fallback),
            (OpenMode::ReadOnly, _) => Some(ReadOnlyState::Explicit),
            _ => None,
        };

        let mut sector = [0u8; SUPER_BLOCK_SIZE];
        dev.read_at(&mut sector, 0);
        let sb = SuperBlock::parse(&sector);
        if let Err(e) = check_super_block(&sb) {
            error!("{}", e);
            errors.record();
            let _ = dev.close();
            return Err(e);
        }

        let mut nodes = NodeArena::default();
        let root = nodes.insert(NodeData::new());
        let zero_cluster = vec![0u8; sb.cluster_size() as usize];

        let mut volume = Volume {
            dev,
            sb,
            upcase: UpcaseTable::default(),
            cmap: ClusterBitmap::default(),
            label: String::new(),
            zero_cluster,
            nodes,
            root,
            options,
            ro,
            errors,
        };

        if let Err(e) = volume.verify_vbr_checksum() {
            let _ = volume.dev.close();
            return Err(e);
        }
        if volume.sb.volume_size() > volume.dev.size() {
            let e = volume.fail(ExFatError::InvalidVolume(format!(
                "file system in sectors is larger than device ({} > {} bytes)",
                volume.sb.volume_size(),
                volume.dev.size()
            )));
            let _ = volume.dev.close();
            return Err(e);
        }

        {
            let start_cluster = volume.sb.rootdir_cluster;
            let node = &mut volume.nodes[root];
            node.flags = NodeFlags::DIR;
            node.start_cluster = start_cluster;
            node.fptr_cluster = start_cluster;
            // exFAT keeps no timestamps for the root directory.
            node.mtime = 0;
            node.atime = 0;
        }
        let size = match volume.rootdir_size() {
            Ok(size) => size,
            Err(e) => {
                volume.nodes.remove(root);
                let _ = volume.dev.close();
                return Err(e);
            }
        };
        volume.nodes[root].size = size;
        // The root node always holds one reference.
        volume.get_node(root);

        if let Err(e) = volume
            .discover(root)
            .and_then(|_| volume.prepare_super_block())
        {
            volume.teardown();
            let _ = volume.dev.close();
            return Err(e);
        }

        info!(
            "mounted `{}': exFAT {}.{}, {} byte sectors, {} byte clusters, {} clusters",
            spec.display(),
            volume.sb.version_major,
            volume.sb.version_minor,
            volume.sb.sector_size(),
            volume.cluster_size(),
            volume.sb.cluster_count
        );

        Ok(Self {
            volume: RefCell::new(volume),
        })
    }

    /// Mount with a comma-separated option string, e.g. `"ro,noatime"`.
    pub fn mount_with(spec: impl AsRef<Path>, options: &str) -> ExFatResult<Self> {
        Self::mount(spec, MountOptions::parse(options))
    }

    /// Flush everything, clear the mounted bit and close the device.
    pub fn unmount(self) -> ExFatResult<()> {
        let mut volume = self.volume.into_inner();
        volume.teardown();
        if volume.cmap.is_dirty() && volume.ro.is_none() {
            volume.flush_cmap();
        }
        let result = volume.finalize_super_block();
        volume.dev.close()?;
        debug!("unmounted");
        result
    }

    pub(crate) fn volume(&self) -> Ref<'_, Volume> {
        self.volume.borrow()
    }

    pub(crate) fn volume_mut(&self) -> RefMut<'_, Volume> {
        self.volume.borrow_mut()
    }

    pub(crate) fn try_volume_mut(&self) -> Option<RefMut<'_, Volume>> {
        self.volume.try_borrow_mut().ok()
    }

    /// Wrap a node id after taking a reference on it.
    pub(crate) fn handle(&self, id: NodeId) -> Node<'_> {
        self.volume_mut().get_node(id);
        Node::from_referenced(self, id)
    }

    pub fn root(&self) -> Node<'_> {
        let root = self.volume().root;
        self.handle(root)
    }

    /// Number of Error-severity events seen since mount.
    pub fn error_count(&self) -> u32 {
        self.volume().errors.get()
    }

    pub fn read_only(&self) -> Option<ReadOnlyState> {
        self.volume().ro
    }

    pub fn is_read_only(&self) -> bool {
        self.volume().ro.is_some()
    }

    pub fn options(&self) -> MountOptions {
        self.volume().options.clone()
    }

    pub fn super_block(&self) -> SuperBlock {
        self.volume().sb.clone()
    }

    pub fn cluster_size(&self) -> u64 {
        self.volume().cluster_size()
    }

    pub fn count_free_clusters(&self) -> u32 {
        self.volume().count_free_clusters()
    }

    /// Next run of used sectors, see [`ExFat::used_sector_ranges`].
    pub fn find_used_sectors(&self, previous: Option<(u64, u64)>) -> Option<(u64, u64)> {
        self.volume().find_used_sectors(previous)
    }

    /// All runs of used sectors as inclusive `(first, last)` pairs.
    pub fn used_sector_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        let mut previous = None;
        while let Some(range) = self.find_used_sectors(previous) {
            ranges.push(range);
            previous = Some(range);
        }
        ranges
    }

    pub fn info(&self) -> VolumeInfo {
        let volume = self.volume();
        VolumeInfo::new(&volume.sb, volume.count_free_clusters())
    }

    /// Write back the bitmap and flush the device.
    pub fn sync(&self) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        if volume.ro.is_some() {
            return Ok(());
        }
        if volume.cmap.is_dirty() {
            volume.flush_cmap();
        }
        volume.dev.fsync()
    }
}

/// Volume summary as printed by a dump utility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub version_major: u8,
    pub version_minor: u8,
    pub sector_size: u64,
    pub cluster_size: u64,
    pub volume_size: u64,
    pub used_space: u64,
    pub available_space: u64,
    pub free_clusters: u32,
    pub volume_serial: u32,
}

impl VolumeInfo {
    pub fn new(sb: &SuperBlock, free_clusters: u32) -> Self {
        let volume_size = sb.volume_size();
        let available_space = free_clusters as u64 * sb.cluster_size();
        Self {
            version_major: sb.version_major,
            version_minor: sb.version_minor,
            sector_size: sb.sector_size(),
            cluster_size: sb.cluster_size(),
            volume_size,
            used_space: volume_size.saturating_sub(available_space),
            available_space,
            free_clusters,
            volume_serial: sb.volume_serial,
        }
    }
}

impl std::fmt::Display for VolumeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let row = |f: &mut std::fmt::Formatter<'_>, title: &str, bytes: u64| {
            let (value, unit) = humanize_bytes(bytes);
            writeln!(f, "{:<20} {:>10} {}", title, value, unit)
        };
        writeln!(
            f,
            "File system version           {}.{}",
            self.version_major, self.version_minor
        )?;
        row(f, "Sector size", self.sector_size)?;
        row(f, "Cluster size", self.cluster_size)?;
        row(f, "Volume size", self.volume_size)?;
        row(f, "Used space", self.used_space)?;
        row(f, "Available space", self.available_space)
    }
}

/// Round a byte count to the largest unit that keeps it readable.
///
/// Exact multiples move on to the next unit; otherwise values under 10240
/// stay in the current one.
pub fn humanize_bytes(value: u64) -> (u64, &'static str) {
    const UNITS: [&str; 7] = ["bytes", "KB", "MB", "GB", "TB", "PB", "EB"];
    let value = value as u128;
    let mut divisor: u128 = 1;
    let mut temp = 0;
    let mut unit = 0;

    while unit < UNITS.len() - 1 {
        temp = (value + divisor / 2) / divisor;
        if temp == 0 {
            break;
        }
        if temp % 1024 != 0 && temp < 10240 {
            break;
        }
        divisor *= 1024;
        unit += 1;
    }
    if unit == UNITS.len() - 1 {
        temp = (value + divisor / 2) / divisor;
    }
    (temp as u64, UNITS[unit])
}
