//! Block-device formatting, mounting and resizing on the node.
//!
//! All host mutations shell out through "command-manager" the way the
//! fleet tooling does; filesystem signature probing reads the superblock
//! region directly so an already-formatted device is never clobbered.

use std::{
    collections::HashMap,
    io::Read,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use crate::errors::{Error, Result};

/// Volume-context keys understood by the format path. The controller puts
/// them into the CreateVolume response context; the node consumes them.
pub const CTX_FS_TYPE: &str = "fsType";
pub const CTX_BLOCK_SIZE: &str = "blockSize";
pub const CTX_INODE_SIZE: &str = "inodeSize";
pub const CTX_BYTES_PER_INODE: &str = "bytesPerInode";
pub const CTX_NUMBER_OF_INODES: &str = "numberOfInodes";
pub const CTX_BIG_ALLOC: &str = "ext4BigAlloc";
pub const CTX_CLUSTER_SIZE: &str = "ext4ClusterSize";
pub const CTX_BLOCK_ATTACH_UNTIL_INITIALIZED: &str = "blockAttachUntilInitialized";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Ntfs,
}

impl FsType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ext2" => Ok(FsType::Ext2),
            "ext3" => Ok(FsType::Ext3),
            "ext4" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            "ntfs" => Ok(FsType::Ntfs),
            other => Err(Error::invalid_argument(format!(
                "unknown fsType '{}' (supported: ext2, ext3, ext4, xfs, ntfs)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
            FsType::Ntfs => "ntfs",
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FsType::Ext2 | FsType::Ext3 | FsType::Ext4)
    }

    /// Mount options applied on every mount of this filesystem.
    pub fn default_mount_options(&self) -> &'static [&'static str] {
        match self {
            // EBS clones and snapshot restores carry duplicate XFS UUIDs
            FsType::Xfs => &["nouuid"],
            _ => &[],
        }
    }
}

/// Format options accepted per filesystem; anything else is rejected with
/// `InvalidArgument` before a device is touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatOptions {
    pub block_size: Option<u64>,
    pub inode_size: Option<u64>,
    pub bytes_per_inode: Option<u64>,
    pub number_of_inodes: Option<u64>,
    pub big_alloc: bool,
    pub cluster_size: Option<u64>,
}

impl FormatOptions {
    /// Builds options from the volume context, enforcing the per-fs
    /// allow-list.
    pub fn from_context(fs: FsType, ctx: &HashMap<String, String>) -> Result<Self> {
        let mut opts = FormatOptions::default();

        if let Some(v) = ctx.get(CTX_BLOCK_SIZE) {
            // every supported filesystem takes a block size; for ntfs it is
            // the allocation unit
            opts.block_size = Some(parse_u64(CTX_BLOCK_SIZE, v)?);
        }
        if let Some(v) = ctx.get(CTX_INODE_SIZE) {
            if !fs.is_ext() {
                return Err(incompatible(CTX_INODE_SIZE, fs));
            }
            opts.inode_size = Some(parse_u64(CTX_INODE_SIZE, v)?);
        }
        if let Some(v) = ctx.get(CTX_BYTES_PER_INODE) {
            if !fs.is_ext() {
                return Err(incompatible(CTX_BYTES_PER_INODE, fs));
            }
            opts.bytes_per_inode = Some(parse_u64(CTX_BYTES_PER_INODE, v)?);
        }
        if let Some(v) = ctx.get(CTX_NUMBER_OF_INODES) {
            if !fs.is_ext() {
                return Err(incompatible(CTX_NUMBER_OF_INODES, fs));
            }
            opts.number_of_inodes = Some(parse_u64(CTX_NUMBER_OF_INODES, v)?);
        }
        if let Some(v) = ctx.get(CTX_BIG_ALLOC) {
            if !fs.is_ext() {
                return Err(incompatible(CTX_BIG_ALLOC, fs));
            }
            opts.big_alloc = v == "true";
        }
        if let Some(v) = ctx.get(CTX_CLUSTER_SIZE) {
            if !fs.is_ext() {
                return Err(incompatible(CTX_CLUSTER_SIZE, fs));
            }
            opts.cluster_size = Some(parse_u64(CTX_CLUSTER_SIZE, v)?);
        }

        Ok(opts)
    }
}

fn incompatible(key: &str, fs: FsType) -> Error {
    Error::invalid_argument(format!(
        "format option '{}' is not supported for '{}'",
        key,
        fs.as_str()
    ))
}

fn parse_u64(key: &str, v: &str) -> Result<u64> {
    v.parse::<u64>()
        .map_err(|_| Error::invalid_argument(format!("format option '{}'='{}' is not a number", key, v)))
}

/// Effective inode count for a volume formatted with "bytes_per_inode".
pub fn inode_count(volume_bytes: u64, bytes_per_inode: u64) -> u64 {
    volume_bytes / bytes_per_inode
}

/// The full mkfs command line for a device, per-fs flag spelling included.
pub fn mkfs_invocation(
    fs: FsType,
    device: &Path,
    opts: &FormatOptions,
    volume_bytes: Option<u64>,
) -> String {
    let mut cmd = format!("mkfs.{}", fs.as_str());

    match fs {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            if let Some(bs) = opts.block_size {
                cmd.push_str(&format!(" -b {}", bs));
            }
            if let Some(is) = opts.inode_size {
                cmd.push_str(&format!(" -I {}", is));
            }
            if let Some(n) = opts.number_of_inodes {
                cmd.push_str(&format!(" -N {}", n));
            } else if let Some(bpi) = opts.bytes_per_inode {
                match volume_bytes {
                    Some(total) => cmd.push_str(&format!(" -N {}", inode_count(total, bpi))),
                    None => cmd.push_str(&format!(" -i {}", bpi)),
                }
            }
            if opts.big_alloc {
                cmd.push_str(" -O bigalloc");
            }
            if let Some(cs) = opts.cluster_size {
                cmd.push_str(&format!(" -C {}", cs));
            }
        }
        FsType::Xfs => {
            if let Some(bs) = opts.block_size {
                cmd.push_str(&format!(" -b size={}", bs));
            }
        }
        FsType::Ntfs => {
            if let Some(au) = opts.block_size {
                cmd.push_str(&format!(" -c {}", au));
            }
        }
    }

    cmd.push(' ');
    cmd.push_str(&device.to_string_lossy());
    cmd
}

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Parses /proc/mounts content. Octal-escaped spaces in paths are decoded.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        entries.push(MountEntry {
            source: unescape(fields[0]),
            target: unescape(fields[1]),
            fs_type: fields[2].to_string(),
            options: fields[3].split(',').map(str::to_string).collect(),
        });
    }
    entries
}

fn unescape(s: &str) -> String {
    s.replace("\\040", " ").replace("\\011", "\t")
}

/// Filesystem usage as reported for a mounted path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub used_inodes: u64,
}

/// The node-side mount surface. The system implementation drives the real
/// host; tests substitute a recording fake.
#[async_trait]
pub trait Mount: Send + Sync {
    /// Creates a filesystem on the device. The caller has already verified
    /// the device carries no signature.
    async fn format(
        &self,
        device: &Path,
        fs: FsType,
        opts: &FormatOptions,
        volume_bytes: Option<u64>,
    ) -> Result<()>;

    /// Mounts a device at a target path.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs: Option<FsType>,
        options: &[String],
    ) -> Result<()>;

    /// Bind-mounts a staged path (or device node) onto the target.
    async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Finds the mount entry whose target is "path".
    async fn find_mount(&self, path: &Path) -> Result<Option<MountEntry>>;

    /// Filesystem family ("ext", "xfs", "ntfs") already present on the
    /// device, if any. The ext generations share one magic and are not
    /// distinguished.
    async fn detect_filesystem(&self, device: &Path) -> Result<Option<&'static str>>;

    /// Grows the filesystem mounted at "mount_point" to fill its device.
    async fn resize(&self, device: &Path, mount_point: &Path, fs: FsType) -> Result<()>;

    async fn fs_stats(&self, path: &Path) -> Result<FsStats>;

    /// Size of a block device in bytes.
    async fn device_size_bytes(&self, device: &Path) -> Result<u64>;
}

/// Drives the host through shelled commands and direct superblock reads.
pub struct SystemMounter {
    mounts_path: PathBuf,
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self {
            mounts_path: PathBuf::from("/proc/mounts"),
        }
    }
}

impl SystemMounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_mounts_path(mounts_path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: mounts_path.into(),
        }
    }
}

async fn run(cmd: String) -> Result<(String, String)> {
    log::debug!("running '{}'", cmd);
    tokio::task::spawn_blocking(move || command_manager::run(&cmd))
        .await
        .map_err(|e| Error::Other {
            message: format!("command task panicked {:?}", e),
            retryable: false,
        })?
        .map_err(|e| Error::Other {
            message: format!("command failed {:?}", e),
            retryable: false,
        })
}

#[async_trait]
impl Mount for SystemMounter {
    async fn format(
        &self,
        device: &Path,
        fs: FsType,
        opts: &FormatOptions,
        volume_bytes: Option<u64>,
    ) -> Result<()> {
        let cmd = mkfs_invocation(fs, device, opts, volume_bytes);
        log::info!("formatting '{}' as {}", device.display(), fs.as_str());
        run(cmd).await?;
        Ok(())
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs: Option<FsType>,
        options: &[String],
    ) -> Result<()> {
        let mut cmd = String::from("mount");
        if let Some(fs) = fs {
            cmd.push_str(&format!(" -t {}", fs.as_str()));
        }
        let mut opts: Vec<String> = options.to_vec();
        if let Some(fs) = fs {
            for d in fs.default_mount_options() {
                if !opts.iter().any(|o| o == d) {
                    opts.push((*d).to_string());
                }
            }
        }
        if !opts.is_empty() {
            cmd.push_str(&format!(" -o {}", opts.join(",")));
        }
        cmd.push_str(&format!(
            " {} {}",
            source.to_string_lossy(),
            target.to_string_lossy()
        ));

        log::info!("mounting '{}' at '{}'", source.display(), target.display());
        match run(cmd).await {
            Ok(_) => Ok(()),
            // a repeated stage of an already-mounted device must stay
            // idempotent
            Err(e) if e.message().contains("already mounted") => {
                log::warn!("ignoring the 'already mounted' error '{}'", e.message());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
        run(format!(
            "mount --bind {} {}",
            source.to_string_lossy(),
            target.to_string_lossy()
        ))
        .await?;
        if readonly {
            // a bind mount only honors ro on remount
            run(format!(
                "mount -o remount,ro,bind {}",
                target.to_string_lossy()
            ))
            .await?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        log::info!("unmounting '{}'", target.display());
        match run(format!("umount {}", target.to_string_lossy())).await {
            Ok(_) => Ok(()),
            Err(e) if e.message().contains("not mounted") => {
                log::warn!("ignoring the 'not mounted' error '{}'", e.message());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn find_mount(&self, path: &Path) -> Result<Option<MountEntry>> {
        let content =
            std::fs::read_to_string(&self.mounts_path).map_err(|e| Error::Other {
                message: format!("failed to read {:?} {:?}", self.mounts_path, e),
                retryable: false,
            })?;
        let target = path.to_string_lossy();
        Ok(parse_mounts(&content)
            .into_iter()
            .find(|m| m.target == target))
    }

    async fn detect_filesystem(&self, device: &Path) -> Result<Option<&'static str>> {
        let device = device.to_path_buf();
        tokio::task::spawn_blocking(move || probe_signature(&device))
            .await
            .map_err(|e| Error::Other {
                message: format!("probe task panicked {:?}", e),
                retryable: false,
            })?
    }

    async fn resize(&self, device: &Path, mount_point: &Path, fs: FsType) -> Result<()> {
        // refresh the kernel's view of the device before growing
        let _ = run(format!("blockdev --rereadpt {}", device.to_string_lossy())).await;

        let cmd = match fs {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
                format!("resize2fs {}", device.to_string_lossy())
            }
            FsType::Xfs => format!("xfs_growfs {}", mount_point.to_string_lossy()),
            FsType::Ntfs => format!("ntfsresize -f {}", device.to_string_lossy()),
        };
        log::info!(
            "resizing {} filesystem on '{}'",
            fs.as_str(),
            device.display()
        );
        run(cmd).await?;
        Ok(())
    }

    async fn fs_stats(&self, path: &Path) -> Result<FsStats> {
        let (out, _) = run(format!(
            "stat -f -c '%S %b %f %a %c %d' {}",
            path.to_string_lossy()
        ))
        .await?;
        parse_fs_stats(&out)
    }

    async fn device_size_bytes(&self, device: &Path) -> Result<u64> {
        let (out, _) = run(format!(
            "blockdev --getsize64 {}",
            device.to_string_lossy()
        ))
        .await?;
        out.trim().parse::<u64>().map_err(|e| Error::Other {
            message: format!("unexpected blockdev output '{}' ({})", out.trim(), e),
            retryable: false,
        })
    }
}

fn parse_fs_stats(out: &str) -> Result<FsStats> {
    let fields: Vec<u64> = out
        .split_whitespace()
        .filter_map(|f| f.parse::<u64>().ok())
        .collect();
    if fields.len() != 6 {
        return Err(Error::Other {
            message: format!("unexpected stat output '{}'", out.trim()),
            retryable: false,
        });
    }
    let (bs, total, free, avail, inodes, inodes_free) = (
        fields[0], fields[1], fields[2], fields[3], fields[4], fields[5],
    );
    Ok(FsStats {
        total_bytes: total * bs,
        available_bytes: avail * bs,
        used_bytes: total.saturating_sub(free) * bs,
        total_inodes: inodes,
        free_inodes: inodes_free,
        used_inodes: inodes.saturating_sub(inodes_free),
    })
}

// magic offsets within the first superblock region
const EXT_MAGIC_OFFSET: usize = 0x438;
const EXT_MAGIC: [u8; 2] = [0x53, 0xef];
const XFS_MAGIC: &[u8; 4] = b"XFSB";
const NTFS_MAGIC: &[u8; 8] = b"NTFS    ";

/// Reads the first superblock region and matches known signatures.
fn probe_signature(device: &Path) -> Result<Option<&'static str>> {
    let mut f = std::fs::File::open(device).map_err(|e| Error::Other {
        message: format!("failed to open {:?} {:?}", device, e),
        retryable: false,
    })?;

    let mut buf = vec![0u8; 4096];
    let mut read = 0;
    loop {
        match f.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => {
                return Err(Error::Other {
                    message: format!("failed to read {:?} {:?}", device, e),
                    retryable: false,
                })
            }
        }
        if read == buf.len() {
            break;
        }
    }
    let buf = &buf[..read];

    if buf.len() >= 4 && &buf[..4] == XFS_MAGIC {
        return Ok(Some("xfs"));
    }
    if buf.len() >= 11 && &buf[3..11] == NTFS_MAGIC {
        return Ok(Some("ntfs"));
    }
    if buf.len() >= EXT_MAGIC_OFFSET + 2 && buf[EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2] == EXT_MAGIC
    {
        return Ok(Some("ext"));
    }
    Ok(None)
}

/// True when an on-disk signature is compatible with the requested fs.
pub fn signature_matches(found: &str, requested: FsType) -> bool {
    match requested {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => found == "ext",
        FsType::Xfs => found == "xfs",
        FsType::Ntfs => found == "ntfs",
    }
}
