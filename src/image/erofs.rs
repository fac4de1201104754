//! Minimal read-only EROFS walker.
//!
//! Just enough of the format to pull `build.prop`-style files out of a
//! system image: superblock, compact/extended inodes, flat and inline
//! data layouts, single-block LZ4 compression and directory walking.
//! The chunk-based layout and the full compression index are out of scope.
//!
//! Lookup failures and out-of-range fields yield empty results rather
//! than errors; a damaged image never aborts the caller.

use std::collections::BTreeMap;

use log::debug;

use crate::codec::lz4;

/// EROFS superblock magic, found at byte offset 1024.
pub const EROFS_MAGIC: u32 = 0xE0F5E1E2;

/// Byte offset of the superblock within an image.
const SUPERBLOCK_OFFSET: usize = 1024;

/// Inode record size for compact inodes.
const INODE_SIZE: u64 = 32;

/// Conventional locations of Android property files.
const BUILD_PROP_PATHS: &[&str] = &[
    "system/build.prop",
    "build.prop",
    "default.prop",
    "vendor/build.prop",
    "product/build.prop",
];

/// Inode data layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    /// Contiguous blocks at `raw_blkaddr`.
    FlatPlain,
    /// LZ4-compressed, full index.
    CompressedFull,
    /// Data inline after the inode record.
    FlatInline,
    /// LZ4-compressed, compact index.
    CompressedCompact,
    /// Chunk-based mapping (unsupported).
    ChunkBased,
}

impl DataLayout {
    fn from_bits(bits: u16) -> Self {
        match bits {
            0 => Self::FlatPlain,
            1 => Self::CompressedFull,
            2 => Self::FlatInline,
            3 => Self::CompressedCompact,
            _ => Self::ChunkBased,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Inode {
    nid: u64,
    layout: DataLayout,
    compact: bool,
    size: u32,
    raw_blkaddr: u32,
}

/// Parsed EROFS image over a borrowed byte buffer.
pub struct ErofsImage<'a> {
    data: &'a [u8],
    block_size: u32,
    root_nid: u64,
    meta_blkaddr: u32,
    volume_name: String,
}

impl<'a> ErofsImage<'a> {
    /// True when `data` carries the EROFS magic at offset 1024.
    pub fn is_erofs(data: &[u8]) -> bool {
        data.len() >= SUPERBLOCK_OFFSET + 4
            && u32::from_le_bytes([
                data[SUPERBLOCK_OFFSET],
                data[SUPERBLOCK_OFFSET + 1],
                data[SUPERBLOCK_OFFSET + 2],
                data[SUPERBLOCK_OFFSET + 3],
            ]) == EROFS_MAGIC
    }

    /// Parse the superblock. Returns `None` when the magic is absent.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if !Self::is_erofs(data) || data.len() < SUPERBLOCK_OFFSET + 64 {
            return None;
        }

        let sb = &data[SUPERBLOCK_OFFSET..];
        let blkszbits = sb[8];
        if blkszbits >= 32 {
            return None;
        }
        let block_size = 1u32 << blkszbits;
        let root_nid = u64::from(u16::from_le_bytes([sb[10], sb[11]]));
        let meta_blkaddr = u32::from_le_bytes([sb[24], sb[25], sb[26], sb[27]]);

        // Volume label is ISO-8859-1, NUL padded
        let volume_name: String = sb[48..64]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();

        debug!(
            "EROFS: block_size={block_size}, root_nid={root_nid}, \
             meta_blkaddr={meta_blkaddr}, vol={volume_name:?}"
        );

        Some(Self {
            data,
            block_size,
            root_nid,
            meta_blkaddr,
            volume_name,
        })
    }

    /// Filesystem block size.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Volume label from the superblock.
    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    /// Byte offset of an inode record.
    ///
    /// Images with a populated `meta_blkaddr` place inodes at
    /// `meta_blkaddr * block_size + nid * 32`; images without one fall
    /// back to the flat `1024 + nid * 32` layout.
    fn inode_offset(&self, nid: u64) -> u64 {
        if self.meta_blkaddr != 0 {
            u64::from(self.meta_blkaddr) * u64::from(self.block_size) + nid * INODE_SIZE
        } else {
            SUPERBLOCK_OFFSET as u64 + nid * INODE_SIZE
        }
    }

    fn read_inode(&self, nid: u64) -> Option<Inode> {
        let offset = self.inode_offset(nid);
        let offset = usize::try_from(offset).ok()?;
        if offset + INODE_SIZE as usize > self.data.len() {
            return None;
        }

        let d = &self.data[offset..];
        let format = u16::from_le_bytes([d[0], d[1]]);
        let layout = DataLayout::from_bits((format >> 1) & 0x7);
        let compact = format & 1 == 0;
        let size = u32::from_le_bytes([d[8], d[9], d[10], d[11]]);
        let raw_blkaddr = u32::from_le_bytes([d[16], d[17], d[18], d[19]]);

        Some(Inode {
            nid,
            layout,
            compact,
            size,
            raw_blkaddr,
        })
    }

    fn read_inode_data(&self, inode: &Inode) -> Vec<u8> {
        let size = inode.size as usize;
        if size == 0 {
            return Vec::new();
        }

        match inode.layout {
            DataLayout::FlatPlain => {
                let offset = inode.raw_blkaddr as usize * self.block_size as usize;
                match self.data.get(offset..offset + size) {
                    Some(slice) => slice.to_vec(),
                    None => Vec::new(),
                }
            }
            DataLayout::FlatInline => {
                let record = if inode.compact { 32 } else { 64 };
                let offset = self.inode_offset(inode.nid) as usize + record;
                match self.data.get(offset..offset + size) {
                    Some(slice) => slice.to_vec(),
                    None => Vec::new(),
                }
            }
            DataLayout::CompressedFull | DataLayout::CompressedCompact => {
                let offset = inode.raw_blkaddr as usize * self.block_size as usize;
                match self.data.get(offset..offset + self.block_size as usize) {
                    Some(block) => lz4::decompress_block(block, size),
                    None => Vec::new(),
                }
            }
            DataLayout::ChunkBased => Vec::new(),
        }
    }

    /// Directory entries of `nid` as `(name, child_nid)`, excluding
    /// `.` and `..`.
    fn read_directory(&self, nid: u64) -> Vec<(String, u64)> {
        let Some(inode) = self.read_inode(nid) else {
            return Vec::new();
        };
        let data = self.read_inode_data(&inode);
        if data.len() < 12 {
            return Vec::new();
        }

        // The name region begins where the first entry's name does, which
        // bounds the number of 12-byte dirent records.
        let first_name_off = usize::from(u16::from_le_bytes([data[8], data[9]]));
        let count = first_name_off / 12;
        if count == 0 || count * 12 > data.len() {
            return Vec::new();
        }

        let name_off_of = |idx: usize| -> usize {
            usize::from(u16::from_le_bytes([data[idx * 12 + 8], data[idx * 12 + 9]]))
        };

        let mut entries = Vec::new();
        for i in 0..count {
            let base = i * 12;
            let child_nid = u64::from_le_bytes([
                data[base],
                data[base + 1],
                data[base + 2],
                data[base + 3],
                data[base + 4],
                data[base + 5],
                data[base + 6],
                data[base + 7],
            ]);
            let name_off = name_off_of(i);
            let name_end = if i + 1 < count {
                name_off_of(i + 1)
            } else {
                data.len()
            };

            if name_off >= name_end || name_end > data.len() || name_end - name_off >= 256 {
                continue;
            }

            let name = String::from_utf8_lossy(&data[name_off..name_end]).into_owned();
            if name != "." && name != ".." {
                entries.push((name, child_nid));
            }
        }
        entries
    }

    /// Resolve a `/`-separated path to an inode number.
    pub fn find(&self, path: &str) -> Option<u64> {
        let mut nid = self.root_nid;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            nid = self
                .read_directory(nid)
                .into_iter()
                .find(|(name, _)| name == part)?
                .1;
        }
        Some(nid)
    }

    /// True when `path` resolves to an inode.
    pub fn file_exists(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// Read a file's content. Missing or unreadable files yield empty.
    pub fn read_file(&self, path: &str) -> Vec<u8> {
        let Some(nid) = self.find(path) else {
            return Vec::new();
        };
        match self.read_inode(nid) {
            Some(inode) => self.read_inode_data(&inode),
            None => Vec::new(),
        }
    }

    /// Read a file as (lossy) UTF-8 text.
    pub fn read_text(&self, path: &str) -> String {
        String::from_utf8_lossy(&self.read_file(path)).into_owned()
    }

    /// Entry names of a directory; empty/`/` means the root.
    pub fn list_directory(&self, path: &str) -> Vec<String> {
        let nid = if path.is_empty() || path == "/" {
            Some(self.root_nid)
        } else {
            self.find(path)
        };
        match nid {
            Some(nid) => self
                .read_directory(nid)
                .into_iter()
                .map(|(name, _)| name)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Collect `key=value` properties from the conventional build.prop
    /// locations, first hit per key wins.
    pub fn read_build_prop(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        for path in BUILD_PROP_PATHS {
            let content = self.read_text(path);
            if content.is_empty() {
                continue;
            }
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    props
                        .entry(key.trim().to_string())
                        .or_insert_with(|| value.trim().to_string());
                }
            }
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Compact inode record at the simplified offset `1024 + nid * 32`.
    fn put_inode(image: &mut [u8], nid: u64, layout: u16, size: u32, raw_blkaddr: u32) {
        let off = 1024 + nid as usize * 32;
        let format = layout << 1; // bit 0 clear = compact
        put(image, off, &format.to_le_bytes());
        put(image, off + 8, &size.to_le_bytes());
        put(image, off + 16, &raw_blkaddr.to_le_bytes());
    }

    fn dirent(nid: u64, name_off: u16, file_type: u8) -> Vec<u8> {
        let mut entry = nid.to_le_bytes().to_vec();
        entry.extend_from_slice(&name_off.to_le_bytes());
        entry.push(file_type);
        entry.push(0);
        entry
    }

    const PROP_TEXT: &[u8] = b"ro.product.model=Pixel\nro.build.id=TEST123\n";

    /// Build a block_size=512 image with:
    ///   /build.prop (inline), /data.bin (flat), /comp.bin (lz4),
    ///   /sub/nested.txt (inline)
    fn build_image() -> Vec<u8> {
        let mut img = vec![0u8; 3072];

        // Superblock: magic, blkszbits=9, root_nid=2, meta_blkaddr=0
        put(&mut img, 1024, &EROFS_MAGIC.to_le_bytes());
        img[1024 + 8] = 9;
        put(&mut img, 1024 + 10, &2u16.to_le_bytes());
        put(&mut img, 1024 + 48, b"testvol");

        // Root directory (nid 2, inline): 6 entries, names at offset 72
        let mut dir = Vec::new();
        dir.extend(dirent(2, 72, 2)); // .
        dir.extend(dirent(2, 73, 2)); // ..
        dir.extend(dirent(8, 75, 1)); // build.prop
        dir.extend(dirent(16, 85, 1)); // comp.bin
        dir.extend(dirent(12, 93, 1)); // data.bin
        dir.extend(dirent(20, 101, 2)); // sub
        dir.extend_from_slice(b"...build.propcomp.bindata.binsub");
        put_inode(&mut img, 2, 2, dir.len() as u32, 0);
        put(&mut img, 1024 + 2 * 32 + 32, &dir);

        // build.prop (nid 8, inline)
        put_inode(&mut img, 8, 2, PROP_TEXT.len() as u32, 0);
        put(&mut img, 1024 + 8 * 32 + 32, PROP_TEXT);

        // data.bin (nid 12, flat plain at block 4)
        put_inode(&mut img, 12, 0, 8, 4);
        put(&mut img, 4 * 512, b"FLATDATA");

        // comp.bin (nid 16, compressed at block 5): 64 x 'A'
        put_inode(&mut img, 16, 1, 64, 5);
        put(&mut img, 5 * 512, &[0x1F, b'A', 0x01, 0x00, 44]);

        // sub (nid 20, inline dir) with nested.txt (nid 24)
        let mut sub = Vec::new();
        sub.extend(dirent(20, 36, 2)); // .
        sub.extend(dirent(2, 37, 2)); // ..
        sub.extend(dirent(24, 39, 1)); // nested.txt
        sub.extend_from_slice(b"...nested.txt");
        put_inode(&mut img, 20, 2, sub.len() as u32, 0);
        put(&mut img, 1024 + 20 * 32 + 32, &sub);

        put_inode(&mut img, 24, 2, 7, 0);
        put(&mut img, 1024 + 24 * 32 + 32, b"nested!");

        img
    }

    #[test]
    fn test_superblock_parse() {
        let img = build_image();
        let fs = ErofsImage::parse(&img).unwrap();
        assert_eq!(fs.block_size(), 512);
        assert_eq!(fs.volume_name(), "testvol");
    }

    #[test]
    fn test_rejects_bad_magic() {
        let img = vec![0u8; 2048];
        assert!(!ErofsImage::is_erofs(&img));
        assert!(ErofsImage::parse(&img).is_none());
    }

    #[test]
    fn test_root_listing_skips_dot_entries() {
        let img = build_image();
        let fs = ErofsImage::parse(&img).unwrap();
        let names = fs.list_directory("/");
        assert_eq!(names, ["build.prop", "comp.bin", "data.bin", "sub"]);
    }

    #[test]
    fn test_read_inline_file() {
        let img = build_image();
        let fs = ErofsImage::parse(&img).unwrap();
        assert_eq!(fs.read_file("build.prop"), PROP_TEXT);
    }

    #[test]
    fn test_read_flat_file() {
        let img = build_image();
        let fs = ErofsImage::parse(&img).unwrap();
        assert_eq!(fs.read_file("data.bin"), b"FLATDATA");
    }

    #[test]
    fn test_read_compressed_file() {
        let img = build_image();
        let fs = ErofsImage::parse(&img).unwrap();
        let data = fs.read_file("comp.bin");
        assert_eq!(data.len(), 64);
        assert!(data.iter().all(|&b| b == b'A'));
    }

    #[test]
    fn test_nested_path_walk() {
        let img = build_image();
        let fs = ErofsImage::parse(&img).unwrap();
        assert_eq!(fs.read_text("sub/nested.txt"), "nested!");
        assert!(fs.file_exists("/sub/nested.txt"));
        assert!(!fs.file_exists("sub/missing.txt"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let img = build_image();
        let fs = ErofsImage::parse(&img).unwrap();
        assert!(fs.read_file("no/such/file").is_empty());
        assert!(fs.list_directory("nope").is_empty());
    }

    #[test]
    fn test_build_prop_map() {
        let img = build_image();
        let fs = ErofsImage::parse(&img).unwrap();
        let props = fs.read_build_prop();
        assert_eq!(props["ro.product.model"], "Pixel");
        assert_eq!(props["ro.build.id"], "TEST123");
    }
}
