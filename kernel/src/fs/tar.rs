//! ustar archive reader
//!
//! The ramdisk is a POSIX ustar archive: a sequence of 512-byte header
//! blocks each followed by the file data rounded up to whole blocks,
//! terminated by an all-zero header. The reader keeps a block cursor;
//! [`find`](TarReader::find) leaves it at the start of the file data so
//! subsequent [`read`](TarReader::read) calls stream the file out.

/// Size of a tar header/data block.
pub const BLOCK_SIZE: usize = 512;

/// Header field offsets and sizes (ustar format).
mod field {
    /// File name (100 bytes, NUL-terminated ASCII).
    pub const NAME_OFF: usize = 0;
    pub const NAME_LEN: usize = 100;

    /// File size in octal ASCII (12 bytes).
    pub const SIZE_OFF: usize = 124;
    pub const SIZE_LEN: usize = 12;

    /// Magic field ("ustar\0" for POSIX tar).
    pub const MAGIC_OFF: usize = 257;
    pub const MAGIC_LEN: usize = 6;

    /// Name prefix for paths longer than 100 bytes (155 bytes).
    pub const PREFIX_OFF: usize = 345;
    pub const PREFIX_LEN: usize = 155;
}

/// Parse a NUL-terminated ASCII string from a fixed-size header field.
fn parse_str(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// Parse an octal ASCII number from a header field.
fn parse_octal(buf: &[u8]) -> usize {
    let mut value = 0;
    for &b in buf {
        if !(b'0'..=b'7').contains(&b) {
            break;
        }
        value = value * 8 + (b - b'0') as usize;
    }
    value
}

fn blocks_for(bytes: usize) -> usize {
    (bytes + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// Sequential reader over an in-memory ustar archive.
pub struct TarReader<'a> {
    data: &'a [u8],
    block: usize,
}

impl<'a> TarReader<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, block: 0 }
    }

    fn header(&self, block: usize) -> Option<&'a [u8]> {
        let offset = block * BLOCK_SIZE;
        if offset + BLOCK_SIZE > self.data.len() {
            return None;
        }
        let header = &self.data[offset..offset + BLOCK_SIZE];
        // An all-zero name field marks the end of the archive.
        if header[field::NAME_OFF] == 0 {
            return None;
        }
        Some(header)
    }

    /// Look up `name` by exact match. On a hit the cursor is positioned at
    /// the first data block and the file size in bytes is returned.
    pub fn find(&mut self, name: &str) -> Option<usize> {
        self.block = 0;
        while let Some(header) = self.header(self.block) {
            let size = parse_octal(&header[field::SIZE_OFF..field::SIZE_OFF + field::SIZE_LEN]);
            self.block += 1;
            if entry_name_matches(header, name) {
                return Some(size);
            }
            self.block += blocks_for(size);
        }
        None
    }

    /// Copy up to `buf.len()` bytes from the cursor and advance it by
    /// whole blocks, like the block-device reader this models: a partial
    /// tail block is consumed entirely.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let offset = self.block * BLOCK_SIZE;
        if offset >= self.data.len() {
            return 0;
        }
        let count = buf.len().min(self.data.len() - offset);
        buf[..count].copy_from_slice(&self.data[offset..offset + count]);
        self.block += blocks_for(count);
        count
    }
}

/// Match the (prefix + name) of a header against a path.
fn entry_name_matches(header: &[u8], path: &str) -> bool {
    let name = parse_str(&header[field::NAME_OFF..field::NAME_OFF + field::NAME_LEN]);
    let magic = &header[field::MAGIC_OFF..field::MAGIC_OFF + field::MAGIC_LEN];
    let prefix = if magic.starts_with(b"ustar") {
        parse_str(&header[field::PREFIX_OFF..field::PREFIX_OFF + field::PREFIX_LEN])
    } else {
        &[]
    };
    let path = path.as_bytes();
    if prefix.is_empty() {
        path == name
    } else {
        path.len() == prefix.len() + 1 + name.len()
            && path.starts_with(prefix)
            && path[prefix.len()] == b'/'
            && path[prefix.len() + 1..] == *name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn header(name: &str, size: usize) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        let octal = std::format!("{size:011o}");
        block[field::SIZE_OFF..field::SIZE_OFF + octal.len()].copy_from_slice(octal.as_bytes());
        block[field::MAGIC_OFF..field::MAGIC_OFF + 6].copy_from_slice(b"ustar\0");
        block
    }

    fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in files {
            out.extend_from_slice(&header(name, data.len()));
            out.extend_from_slice(data);
            // Pad to a whole block.
            out.resize(blocks_for(out.len()) * BLOCK_SIZE, 0);
        }
        // Zero terminator block.
        out.extend_from_slice(&[0u8; BLOCK_SIZE]);
        out
    }

    #[test]
    fn finds_file_by_exact_name() {
        let data = archive(&[("boot/init.elf", b"ELFDATA"), ("etc/motd", b"hello")]);
        let mut tar = TarReader::new(&data);
        assert_eq!(tar.find("etc/motd"), Some(5));
        let mut buf = [0u8; 5];
        assert_eq!(tar.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn lookup_misses_partial_names() {
        let data = archive(&[("etc/motd", b"hello")]);
        let mut tar = TarReader::new(&data);
        assert_eq!(tar.find("motd"), None);
        assert_eq!(tar.find("etc/mot"), None);
        assert_eq!(tar.find("etc/motd2"), None);
    }

    #[test]
    fn read_skips_to_block_boundaries() {
        let content: Vec<u8> = (0..700u32).map(|i| i as u8).collect();
        let data = archive(&[("a", &content), ("b", b"second")]);
        let mut tar = TarReader::new(&data);

        assert_eq!(tar.find("a"), Some(700));
        let mut first = [0u8; 512];
        assert_eq!(tar.read(&mut first), 512);
        assert_eq!(first[..], content[..512]);
        // The partial read of the tail consumes the whole second block.
        let mut tail = [0u8; 100];
        assert_eq!(tar.read(&mut tail), 100);
        assert_eq!(tail[..], content[512..612]);
        assert_eq!(tar.find("b"), Some(6));
    }

    #[test]
    fn empty_and_terminated_archives_miss() {
        let mut empty = TarReader::new(&[]);
        assert_eq!(empty.find("x"), None);

        let data = archive(&[]);
        let mut tar = TarReader::new(&data);
        assert_eq!(tar.find("x"), None);
    }

    #[test]
    fn long_paths_use_the_ustar_prefix() {
        let mut block = header("init.elf", 4);
        let prefix = b"very/long/prefix";
        block[field::PREFIX_OFF..field::PREFIX_OFF + prefix.len()].copy_from_slice(prefix);
        let mut data = Vec::new();
        data.extend_from_slice(&block);
        data.extend_from_slice(b"data");
        data.resize(3 * BLOCK_SIZE, 0);

        let mut tar = TarReader::new(&data);
        assert_eq!(tar.find("very/long/prefix/init.elf"), Some(4));
        assert_eq!(tar.find("init.elf"), None);
    }
}
