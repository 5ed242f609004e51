//! ELF32 executable loader
//!
//! Pure function from image bytes to entry point: [`parse`] validates the
//! header and yields the loadable segments; [`load_into_current`] copies
//! them into the current address space, where lazy zero-fill backs every
//! page the copy touches.

use alloc::vec::Vec;
use core::mem;

use crate::error::{KernelError, KernelResult};
use crate::mm::user;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub osabi: u8,
    pub abiversion: u8,
    pub pad: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version2: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32ProgramHeader {
    pub p_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_32: u8 = 1;
const ELF_DATA_2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

/// One PT_LOAD segment of a validated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    /// Target virtual address.
    pub vaddr: u32,
    /// Offset of the segment bytes inside the image.
    pub offset: usize,
    /// Bytes present in the image.
    pub file_size: usize,
    /// Bytes occupied in memory (the excess is zero-filled bss).
    pub mem_size: usize,
}

/// A validated executable: entry point plus loadable segments.
#[derive(Debug)]
pub struct Image {
    pub entry: u32,
    pub segments: Vec<LoadSegment>,
}

fn header(image: &[u8]) -> KernelResult<Elf32Header> {
    if image.len() < mem::size_of::<Elf32Header>() {
        return Err(KernelError::BadExecutable("image shorter than ELF header"));
    }
    // SAFETY: length checked; Elf32Header is a plain #[repr(C)] record
    // read with an unaligned load.
    let header = unsafe { core::ptr::read_unaligned(image.as_ptr().cast::<Elf32Header>()) };
    if header.magic != ELF_MAGIC {
        return Err(KernelError::BadExecutable("bad magic"));
    }
    if header.class != ELF_CLASS_32 || header.data != ELF_DATA_2LSB {
        return Err(KernelError::BadExecutable("not a little-endian ELF32"));
    }
    if header.elf_type != ET_EXEC || header.machine != EM_386 {
        return Err(KernelError::BadExecutable("not an x86 executable"));
    }
    Ok(header)
}

/// Validate `image` and collect its PT_LOAD segments.
pub fn parse(image: &[u8]) -> KernelResult<Image> {
    let header = header(image)?;
    let phentsize = header.phentsize as usize;
    if phentsize < mem::size_of::<Elf32ProgramHeader>() {
        return Err(KernelError::BadExecutable("bad program header size"));
    }

    let mut segments = Vec::new();
    for i in 0..header.phnum as usize {
        let off = header.phoff as usize + i * phentsize;
        if off + mem::size_of::<Elf32ProgramHeader>() > image.len() {
            return Err(KernelError::BadExecutable("program header out of bounds"));
        }
        // SAFETY: bounds checked; plain #[repr(C)] record, unaligned load.
        let ph = unsafe {
            core::ptr::read_unaligned(image.as_ptr().add(off).cast::<Elf32ProgramHeader>())
        };
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.filesz > ph.memsz {
            return Err(KernelError::BadExecutable("segment file size exceeds memory size"));
        }
        let end = ph
            .offset
            .checked_add(ph.filesz)
            .ok_or(KernelError::BadExecutable("segment wraps"))?;
        if end as usize > image.len() {
            return Err(KernelError::BadExecutable("segment data out of bounds"));
        }
        segments.push(LoadSegment {
            vaddr: ph.vaddr,
            offset: ph.offset as usize,
            file_size: ph.filesz as usize,
            mem_size: ph.memsz as usize,
        });
    }
    Ok(Image {
        entry: header.entry,
        segments,
    })
}

/// Copy a validated image into the current address space and return its
/// entry point. Every segment must lie in user space; the writes fault
/// pages into existence through the zero-fill and COW paths.
pub fn load_into_current(image: &[u8]) -> KernelResult<u32> {
    let parsed = parse(image)?;
    for seg in &parsed.segments {
        log::debug!(
            "elf: segment {:#010x} file {:#x} mem {:#x}",
            seg.vaddr,
            seg.file_size,
            seg.mem_size
        );
        // SAFETY: the range check is the contract for writing user memory
        // from the kernel; the copy runs on the destination space.
        unsafe {
            let dst = user::user_bytes_mut(seg.vaddr, seg.mem_size)?;
            dst[..seg.file_size].copy_from_slice(&image[seg.offset..seg.offset + seg.file_size]);
            dst[seg.file_size..].fill(0);
        }
    }
    Ok(parsed.entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    fn image(machine: u16, class: u8, phs: &[Elf32ProgramHeader], data: &[u8]) -> Vec<u8> {
        let header = Elf32Header {
            magic: ELF_MAGIC,
            class,
            data: ELF_DATA_2LSB,
            version: 1,
            osabi: 0,
            abiversion: 0,
            pad: [0; 7],
            elf_type: ET_EXEC,
            machine,
            version2: 1,
            entry: 0x40_0000,
            phoff: mem::size_of::<Elf32Header>() as u32,
            shoff: 0,
            flags: 0,
            ehsize: mem::size_of::<Elf32Header>() as u16,
            phentsize: mem::size_of::<Elf32ProgramHeader>() as u16,
            phnum: phs.len() as u16,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        };
        let mut out = vec![0u8; 0];
        // SAFETY: test-only serialization of plain #[repr(C)] records.
        unsafe {
            out.extend_from_slice(core::slice::from_raw_parts(
                (&header as *const Elf32Header).cast::<u8>(),
                mem::size_of::<Elf32Header>(),
            ));
            for ph in phs {
                out.extend_from_slice(core::slice::from_raw_parts(
                    (ph as *const Elf32ProgramHeader).cast::<u8>(),
                    mem::size_of::<Elf32ProgramHeader>(),
                ));
            }
        }
        out.extend_from_slice(data);
        out
    }

    fn load_ph(offset: u32, vaddr: u32, filesz: u32, memsz: u32) -> Elf32ProgramHeader {
        Elf32ProgramHeader {
            p_type: PT_LOAD,
            offset,
            vaddr,
            paddr: vaddr,
            filesz,
            memsz,
            flags: 0,
            align: 0x1000,
        }
    }

    #[test]
    fn parses_entry_and_load_segments() {
        let data_off =
            (mem::size_of::<Elf32Header>() + 2 * mem::size_of::<Elf32ProgramHeader>()) as u32;
        let phs = [
            load_ph(data_off, 0x40_0000, 4, 16),
            Elf32ProgramHeader {
                p_type: 4, // PT_NOTE, skipped
                ..load_ph(data_off, 0, 0, 0)
            },
        ];
        let img = image(EM_386, ELF_CLASS_32, &phs, b"code");
        let parsed = parse(&img).unwrap();
        assert_eq!(parsed.entry, 0x40_0000);
        assert_eq!(
            parsed.segments,
            vec![LoadSegment {
                vaddr: 0x40_0000,
                offset: data_off as usize,
                file_size: 4,
                mem_size: 16,
            }]
        );
    }

    #[test]
    fn rejects_foreign_images() {
        let img64 = image(EM_386, 2, &[], b"");
        assert_eq!(
            parse(&img64).unwrap_err(),
            KernelError::BadExecutable("not a little-endian ELF32")
        );
        let arm = image(40, ELF_CLASS_32, &[], b"");
        assert_eq!(
            parse(&arm).unwrap_err(),
            KernelError::BadExecutable("not an x86 executable")
        );
        assert!(parse(b"\x7fELFtrunc").is_err());
    }

    #[test]
    fn rejects_out_of_bounds_segments() {
        let phs = [load_ph(0xFFFF, 0x40_0000, 0x100, 0x100)];
        let img = image(EM_386, ELF_CLASS_32, &phs, b"");
        assert_eq!(
            parse(&img).unwrap_err(),
            KernelError::BadExecutable("segment data out of bounds")
        );

        let phs = [load_ph(0, 0x40_0000, 8, 4)];
        let img = image(EM_386, ELF_CLASS_32, &phs, b"");
        assert_eq!(
            parse(&img).unwrap_err(),
            KernelError::BadExecutable("segment file size exceeds memory size")
        );
    }
}
