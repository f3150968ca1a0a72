//! Guest image loading: 32-bit little-endian MIPS ELF executables, or raw
//! binaries copied to a fixed address.

use goblin::elf::Elf;
use goblin::elf::header::EM_MIPS;
use goblin::elf::program_header::{PT_LOAD, ProgramHeader};

use crate::error::{Error, Result};
use crate::memory::MemoryMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Elf,
    Raw,
}

/// What got loaded where.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub format: ImageFormat,
    /// ELF entry point, or the load address of a raw image.
    pub entry: u32,
    /// `(address, length)` of every range written, bss included.
    pub segments: Vec<(u32, u32)>,
}

impl LoadedImage {
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|&(_, len)| u64::from(len)).sum()
    }
}

/// Load `image` into `memory`. Raw images go to `raw_addr`.
///
/// The engine is not told about the new code; load before creating it, or
/// invalidate the returned segments afterwards.
pub fn load_image(memory: &mut MemoryMap, image: &[u8], raw_addr: u32) -> Result<LoadedImage> {
    if image.starts_with(b"\x7fELF") {
        load_elf(memory, image)
    } else {
        let len = u32::try_from(image.len())
            .map_err(|_| Error::Image(format!("raw image of {} bytes", image.len())))?;
        memory.write_bytes(raw_addr, image)?;
        log::info!("[MEM] Loaded {len} byte raw image at {raw_addr:#010x}");
        Ok(LoadedImage {
            format: ImageFormat::Raw,
            entry: raw_addr,
            segments: vec![(raw_addr, len)],
        })
    }
}

fn load_elf(memory: &mut MemoryMap, image: &[u8]) -> Result<LoadedImage> {
    let elf = Elf::parse(image).map_err(|e| Error::Image(format!("bad ELF: {e}")))?;
    if elf.is_64 || !elf.little_endian {
        return Err(Error::Image(
            "expected a 32-bit little-endian ELF".to_string(),
        ));
    }
    if elf.header.e_machine != EM_MIPS {
        return Err(Error::Image(format!(
            "not a MIPS executable (machine {})",
            elf.header.e_machine
        )));
    }

    let mut segments = Vec::new();
    for phdr in elf.program_headers.iter().filter(|p| p.p_type == PT_LOAD) {
        let (start, end) = segment_file_range(phdr, image.len())?;
        let load_addr = if phdr.p_paddr != 0 {
            phdr.p_paddr
        } else {
            phdr.p_vaddr
        };
        let load_addr = u32::try_from(load_addr)
            .map_err(|_| Error::Image(format!("segment address {load_addr:#x} out of range")))?;

        if start < end {
            memory.write_bytes(load_addr, &image[start..end])?;
        }
        if phdr.p_memsz > phdr.p_filesz {
            let zero_len = (phdr.p_memsz - phdr.p_filesz) as usize;
            let zero_base = load_addr.wrapping_add(phdr.p_filesz as u32);
            memory.fill_bytes(zero_base, zero_len, 0)?;
        }

        let len = phdr.p_memsz.max(phdr.p_filesz) as u32;
        log::debug!("[MEM] ELF segment {load_addr:#010x}+{len:#x}");
        segments.push((load_addr, len));
    }

    if segments.is_empty() {
        return Err(Error::Image("ELF has no loadable segment".to_string()));
    }

    let entry = elf.header.e_entry as u32;
    log::info!(
        "[MEM] Loaded ELF: {} segments, entry {entry:#010x}",
        segments.len()
    );
    Ok(LoadedImage {
        format: ImageFormat::Elf,
        entry,
        segments,
    })
}

fn segment_file_range(phdr: &ProgramHeader, image_len: usize) -> Result<(usize, usize)> {
    let start = usize::try_from(phdr.p_offset)
        .map_err(|_| Error::Image("segment offset overflow".to_string()))?;
    let size = usize::try_from(phdr.p_filesz)
        .map_err(|_| Error::Image("segment size overflow".to_string()))?;
    let end = start
        .checked_add(size)
        .filter(|&end| end <= image_len)
        .ok_or_else(|| Error::Image("segment outside of file".to_string()))?;
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::small_map;

    /// Minimal ELF32 LE MIPS executable with one PT_LOAD segment.
    fn elf(vaddr: u32, code: &[u8], memsz: u32, machine: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        out.extend_from_slice(&[1, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes()); // entry
        out.extend_from_slice(&52u32.to_le_bytes()); // phoff
        out.extend_from_slice(&0u32.to_le_bytes()); // shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
        out.extend_from_slice(&52u16.to_le_bytes());
        out.extend_from_slice(&32u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&40u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(out.len(), 52);

        for word in [
            PT_LOAD,
            84,
            vaddr,
            vaddr,
            code.len() as u32,
            memsz,
            5,
            4,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(code);
        out
    }

    #[test]
    fn test_raw_image() {
        let mut memory = small_map();
        let loaded = load_image(&mut memory, &[1, 2, 3, 4, 5], 0x8000_0100).unwrap();
        assert_eq!(loaded.format, ImageFormat::Raw);
        assert_eq!(loaded.entry, 0x8000_0100);
        assert_eq!(memory.slice(0x100, 5).unwrap(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_elf_segments_and_bss() {
        let mut memory = small_map();
        memory.fill_bytes(0x2000, 0x20, 0xaa).unwrap();
        let image = elf(0x8000_2000, &[0x11, 0x22, 0x33, 0x44], 0x10, EM_MIPS);

        let loaded = load_image(&mut memory, &image, 0).unwrap();
        assert_eq!(loaded.format, ImageFormat::Elf);
        assert_eq!(loaded.entry, 0x8000_2000);
        assert_eq!(loaded.segments, vec![(0x8000_2000, 0x10)]);
        assert_eq!(memory.read_u32(0x2000).unwrap(), 0x4433_2211);
        assert!(memory.slice(0x2004, 12).unwrap().iter().all(|&b| b == 0));
        assert_eq!(memory.slice(0x2010, 1).unwrap(), &[0xaa]);
    }

    #[test]
    fn test_elf_for_other_machine_is_rejected() {
        let mut memory = small_map();
        let image = elf(0x8000_2000, &[0; 4], 4, 0xf3);
        assert!(matches!(
            load_image(&mut memory, &image, 0),
            Err(Error::Image(_))
        ));
    }
}
