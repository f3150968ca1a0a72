//! PlayStation memory layout.

use super::{DeviceContext, MemMap, MemoryMap, MemoryOps};
use crate::error::Error;

pub const RAM_BASE: u32 = 0x0000_0000;
pub const RAM_SIZE: u32 = 0x20_0000;
pub const BIOS_BASE: u32 = 0x1fc0_0000;
pub const BIOS_SIZE: u32 = 0x8_0000;
pub const SCRATCH_BASE: u32 = 0x1f80_0000;
pub const SCRATCH_SIZE: u32 = 0x400;
pub const PARALLEL_BASE: u32 = 0x1f00_0000;
pub const PARALLEL_SIZE: u32 = 0x80_0000;
pub const HW_BASE: u32 = 0x1f80_1000;
pub const HW_SIZE: u32 = 0x2000;
pub const CACHE_CTL_BASE: u32 = 0x5ffe_0130;
pub const CACHE_CTL_SIZE: u32 = 4;

/// Region indices of [`psx_memory_map`].
pub mod region {
    pub const RAM: usize = 0;
    pub const BIOS: usize = 1;
    pub const SCRATCH: usize = 2;
    pub const PARALLEL: usize = 3;
    pub const HW: usize = 4;
    pub const CACHE_CTL: usize = 5;
    pub const RAM_MIRROR_1: usize = 6;
    pub const RAM_MIRROR_2: usize = 7;
    pub const RAM_MIRROR_3: usize = 8;
}

/// Device backed by plain storage: reads return what was last written.
///
/// Stands in for the hardware registers and cache control when no real
/// peripherals are attached.
pub struct RegisterBank {
    base: u32,
    data: Vec<u8>,
    name: &'static str,
}

impl RegisterBank {
    pub fn new(name: &'static str, base: u32, length: u32) -> Self {
        Self {
            base,
            data: vec![0; length as usize],
            name,
        }
    }

    fn read(&self, addr: u32, size: usize) -> u32 {
        let off = addr.wrapping_sub(self.base) as usize;
        match self.data.get(off..off + size) {
            Some(bytes) => bytes
                .iter()
                .rev()
                .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)),
            None => {
                log::warn!("[MEM] {}: read outside of bank at {addr:#010x}", self.name);
                0
            }
        }
    }

    fn write(&mut self, addr: u32, size: usize, value: u32) {
        let off = addr.wrapping_sub(self.base) as usize;
        match self.data.get_mut(off..off + size) {
            Some(bytes) => {
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = (value >> (i * 8)) as u8;
                }
            }
            None => log::warn!("[MEM] {}: write outside of bank at {addr:#010x}", self.name),
        }
    }
}

impl MemoryOps for RegisterBank {
    fn load8(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, addr: u32) -> u8 {
        log::trace!("[MEM] {} lb {addr:#010x}", self.name);
        self.read(addr, 1) as u8
    }
    fn load16(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, addr: u32) -> u16 {
        log::trace!("[MEM] {} lh {addr:#010x}", self.name);
        self.read(addr, 2) as u16
    }
    fn load32(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, addr: u32) -> u32 {
        log::trace!("[MEM] {} lw {addr:#010x}", self.name);
        self.read(addr, 4)
    }
    fn store8(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, addr: u32, value: u8) {
        log::trace!("[MEM] {} sb {addr:#010x} <- {value:#04x}", self.name);
        self.write(addr, 1, u32::from(value));
    }
    fn store16(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, addr: u32, value: u16) {
        log::trace!("[MEM] {} sh {addr:#010x} <- {value:#06x}", self.name);
        self.write(addr, 2, u32::from(value));
    }
    fn store32(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, addr: u32, value: u32) {
        log::trace!("[MEM] {} sw {addr:#010x} <- {value:#010x}", self.name);
        self.write(addr, 4, value);
    }
}

/// Build the PlayStation map: 2 MiB RAM mirrored four times, BIOS ROM,
/// scratch pad, parallel port, and device-backed hardware registers and
/// cache control.
pub fn psx_memory_map(
    bios: &[u8],
    hw: Box<dyn MemoryOps>,
    cache_ctl: Box<dyn MemoryOps>,
) -> Result<MemoryMap, Error> {
    if bios.len() > BIOS_SIZE as usize {
        return Err(Error::Image(format!(
            "BIOS image is {} bytes, expected at most {BIOS_SIZE}",
            bios.len()
        )));
    }
    MemoryMap::new(vec![
        MemMap::direct(RAM_BASE, RAM_SIZE),
        MemMap::rom(BIOS_BASE, BIOS_SIZE, bios),
        MemMap::direct(SCRATCH_BASE, SCRATCH_SIZE),
        MemMap::direct(PARALLEL_BASE, PARALLEL_SIZE).no_code(),
        MemMap::device(HW_BASE, HW_SIZE, hw),
        MemMap::device(CACHE_CTL_BASE, CACHE_CTL_SIZE, cache_ctl),
        MemMap::mirror(RAM_BASE + RAM_SIZE, RAM_SIZE, region::RAM),
        MemMap::mirror(RAM_BASE + RAM_SIZE * 2, RAM_SIZE, region::RAM),
        MemMap::mirror(RAM_BASE + RAM_SIZE * 3, RAM_SIZE, region::RAM),
    ])
}

/// [`psx_memory_map`] with [`RegisterBank`] devices.
pub fn psx_default_map(bios: &[u8]) -> Result<MemoryMap, Error> {
    psx_memory_map(
        bios,
        Box::new(RegisterBank::new("hw", HW_BASE, HW_SIZE)),
        Box::new(RegisterBank::new("cache-ctl", CACHE_CTL_BASE, CACHE_CTL_SIZE)),
    )
}
