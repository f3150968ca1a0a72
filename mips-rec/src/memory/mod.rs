//! Guest address space.
//!
//! The address space is a short, static list of regions configured when the
//! engine is created. A region is either *direct* (backed by host memory the
//! engine reads and writes itself), a *device* (every access is forwarded to a
//! [`MemoryOps`] implementation), or a *mirror* of another region.
//!
//! ```text
//!  guest vaddr ──kunseg──▶ physical ──resolve──▶ region #n ──mirror_of──▶ canonical region
//!                                                                          │
//!                                              direct: host bytes ◀────────┤
//!                                              device: MemoryOps  ◀────────┘
//! ```
//!
//! Resolution is read-only and has no side effects; [`access`] builds the
//! load/store semantics on top of it.

pub mod access;
pub mod layout;

pub use access::MemAccess;

use crate::cpu::{Clock, ExitFlags};
use crate::error::{Error, Fault};

/// Convert a KUSEG/KSEG0/KSEG1 address to its physical form.
#[inline]
pub fn kunseg(addr: u32) -> u32 {
    if addr >= 0xa000_0000 {
        addr - 0xa000_0000
    } else {
        addr & !0x8000_0000
    }
}

/// What a device callback can see of the engine while it runs.
pub struct DeviceContext<'a> {
    clock: &'a mut Clock,
}

impl<'a> DeviceContext<'a> {
    pub(crate) fn new(clock: &'a mut Clock) -> Self {
        Self { clock }
    }

    pub fn current_cycle(&self) -> u32 {
        self.clock.current
    }

    /// Rebase the cycle counter (e.g. when a timer consumes elapsed cycles).
    pub fn reset_cycle(&mut self, cycles: u32) {
        self.clock.reset(cycles);
    }

    /// Ask the dispatcher to return to the host after the current block.
    pub fn request_exit(&mut self, flags: ExitFlags) {
        self.clock.set_exit(flags);
    }
}

/// Device-backed region callbacks. Addresses are physical.
pub trait MemoryOps: Send {
    fn load8(&mut self, ctx: &mut DeviceContext<'_>, op: u32, addr: u32) -> u8;
    fn load16(&mut self, ctx: &mut DeviceContext<'_>, op: u32, addr: u32) -> u16;
    fn load32(&mut self, ctx: &mut DeviceContext<'_>, op: u32, addr: u32) -> u32;
    fn store8(&mut self, ctx: &mut DeviceContext<'_>, op: u32, addr: u32, value: u8);
    fn store16(&mut self, ctx: &mut DeviceContext<'_>, op: u32, addr: u32, value: u16);
    fn store32(&mut self, ctx: &mut DeviceContext<'_>, op: u32, addr: u32, value: u32);
}

enum Backing {
    Direct { data: Box<[u8]>, read_only: bool },
    Device(Box<dyn MemoryOps>),
    Mirror(usize),
}

/// One entry of the memory map.
pub struct MemMap {
    pub pc: u32,
    pub length: u32,
    backing: Backing,
    /// Guest code may run from this region and gets Code Address Table slots.
    code: bool,
}

impl MemMap {
    /// Zero-filled host memory.
    pub fn direct(pc: u32, length: u32) -> Self {
        Self {
            pc,
            length,
            backing: Backing::Direct {
                data: vec![0; length as usize].into_boxed_slice(),
                read_only: false,
            },
            code: true,
        }
    }

    /// Read-only host memory initialized with `data` (padded with zeros to
    /// `length`).
    pub fn rom(pc: u32, length: u32, data: &[u8]) -> Self {
        let mut bytes = vec![0; length as usize];
        let n = data.len().min(bytes.len());
        bytes[..n].copy_from_slice(&data[..n]);
        Self {
            pc,
            length,
            backing: Backing::Direct {
                data: bytes.into_boxed_slice(),
                read_only: true,
            },
            code: true,
        }
    }

    pub fn device(pc: u32, length: u32, ops: Box<dyn MemoryOps>) -> Self {
        Self {
            pc,
            length,
            backing: Backing::Device(ops),
            code: false,
        }
    }

    /// Alias of the region at index `of` in the same map.
    pub fn mirror(pc: u32, length: u32, of: usize) -> Self {
        Self {
            pc,
            length,
            backing: Backing::Mirror(of),
            code: true,
        }
    }

    /// Data-only region: code fetched from it is never cached.
    pub fn no_code(mut self) -> Self {
        self.code = false;
        self
    }

    #[inline]
    fn contains(&self, paddr: u32) -> bool {
        paddr >= self.pc && paddr - self.pc < self.length
    }

    pub fn is_mirror(&self) -> bool {
        matches!(self.backing, Backing::Mirror(_))
    }

    pub fn is_device(&self) -> bool {
        matches!(self.backing, Backing::Device(_))
    }
}

/// Region kind after mirror resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Direct,
    Device,
}

/// Result of resolving a guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Index of the canonical (non-mirror) region.
    pub index: usize,
    /// Byte offset inside the canonical region.
    pub offset: u32,
    /// Physical address of the access in the canonical region.
    pub paddr: u32,
    pub kind: RegionKind,
}

/// The guest memory map.
pub struct MemoryMap {
    maps: Vec<MemMap>,
}

impl MemoryMap {
    /// Validate and build a memory map.
    pub fn new(maps: Vec<MemMap>) -> Result<Self, Error> {
        for (i, map) in maps.iter().enumerate() {
            if map.length == 0 {
                return Err(Error::InvalidMemoryMap(format!(
                    "region {i} at {:#010x} is empty",
                    map.pc
                )));
            }
            if map.pc.checked_add(map.length - 1).is_none() {
                return Err(Error::InvalidMemoryMap(format!(
                    "region {i} at {:#010x} wraps the address space",
                    map.pc
                )));
            }
            // Follow the mirror chain; it must end on a real region.
            let mut cur = i;
            let mut hops = 0;
            while let Backing::Mirror(of) = maps[cur].backing {
                if of >= maps.len() {
                    return Err(Error::InvalidMemoryMap(format!(
                        "region {i} mirrors missing region {of}"
                    )));
                }
                hops += 1;
                if hops > maps.len() {
                    return Err(Error::InvalidMemoryMap(format!(
                        "region {i} has a cyclic mirror chain"
                    )));
                }
                cur = of;
            }
        }
        Ok(Self { maps })
    }

    pub fn regions(&self) -> &[MemMap] {
        &self.maps
    }

    /// Index of the non-mirror region behind `index`.
    pub fn canonical(&self, mut index: usize) -> usize {
        while let Backing::Mirror(of) = self.maps[index].backing {
            index = of;
        }
        index
    }

    /// Find the region containing `addr` (virtual or physical).
    pub fn resolve(&self, addr: u32) -> Result<Resolved, Fault> {
        let paddr = kunseg(addr);
        let (index, map) = self
            .maps
            .iter()
            .enumerate()
            .find(|(_, m)| m.contains(paddr))
            .ok_or(Fault::NoMapping(addr))?;

        let canonical = self.canonical(index);
        let target = &self.maps[canonical];
        let offset = (paddr - map.pc) % target.length;
        let kind = if target.is_device() {
            RegionKind::Device
        } else {
            RegionKind::Direct
        };
        Ok(Resolved {
            index: canonical,
            offset,
            paddr: target.pc + offset,
            kind,
        })
    }

    /// Host bytes of a direct region.
    pub fn direct(&self, index: usize) -> Option<&[u8]> {
        match &self.maps[index].backing {
            Backing::Direct { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Writable host bytes of a direct region; `None` for devices and ROM.
    pub fn direct_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        match &mut self.maps[index].backing {
            Backing::Direct {
                data,
                read_only: false,
            } => Some(data),
            _ => None,
        }
    }

    /// Does the canonical region `index` hold cacheable code?
    pub fn is_code(&self, index: usize) -> bool {
        let map = &self.maps[index];
        map.code && matches!(map.backing, Backing::Direct { .. })
    }

    pub fn is_read_only(&self, index: usize) -> bool {
        matches!(
            self.maps[index].backing,
            Backing::Direct {
                read_only: true,
                ..
            }
        )
    }

    pub(crate) fn device_mut(&mut self, index: usize) -> Option<&mut (dyn MemoryOps + 'static)> {
        match &mut self.maps[index].backing {
            Backing::Device(ops) => Some(ops.as_mut()),
            _ => None,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Host-side helpers (loaders, DMA, tests)
    // ═══════════════════════════════════════════════════════════════════════

    /// Borrow `len` bytes of direct memory starting at `addr`.
    pub fn slice(&self, addr: u32, len: usize) -> Result<&[u8], Fault> {
        let r = self.resolve(addr)?;
        let data = self.direct(r.index).ok_or(Fault::NoMapping(addr))?;
        let start = r.offset as usize;
        data.get(start..start + len).ok_or(Fault::OutOfBounds(addr))
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, Fault> {
        let bytes = self.slice(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Copy `bytes` into direct memory at `addr`. ROM regions are writable
    /// from the host side.
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Fault> {
        let r = self.resolve(addr)?;
        let Backing::Direct { data, .. } = &mut self.maps[r.index].backing else {
            return Err(Fault::NoMapping(addr));
        };
        let start = r.offset as usize;
        data.get_mut(start..start + bytes.len())
            .ok_or(Fault::OutOfBounds(addr))?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), Fault> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Write a sequence of instruction words starting at `addr`.
    pub fn write_words(&mut self, addr: u32, words: &[u32]) -> Result<(), Fault> {
        for (i, w) in words.iter().enumerate() {
            self.write_u32(addr.wrapping_add(i as u32 * 4), *w)?;
        }
        Ok(())
    }

    pub fn fill_bytes(&mut self, addr: u32, len: usize, value: u8) -> Result<(), Fault> {
        let r = self.resolve(addr)?;
        let Backing::Direct { data, .. } = &mut self.maps[r.index].backing else {
            return Err(Fault::NoMapping(addr));
        };
        let start = r.offset as usize;
        data.get_mut(start..start + len)
            .ok_or(Fault::OutOfBounds(addr))?
            .fill(value);
        Ok(())
    }

    /// Total host bytes backing direct regions.
    pub fn direct_bytes(&self) -> usize {
        self.maps
            .iter()
            .map(|m| match &m.backing {
                Backing::Direct { data, .. } => data.len(),
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Device that records every access and reads back the last stored word.
    #[derive(Default)]
    pub struct RecordingDevice {
        pub last: u32,
        pub accesses: Vec<(bool, u32, u32)>,
    }

    impl MemoryOps for RecordingDevice {
        fn load8(&mut self, _: &mut DeviceContext<'_>, _: u32, addr: u32) -> u8 {
            self.accesses.push((false, addr, 1));
            self.last as u8
        }
        fn load16(&mut self, _: &mut DeviceContext<'_>, _: u32, addr: u32) -> u16 {
            self.accesses.push((false, addr, 2));
            self.last as u16
        }
        fn load32(&mut self, _: &mut DeviceContext<'_>, _: u32, addr: u32) -> u32 {
            self.accesses.push((false, addr, 4));
            self.last
        }
        fn store8(&mut self, _: &mut DeviceContext<'_>, _: u32, addr: u32, value: u8) {
            self.accesses.push((true, addr, 1));
            self.last = u32::from(value);
        }
        fn store16(&mut self, _: &mut DeviceContext<'_>, _: u32, addr: u32, value: u16) {
            self.accesses.push((true, addr, 2));
            self.last = u32::from(value);
        }
        fn store32(&mut self, ctx: &mut DeviceContext<'_>, _: u32, addr: u32, value: u32) {
            self.accesses.push((true, addr, 4));
            self.last = value;
            if value == 0xdead {
                ctx.request_exit(ExitFlags::CHECK_INTERRUPT);
            }
        }
    }

    pub fn small_map() -> MemoryMap {
        MemoryMap::new(vec![
            MemMap::direct(0x0000_0000, 0x1_0000),
            MemMap::mirror(0x0001_0000, 0x1_0000, 0),
            MemMap::device(0x1f80_1000, 0x1000, Box::new(RecordingDevice::default())),
            MemMap::rom(0x1fc0_0000, 0x1000, &[0x11, 0x22, 0x33, 0x44]),
        ])
        .unwrap()
    }

    #[test]
    fn test_kunseg() {
        assert_eq!(kunseg(0x8001_0000), 0x0001_0000);
        assert_eq!(kunseg(0xa001_0000), 0x0001_0000);
        assert_eq!(kunseg(0xbfc0_0000), 0x1fc0_0000);
        assert_eq!(kunseg(0x0000_1000), 0x0000_1000);
        assert_eq!(kunseg(0xfffe_0130), 0x5ffe_0130);
    }

    #[test]
    fn test_resolve_mirror_to_canonical() {
        let map = small_map();
        let a = map.resolve(0x8000_1234).unwrap();
        let b = map.resolve(0x0001_1234).unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 0);
        assert_eq!(a.offset, b.offset);
        assert_eq!(b.paddr, 0x1234);
        assert_eq!(a.kind, RegionKind::Direct);
    }

    #[test]
    fn test_resolve_device_and_missing() {
        let map = small_map();
        assert_eq!(map.resolve(0xbf80_1010).unwrap().kind, RegionKind::Device);
        assert_eq!(map.resolve(0x0900_0000), Err(Fault::NoMapping(0x0900_0000)));
    }

    #[test]
    fn test_invalid_maps_rejected() {
        assert!(MemoryMap::new(vec![MemMap::mirror(0, 0x100, 3)]).is_err());
        assert!(MemoryMap::new(vec![
            MemMap::mirror(0, 0x100, 1),
            MemMap::mirror(0x100, 0x100, 0)
        ])
        .is_err());
        assert!(MemoryMap::new(vec![MemMap::direct(0, 0)]).is_err());
    }

    #[test]
    fn test_host_helpers() {
        let mut map = small_map();
        map.write_u32(0x100, 0xcafe_babe).unwrap();
        assert_eq!(map.read_u32(0x8001_0100).unwrap(), 0xcafe_babe);
        assert_eq!(map.read_u32(0xbfc0_0000).unwrap(), 0x4433_2211);
        assert!(map.direct_mut(3).is_none());
        assert!(map.is_read_only(3));
        assert_eq!(map.read_u32(0xfffc), Ok(0));
        assert_eq!(map.read_u32(0xfffe), Err(Fault::OutOfBounds(0xfffe)));
    }
}
