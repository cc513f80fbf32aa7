//! ELF image loading
//!
//! Loads the initial user programs at boot: maps each PT_LOAD segment
//! eagerly, copies the file bytes, and leaves the rest zero-filled.
//! Runs only before the first task is scheduled.

use crate::error::KernErr;
use crate::mm::layout::{page_down, page_up};
use crate::mm::{self, AddressSpace, Prot, UserWindow};

const ELF_MAGIC: u32 = 0x464C_457F; // "\x7FELF"
const ELF_CLASS_64: u8 = 2;
const PT_LOAD: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    magic: u32,
    class: u8,
    data: u8,
    version: u8,
    _pad: [u8; 9],
    e_type: u16,
    machine: u16,
    version2: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    flags: u32,
    offset: u64,
    va: u64,
    pa: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

fn read_struct<T: Copy>(binary: &[u8], offset: usize) -> Result<T, KernErr> {
    let size = core::mem::size_of::<T>();
    let end = offset.checked_add(size).ok_or(KernErr::InvalidExe)?;
    if end > binary.len() {
        return Err(KernErr::InvalidExe);
    }
    // Alignment of the source is not guaranteed
    Ok(unsafe { core::ptr::read_unaligned(binary.as_ptr().add(offset) as *const T) })
}

/// Load an ELF64 image into `space` and return its entry point.
///
/// Every loadable segment is mapped eagerly (zero-filled allocation,
/// then the file bytes), so the fresh task never faults on its own text.
pub fn load_image(space: &mut AddressSpace, binary: &[u8]) -> Result<u64, KernErr> {
    let header: Elf64Header = read_struct(binary, 0)?;

    if header.magic != ELF_MAGIC || header.class != ELF_CLASS_64 {
        log::warn!(target: "task", "load_image: not an ELF64 image");
        return Err(KernErr::InvalidExe);
    }
    if header.phentsize as usize != core::mem::size_of::<Elf64ProgramHeader>() {
        log::warn!(
            target: "task",
            "load_image: program headers are {} bytes, expected {}",
            header.phentsize,
            core::mem::size_of::<Elf64ProgramHeader>()
        );
        return Err(KernErr::InvalidExe);
    }

    for i in 0..header.phnum as usize {
        let offset = header.phoff as usize + i * header.phentsize as usize;
        let ph: Elf64ProgramHeader = read_struct(binary, offset)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.filesz > ph.memsz {
            log::warn!(
                target: "task",
                "load_image: segment {} has filesz {:#x} > memsz {:#x}",
                i,
                ph.filesz,
                ph.memsz
            );
            return Err(KernErr::InvalidExe);
        }
        let file_end = ph
            .offset
            .checked_add(ph.filesz)
            .ok_or(KernErr::InvalidExe)?;
        if file_end > binary.len() as u64 {
            return Err(KernErr::InvalidExe);
        }

        let map_start = page_down(ph.va);
        let map_size = page_up(ph.va + ph.memsz) - map_start;
        space.map_alloc(
            map_start,
            map_size,
            Prot::R | Prot::W | Prot::X | Prot::USER | Prot::ONE,
        )?;

        if ph.filesz > 0 {
            let src = &binary[ph.offset as usize..file_end as usize];
            unsafe {
                let window = UserWindow::open(space);
                window.write(ph.va, src);
            }
        }
    }

    // The loader may have left the image's space active
    unsafe {
        mm::switch_space(mm::kspace());
    }

    Ok(header.entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_and_foreign_images() {
        let mut space = AddressSpace::empty();
        assert_eq!(load_image(&mut space, &[]), Err(KernErr::InvalidExe));
        assert_eq!(
            load_image(&mut space, &[0u8; 16]),
            Err(KernErr::InvalidExe)
        );

        // Right magic, wrong class
        let mut image = [0u8; 64];
        image[..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
        image[4] = 1; // 32-bit
        assert_eq!(
            load_image(&mut space, &image),
            Err(KernErr::InvalidExe)
        );
    }

    #[test]
    fn header_layout() {
        assert_eq!(core::mem::size_of::<Elf64Header>(), 64);
        assert_eq!(core::mem::size_of::<Elf64ProgramHeader>(), 56);
    }
}
