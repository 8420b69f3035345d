//! ELF64 executable loading for `Exec` and the first user process.

use alloc::string::String;
use alloc::vec::Vec;

use crate::buffer::KernelBuffer;
use crate::error::{SysError, SysResult};
use crate::fs::EntryRef;
use crate::mm::{MemoryOperation, SpaceManager, UserRegion, VirtualAddress, PAGE_SIZE};
use crate::utils::{align_down, align_up};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LITTLE_ENDIAN: u8 = 1;
const TYPE_EXECUTABLE: u16 = 2;
const MACHINE_AARCH64: u16 = 183;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// User stack: 64 KiB ending just below the canonical top.
const USER_STACK_TOP: usize = 0x0000_7FFF_FFF0_0000;
const USER_STACK_SIZE: usize = 16 * PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElfHeader {
    pub entry: u64,
    pub ph_offset: u64,
    pub ph_entry_size: u16,
    pub ph_count: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: u32,
    pub file_offset: u64,
    pub virtual_addr: u64,
    pub file_size: u64,
    pub memory_size: u64,
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Validate and decode an ELF64 file header.
pub fn parse_header(bytes: &[u8]) -> SysResult<ElfHeader> {
    if bytes.len() < 64 || bytes[0..4] != ELF_MAGIC {
        return Err(SysError::ExecFormat);
    }
    if bytes[4] != CLASS_64 || bytes[5] != DATA_LITTLE_ENDIAN {
        return Err(SysError::ExecFormat);
    }
    if u16_at(bytes, 16) != TYPE_EXECUTABLE || u16_at(bytes, 18) != MACHINE_AARCH64 {
        return Err(SysError::ExecFormat);
    }
    let header = ElfHeader {
        entry: u64_at(bytes, 24),
        ph_offset: u64_at(bytes, 32),
        ph_entry_size: u16_at(bytes, 54),
        ph_count: u16_at(bytes, 56),
    };
    if header.ph_entry_size < 56 || header.ph_count == 0 {
        return Err(SysError::ExecFormat);
    }
    Ok(header)
}

/// Decode one program header record.
pub fn parse_program_header(bytes: &[u8]) -> SysResult<ProgramHeader> {
    if bytes.len() < 56 {
        return Err(SysError::ExecFormat);
    }
    Ok(ProgramHeader {
        kind: u32_at(bytes, 0),
        flags: u32_at(bytes, 4),
        file_offset: u64_at(bytes, 8),
        virtual_addr: u64_at(bytes, 16),
        file_size: u64_at(bytes, 32),
        memory_size: u64_at(bytes, 40),
    })
}

fn segment_permissions(flags: u32) -> MemoryOperation {
    let mut operations = MemoryOperation::empty();
    if flags & PF_R != 0 {
        operations |= MemoryOperation::READ;
    }
    if flags & PF_W != 0 {
        operations |= MemoryOperation::WRITE;
    }
    if flags & PF_X != 0 {
        operations |= MemoryOperation::EXECUTE;
    }
    operations
}

pub struct LoadedImage {
    pub entry_point: usize,
}

/// Load every `PT_LOAD` segment of `executable` into `space`.
///
/// Segments are placed at their requested addresses, rounded out to page
/// boundaries, with permissions from their flags. Gaps past `file_size`
/// (bss) are zero.
pub fn load_executable(
    executable: &EntryRef,
    space: &mut SpaceManager,
) -> SysResult<LoadedImage> {
    let mut header_bytes = [0u8; 64];
    let mut header_buffer = KernelBuffer::new(&mut header_bytes);
    if executable.read_bytes(&mut header_buffer, 0, 64)? != 64 {
        return Err(SysError::ExecFormat);
    }
    let header = parse_header(&header_bytes)?;

    for index in 0..header.ph_count {
        let offset = header.ph_offset as usize + index as usize * header.ph_entry_size as usize;
        let mut ph_bytes = [0u8; 56];
        let mut ph_buffer = KernelBuffer::new(&mut ph_bytes);
        if executable.read_bytes(&mut ph_buffer, offset, 56)? != 56 {
            return Err(SysError::ExecFormat);
        }
        let segment = parse_program_header(&ph_bytes)?;
        if segment.kind != PT_LOAD || segment.memory_size == 0 {
            continue;
        }
        if segment.file_size > segment.memory_size {
            return Err(SysError::ExecFormat);
        }

        let region_start = align_down(segment.virtual_addr as usize, PAGE_SIZE);
        let region_end = align_up(
            segment.virtual_addr as usize + segment.memory_size as usize,
            PAGE_SIZE,
        );
        let region = UserRegion::new(
            VirtualAddress::new(region_start),
            region_end - region_start,
        );
        let backing = space.allocate_placed_region(
            region,
            segment_permissions(segment.flags),
            "elf-segment",
        )?;
        let view = backing.kernel_view().ok_or(SysError::Failed)?;

        // SAFETY: the kernel view covers exactly the freshly allocated
        // pages backing this segment; nothing else references them yet.
        let view_slice = unsafe {
            core::slice::from_raw_parts_mut(view.start.as_mut_ptr::<u8>(), view.size)
        };
        view_slice.fill(0);
        if segment.file_size > 0 {
            let into_region = segment.virtual_addr as usize - region_start;
            let mut segment_buffer = KernelBuffer::new(
                &mut view_slice[into_region..into_region + segment.file_size as usize],
            );
            let read = executable.read_bytes(
                &mut segment_buffer,
                segment.file_offset as usize,
                segment.file_size as usize,
            )?;
            if read != segment.file_size as usize {
                return Err(SysError::ExecFormat);
            }
        }
    }

    Ok(LoadedImage {
        entry_point: header.entry as usize,
    })
}

pub struct StackImage {
    pub stack_pointer: usize,
    /// Value for the entry register convention (argc).
    pub arg0: u64,
}

/// Allocate the user stack and lay out `argv`/`envp`.
///
/// Layout at the returned stack pointer, ascending: `argc: u64`, the
/// argv pointer array (null-terminated), the envp pointer array
/// (null-terminated), then the string bytes near the top.
pub fn build_user_stack(
    space: &mut SpaceManager,
    argv: &[String],
    envp: &[String],
) -> SysResult<StackImage> {
    let region = UserRegion::new(
        VirtualAddress::new(USER_STACK_TOP - USER_STACK_SIZE),
        USER_STACK_SIZE,
    );
    let backing = space.allocate_placed_region(
        region,
        MemoryOperation::READ | MemoryOperation::WRITE,
        "stack",
    )?;
    let view = backing.kernel_view().ok_or(SysError::Failed)?;
    // SAFETY: as in load_executable; the stack pages are exclusively ours
    // until the process first runs.
    let stack = unsafe {
        core::slice::from_raw_parts_mut(view.start.as_mut_ptr::<u8>(), view.size)
    };
    stack.fill(0);

    // Strings at the top, pointer arrays below, argc at the stack
    // pointer. All offsets are relative to the user-visible region.
    let mut top = USER_STACK_SIZE;
    let mut string_ptrs: Vec<usize> = Vec::with_capacity(argv.len() + envp.len());
    for string in argv.iter().chain(envp) {
        let bytes = string.as_bytes();
        top -= bytes.len() + 1;
        stack[top..top + bytes.len()].copy_from_slice(bytes);
        string_ptrs.push(region.start.get() + top);
    }

    let words = 1 + argv.len() + 1 + envp.len() + 1;
    let mut sp = align_down(top - words * 8, 16);
    let stack_pointer = region.start.get() + sp;

    let mut put_word = |stack: &mut [u8], at: &mut usize, value: u64| {
        stack[*at..*at + 8].copy_from_slice(&value.to_le_bytes());
        *at += 8;
    };
    put_word(stack, &mut sp, argv.len() as u64);
    for i in 0..argv.len() {
        put_word(stack, &mut sp, string_ptrs[i] as u64);
    }
    put_word(stack, &mut sp, 0);
    for i in 0..envp.len() {
        put_word(stack, &mut sp, string_ptrs[argv.len() + i] as u64);
    }
    put_word(stack, &mut sp, 0);

    Ok(StackImage {
        stack_pointer,
        arg0: argv.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header() -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = CLASS_64;
        bytes[5] = DATA_LITTLE_ENDIAN;
        bytes[16..18].copy_from_slice(&TYPE_EXECUTABLE.to_le_bytes());
        bytes[18..20].copy_from_slice(&MACHINE_AARCH64.to_le_bytes());
        bytes[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes());
        bytes[32..40].copy_from_slice(&64u64.to_le_bytes());
        bytes[54..56].copy_from_slice(&56u16.to_le_bytes());
        bytes[56..58].copy_from_slice(&1u16.to_le_bytes());
        bytes
    }

    #[test]
    fn header_parses_and_validates() {
        let header = parse_header(&minimal_header()).unwrap();
        assert_eq!(header.entry, 0x40_0000);
        assert_eq!(header.ph_count, 1);

        let mut wrong_machine = minimal_header();
        wrong_machine[18..20].copy_from_slice(&62u16.to_le_bytes()); // x86_64
        assert_eq!(parse_header(&wrong_machine), Err(SysError::ExecFormat));

        let mut wrong_magic = minimal_header();
        wrong_magic[0] = 0;
        assert_eq!(parse_header(&wrong_magic), Err(SysError::ExecFormat));

        let mut not_exec = minimal_header();
        not_exec[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert_eq!(parse_header(&not_exec), Err(SysError::ExecFormat));
    }

    #[test]
    fn program_header_fields_decode() {
        let mut bytes = [0u8; 56];
        bytes[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        bytes[4..8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        bytes[8..16].copy_from_slice(&0x1000u64.to_le_bytes());
        bytes[16..24].copy_from_slice(&0x40_0000u64.to_le_bytes());
        bytes[32..40].copy_from_slice(&0x123u64.to_le_bytes());
        bytes[40..48].copy_from_slice(&0x200u64.to_le_bytes());
        let segment = parse_program_header(&bytes).unwrap();
        assert_eq!(segment.kind, PT_LOAD);
        assert_eq!(
            segment_permissions(segment.flags),
            MemoryOperation::READ | MemoryOperation::EXECUTE
        );
        assert_eq!(segment.virtual_addr, 0x40_0000);
        assert_eq!(segment.file_size, 0x123);
        assert_eq!(segment.memory_size, 0x200);
    }
}
