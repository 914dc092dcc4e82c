// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O primitives related to load command insertion.

A Mach-O file is either a single architecture binary or a fat/universal
binary containing several of them. We model both as a list of slices: a
single architecture file is a fat binary with exactly one slice at offset 0.

Within a slice, the header is followed by `sizeofcmds` bytes of load
commands. Linkers leave padding between the end of the load commands and
the first section (the `__text` section is usually page aligned), and new
load commands can be written into that padding without moving anything
else in the file.
*/

use {
    crate::error::PatchError,
    goblin::mach::{
        constants::SEG_PAGEZERO,
        cputype::{
            CpuSubType, CpuType, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32,
            CPU_TYPE_POWERPC, CPU_TYPE_POWERPC64, CPU_TYPE_X86, CPU_TYPE_X86_64,
        },
        fat::FAT_MAGIC,
        header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64, SIZEOF_HEADER_32, SIZEOF_HEADER_64},
        load_command::{CommandVariant, Dylib, DylibCommand, LC_LOAD_WEAK_DYLIB},
        parse_magic_and_ctx, Mach, MachO,
    },
    scroll::{ctx::SizeWith, Endian, Pread, Pwrite},
};

/// Timestamp value `ld` writes into dylib commands.
const DYLIB_TIMESTAMP: u32 = 2;

/// Capability bits in the high byte of a CPU subtype.
const CPU_SUBTYPE_FEATURE_MASK: CpuSubType = 0xff00_0000;

/// Pointer authentication ABI for arm64.
const CPU_SUBTYPE_ARM64E: CpuSubType = 2;

/// The container format of a file, as identified by its magic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MachFormat {
    Thin,
    Fat,
}

/// Identify the container format by sniffing the leading magic.
pub fn sniff_format(data: &[u8]) -> Result<MachFormat, PatchError> {
    let magic = data
        .pread_with::<u32>(0, scroll::BE)
        .map_err(|_| PatchError::UnsupportedFormat)?;

    match magic {
        FAT_MAGIC => Ok(MachFormat::Fat),
        MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64 => Ok(MachFormat::Thin),
        _ => Err(PatchError::UnsupportedFormat),
    }
}

/// Resolve a human friendly architecture name for a CPU type.
///
/// Names match what patch configs use to target slices. `arm64e` is distinct
/// from `arm64` because its code differs.
pub fn arch_name(cputype: CpuType, cpusubtype: CpuSubType) -> String {
    match cputype {
        CPU_TYPE_ARM64
            if cpusubtype & !CPU_SUBTYPE_FEATURE_MASK == CPU_SUBTYPE_ARM64E =>
        {
            "arm64e".to_string()
        }
        CPU_TYPE_ARM64 => "arm64".to_string(),
        CPU_TYPE_X86_64 => "x86_64".to_string(),
        CPU_TYPE_ARM64_32 => "arm64_32".to_string(),
        CPU_TYPE_ARM => "arm".to_string(),
        CPU_TYPE_X86 => "i386".to_string(),
        CPU_TYPE_POWERPC => "ppc".to_string(),
        CPU_TYPE_POWERPC64 => "ppc64".to_string(),
        _ => format!("cpu{}", cputype),
    }
}

/// The location of one architecture's Mach-O binary within a file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachOSlice {
    /// Index of the slice within the file.
    pub index: usize,
    /// Start offset of the slice within the file.
    pub offset: usize,
    /// Size in bytes of the slice.
    pub size: usize,
    pub cputype: CpuType,
    pub cpusubtype: CpuSubType,
}

impl MachOSlice {
    pub fn arch(&self) -> String {
        arch_name(self.cputype, self.cpusubtype)
    }

    /// The data belonging to this slice.
    pub fn data<'a>(&self, file_data: &'a [u8]) -> &'a [u8] {
        &file_data[self.offset..self.offset + self.size]
    }
}

/// Enumerate the architecture slices of a Mach-O file.
pub fn macho_slices(data: &[u8]) -> Result<Vec<MachOSlice>, PatchError> {
    match sniff_format(data)? {
        MachFormat::Thin => {
            let macho = MachO::parse(data, 0)?;

            Ok(vec![MachOSlice {
                index: 0,
                offset: 0,
                size: data.len(),
                cputype: macho.header.cputype,
                cpusubtype: macho.header.cpusubtype,
            }])
        }
        MachFormat::Fat => {
            let multiarch = match Mach::parse(data)? {
                Mach::Fat(multiarch) => multiarch,
                Mach::Binary(_) => {
                    return Err(PatchError::CorruptHeader(
                        "fat magic did not yield fat binary".into(),
                    ))
                }
            };

            multiarch
                .iter_arches()
                .enumerate()
                .map(|(index, arch)| {
                    let arch = arch?;
                    let offset = arch.offset as usize;
                    let size = arch.size as usize;

                    if offset.checked_add(size).map_or(true, |end| end > data.len()) {
                        return Err(PatchError::CorruptHeader(format!(
                            "slice {} extends past end of file",
                            index
                        )));
                    }

                    Ok(MachOSlice {
                        index,
                        offset,
                        size,
                        cputype: arch.cputype,
                        cpusubtype: arch.cpusubtype,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        }
    }
}

/// File extent and address of a segment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentExtent {
    pub name: String,
    pub vmaddr: u64,
    pub fileoff: u64,
    pub filesize: u64,
}

/// Describes the header and load command region of a single Mach-O slice.
#[derive(Clone, Debug)]
pub struct SliceLayout {
    pub is_64: bool,
    pub endian: Endian,
    pub cputype: CpuType,
    pub cpusubtype: CpuSubType,
    /// Size of the `mach_header` structure.
    pub header_size: usize,
    /// Number of load commands recorded in the header.
    pub ncmds: usize,
    /// Size of load commands recorded in the header.
    pub sizeofcmds: usize,
    /// Offset of the first byte of section/segment content following the
    /// load commands.
    pub content_offset: usize,
    /// Contiguous zero bytes after the load command region.
    pub slack: usize,
    /// Install names of all libraries loaded by dylib load commands.
    pub libraries: Vec<String>,
    pub segments: Vec<SegmentExtent>,
}

impl SliceLayout {
    /// Parse the header of a single architecture Mach-O binary.
    ///
    /// Errors if the header is not internally consistent.
    pub fn parse(data: &[u8]) -> Result<Self, PatchError> {
        let ctx = parse_magic_and_ctx(data, 0)?
            .1
            .ok_or_else(|| PatchError::CorruptHeader("not a single architecture binary".into()))?;

        let macho = MachO::parse(data, 0)?;

        let header_size = if macho.is_64 {
            SIZEOF_HEADER_64
        } else {
            SIZEOF_HEADER_32
        };
        let sizeofcmds = macho.header.sizeofcmds as usize;
        let commands_end = header_size + sizeofcmds;

        if commands_end > data.len() {
            return Err(PatchError::CorruptHeader(format!(
                "load commands end at {} past slice size {}",
                commands_end,
                data.len()
            )));
        }

        if macho.load_commands.len() != macho.header.ncmds as usize {
            return Err(PatchError::CorruptHeader(format!(
                "header declares {} load commands; found {}",
                macho.header.ncmds,
                macho.load_commands.len()
            )));
        }

        let commands_size = macho
            .load_commands
            .iter()
            .map(|lc| lc.command.cmdsize())
            .sum::<usize>();
        if commands_size != sizeofcmds {
            return Err(PatchError::CorruptHeader(format!(
                "header declares {} bytes of load commands; found {}",
                sizeofcmds, commands_size
            )));
        }

        let mut libraries = vec![];

        for lc in &macho.load_commands {
            let command = match &lc.command {
                CommandVariant::LoadDylib(command)
                | CommandVariant::LoadWeakDylib(command)
                | CommandVariant::ReexportDylib(command)
                | CommandVariant::LazyLoadDylib(command)
                | CommandVariant::LoadUpwardDylib(command) => command,
                _ => continue,
            };

            let command_data = &data[lc.offset..lc.offset + command.cmdsize as usize];
            let name = command_data
                .pread::<&str>(command.dylib.name as usize)
                .map_err(|e| {
                    PatchError::CorruptHeader(format!(
                        "unreadable library name in load command at {}: {}",
                        lc.offset, e
                    ))
                })?;

            libraries.push(name.to_string());
        }

        let mut segments = vec![];
        let mut content_offset = data.len();

        for segment in macho.segments.iter() {
            let name = segment.name()?.to_string();

            if segment.fileoff > 0 && segment.filesize > 0 {
                content_offset = content_offset.min(segment.fileoff as usize);
            }

            for (section, _) in segment.sections()? {
                if section.offset > 0 {
                    content_offset = content_offset.min(section.offset as usize);
                }
            }

            segments.push(SegmentExtent {
                name,
                vmaddr: segment.vmaddr,
                fileoff: segment.fileoff,
                filesize: segment.filesize,
            });
        }

        if content_offset < commands_end {
            return Err(PatchError::CorruptHeader(format!(
                "content at offset {} overlaps load commands ending at {}",
                content_offset, commands_end
            )));
        }

        let slack = data[commands_end..content_offset]
            .iter()
            .take_while(|b| **b == 0)
            .count();

        Ok(Self {
            is_64: macho.is_64,
            endian: ctx.le,
            cputype: macho.header.cputype,
            cpusubtype: macho.header.cpusubtype,
            header_size,
            ncmds: macho.header.ncmds as usize,
            sizeofcmds,
            content_offset,
            slack,
            libraries,
            segments,
        })
    }

    pub fn arch(&self) -> String {
        arch_name(self.cputype, self.cpusubtype)
    }

    /// Offset of the first byte after the load command region.
    pub fn commands_end(&self) -> usize {
        self.header_size + self.sizeofcmds
    }

    /// Whether a dylib load command already references `library`.
    pub fn loads_library(&self, library: &str) -> bool {
        self.libraries.iter().any(|l| l == library)
    }

    /// Resolve the slice offset of `len` bytes at virtual address `address`.
    ///
    /// Returns `None` if the range isn't fully backed by file content of a
    /// single segment.
    pub fn file_offset_for_address(&self, address: u64, len: usize) -> Option<usize> {
        self.segments
            .iter()
            .filter(|segment| segment.name != SEG_PAGEZERO && segment.filesize > 0)
            .find_map(|segment| {
                let end = address.checked_add(len as u64)?;
                let segment_end = segment.vmaddr.checked_add(segment.filesize)?;

                if address >= segment.vmaddr && end <= segment_end {
                    let offset = segment.fileoff.checked_add(address - segment.vmaddr)?;
                    usize::try_from(offset).ok()
                } else {
                    None
                }
            })
    }
}

/// Summary of the load command region of one slice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SliceInfo {
    pub arch: String,
    pub offset: usize,
    pub size: usize,
    pub ncmds: usize,
    pub sizeofcmds: usize,
    /// Bytes available for new load commands.
    pub slack: usize,
    pub libraries: Vec<String>,
}

impl std::fmt::Display for SliceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} slice at offset {} ({} bytes)",
            self.arch, self.offset, self.size
        )?;
        writeln!(
            f,
            "  load commands: {} ({} bytes; {} bytes free)",
            self.ncmds, self.sizeofcmds, self.slack
        )?;
        for library in &self.libraries {
            writeln!(f, "  loads {}", library)?;
        }

        Ok(())
    }
}

/// Describe every slice of Mach-O data without modifying it.
pub fn inspect_slices(data: &[u8]) -> Result<Vec<SliceInfo>, PatchError> {
    macho_slices(data)?
        .into_iter()
        .map(|slice| {
            let layout = SliceLayout::parse(slice.data(data))?;

            Ok(SliceInfo {
                arch: slice.arch(),
                offset: slice.offset,
                size: slice.size,
                ncmds: layout.ncmds,
                sizeofcmds: layout.sizeofcmds,
                slack: layout.slack,
                libraries: layout.libraries,
            })
        })
        .collect::<Result<Vec<_>, _>>()
}

/// Serialize an `LC_LOAD_WEAK_DYLIB` load command for `library`.
///
/// A weak load lets the process start even when the library is missing.
/// The path is NUL terminated and the command padded to the pointer size.
pub fn weak_dylib_command(library: &str, is_64: bool, endian: Endian) -> Result<Vec<u8>, PatchError> {
    if library.is_empty() || library.contains('\0') {
        return Err(PatchError::CorruptHeader(format!(
            "invalid library install name: {:?}",
            library
        )));
    }

    let header_size = DylibCommand::size_with(&endian);
    let align = if is_64 { 8 } else { 4 };
    let unpadded = header_size + library.len() + 1;
    let cmdsize = (unpadded + align - 1) / align * align;

    let command = DylibCommand {
        cmd: LC_LOAD_WEAK_DYLIB,
        cmdsize: cmdsize as u32,
        dylib: Dylib {
            name: header_size as u32,
            timestamp: DYLIB_TIMESTAMP,
            current_version: 0,
            compatibility_version: 0,
        },
    };

    let mut data = vec![0u8; cmdsize];
    data.pwrite_with(command, 0, endian)?;
    data[header_size..header_size + library.len()].copy_from_slice(library.as_bytes());

    Ok(data)
}

/// Overwrite the load command count and size in a slice's header.
pub fn write_load_command_totals(
    slice_data: &mut [u8],
    ncmds: usize,
    sizeofcmds: usize,
) -> Result<(), PatchError> {
    let ctx = parse_magic_and_ctx(slice_data, 0)?
        .1
        .ok_or_else(|| PatchError::CorruptHeader("not a single architecture binary".into()))?;

    let mut header = MachO::parse(slice_data, 0)?.header;
    header.ncmds = ncmds as _;
    header.sizeofcmds = sizeofcmds as u32;

    slice_data.pwrite_with(header, 0, ctx)?;

    Ok(())
}
