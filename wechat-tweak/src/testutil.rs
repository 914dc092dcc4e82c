// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synthetic Mach-O binaries and bundles for tests.

use {
    crate::{
        bundle::AppBundle,
        error::SignError,
        signing::{CodeSigner, SigningIdentity},
    },
    goblin::mach::{
        cputype::{CpuSubType, CpuType, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64},
        fat::FAT_MAGIC,
        header::{MH_EXECUTE, MH_MAGIC, MH_MAGIC_64},
        load_command::{LC_LOAD_DYLIB, LC_SEGMENT, LC_SEGMENT_64},
    },
    scroll::{Pread, Pwrite, LE},
    sha2::Digest,
    std::{
        cell::Cell,
        path::{Path, PathBuf},
    },
};

const TEXT_SEGMENT_SIZE: usize = 0x4000;
const LINKEDIT_SIZE: usize = 0x200;

/// Describes a minimal executable: `__PAGEZERO`, `__TEXT` with a `__text`
/// section, `__LINKEDIT`, then dylib load commands.
#[derive(Clone, Debug)]
pub struct MachOFixture {
    pub cputype: CpuType,
    pub cpusubtype: CpuSubType,
    pub is_64: bool,
    /// File offset of the `__text` section. Everything between the end of
    /// the load commands and here is zero padding.
    pub text_offset: u32,
    pub libraries: Vec<String>,
}

struct Writer {
    data: Vec<u8>,
    offset: usize,
    is_64: bool,
}

impl Writer {
    fn u32(&mut self, v: u32) {
        self.data.pwrite_with(v, self.offset, LE).unwrap();
        self.offset += 4;
    }

    /// A pointer sized value.
    fn word(&mut self, v: u64) {
        if self.is_64 {
            self.data.pwrite_with(v, self.offset, LE).unwrap();
            self.offset += 8;
        } else {
            self.u32(v as u32);
        }
    }

    fn name(&mut self, name: &str) {
        self.data[self.offset..self.offset + name.len()].copy_from_slice(name.as_bytes());
        self.offset += 16;
    }

    fn bytes(&mut self, data: &[u8], padded_len: usize) {
        self.data[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += padded_len;
    }
}

impl MachOFixture {
    pub fn arm64() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            is_64: true,
            text_offset: 0x1000,
            libraries: vec!["/usr/lib/libSystem.B.dylib".to_string()],
        }
    }

    /// arm64 with the pointer authentication ABI.
    pub fn arm64e() -> Self {
        Self {
            cpusubtype: 0x8000_0002,
            ..Self::arm64()
        }
    }

    pub fn x86_64() -> Self {
        Self {
            cputype: CPU_TYPE_X86_64,
            cpusubtype: 3,
            ..Self::arm64()
        }
    }

    pub fn i386() -> Self {
        Self {
            cputype: CPU_TYPE_X86,
            cpusubtype: 3,
            is_64: false,
            ..Self::arm64()
        }
    }

    fn header_size(&self) -> usize {
        if self.is_64 {
            32
        } else {
            28
        }
    }

    fn segment_size(&self) -> usize {
        if self.is_64 {
            72
        } else {
            56
        }
    }

    fn section_size(&self) -> usize {
        if self.is_64 {
            80
        } else {
            68
        }
    }

    fn dylib_command_size(&self, library: &str) -> usize {
        let align = if self.is_64 { 8 } else { 4 };
        (24 + library.len() + 1 + align - 1) / align * align
    }

    fn text_vmaddr(&self) -> u64 {
        if self.is_64 {
            0x1_0000_0000
        } else {
            0x1000
        }
    }

    /// Virtual address of the start of the `__text` section.
    pub fn text_address(&self) -> u64 {
        self.text_vmaddr() + self.text_offset as u64
    }

    fn sizeofcmds(&self) -> usize {
        self.segment_size() * 3
            + self.section_size()
            + self
                .libraries
                .iter()
                .map(|l| self.dylib_command_size(l))
                .sum::<usize>()
    }

    /// Offset of the end of the load command region.
    pub fn commands_end(&self) -> usize {
        self.header_size() + self.sizeofcmds()
    }

    pub fn build(&self) -> Vec<u8> {
        assert!(self.text_offset as usize >= self.commands_end());

        let mut data = vec![0u8; TEXT_SEGMENT_SIZE + LINKEDIT_SIZE];

        // Recognizable non-zero content for code and linkedit data.
        for (i, b) in data[self.text_offset as usize..].iter_mut().enumerate() {
            *b = (i % 251) as u8 | 1;
        }

        let mut w = Writer {
            data,
            offset: 0,
            is_64: self.is_64,
        };

        let (segment_cmd, magic) = if self.is_64 {
            (LC_SEGMENT_64, MH_MAGIC_64)
        } else {
            (LC_SEGMENT, MH_MAGIC)
        };

        w.u32(magic);
        w.u32(self.cputype);
        w.u32(self.cpusubtype);
        w.u32(MH_EXECUTE);
        w.u32(3 + self.libraries.len() as u32);
        w.u32(self.sizeofcmds() as u32);
        w.u32(0);
        if self.is_64 {
            w.u32(0);
        }

        let text_vmaddr = self.text_vmaddr();

        // __PAGEZERO
        w.u32(segment_cmd);
        w.u32(self.segment_size() as u32);
        w.name("__PAGEZERO");
        w.word(0);
        w.word(text_vmaddr);
        w.word(0);
        w.word(0);
        w.u32(0);
        w.u32(0);
        w.u32(0);
        w.u32(0);

        // __TEXT, covering the header and load commands.
        w.u32(segment_cmd);
        w.u32((self.segment_size() + self.section_size()) as u32);
        w.name("__TEXT");
        w.word(text_vmaddr);
        w.word(TEXT_SEGMENT_SIZE as u64);
        w.word(0);
        w.word(TEXT_SEGMENT_SIZE as u64);
        w.u32(5);
        w.u32(5);
        w.u32(1);
        w.u32(0);

        w.name("__text");
        w.name("__TEXT");
        w.word(self.text_address());
        w.word((TEXT_SEGMENT_SIZE - self.text_offset as usize) as u64);
        w.u32(self.text_offset);
        w.u32(2);
        w.u32(0);
        w.u32(0);
        w.u32(0x8000_0400);
        w.u32(0);
        w.u32(0);
        if self.is_64 {
            w.u32(0);
        }

        // __LINKEDIT
        w.u32(segment_cmd);
        w.u32(self.segment_size() as u32);
        w.name("__LINKEDIT");
        w.word(text_vmaddr + TEXT_SEGMENT_SIZE as u64);
        w.word(0x4000);
        w.word(TEXT_SEGMENT_SIZE as u64);
        w.word(LINKEDIT_SIZE as u64);
        w.u32(1);
        w.u32(1);
        w.u32(0);
        w.u32(0);

        for library in &self.libraries {
            let size = self.dylib_command_size(library);
            w.u32(LC_LOAD_DYLIB);
            w.u32(size as u32);
            w.u32(24);
            w.u32(2);
            w.u32(0x10000);
            w.u32(0x10000);
            w.bytes(library.as_bytes(), size - 24);
        }

        assert_eq!(w.offset, self.commands_end());

        w.data
    }
}

/// Wrap single architecture binaries in a fat binary.
///
/// Slices are aligned on 4k boundaries.
pub fn build_fat(binaries: &[&[u8]]) -> Vec<u8> {
    const ALIGN_VALUE: u32 = 12;
    let align = 1usize << ALIGN_VALUE;

    let mut data = vec![0u8; align];
    data.pwrite_with(FAT_MAGIC, 0, scroll::BE).unwrap();
    data.pwrite_with(binaries.len() as u32, 4, scroll::BE).unwrap();

    for (i, binary) in binaries.iter().enumerate() {
        let offset = data.len();
        let cputype = binary.pread_with::<u32>(4, LE).unwrap();
        let cpusubtype = binary.pread_with::<u32>(8, LE).unwrap();

        let record = 8 + i * 20;
        data.pwrite_with(cputype, record, scroll::BE).unwrap();
        data.pwrite_with(cpusubtype, record + 4, scroll::BE).unwrap();
        data.pwrite_with(offset as u32, record + 8, scroll::BE).unwrap();
        data.pwrite_with(binary.len() as u32, record + 12, scroll::BE)
            .unwrap();
        data.pwrite_with(ALIGN_VALUE, record + 16, scroll::BE).unwrap();

        data.extend_from_slice(binary);
        let padding = (align - data.len() % align) % align;
        data.extend(std::iter::repeat(0u8).take(padding));
    }

    data
}

/// Create `WeChat.app` in a new temporary directory.
pub fn create_app(
    version: &str,
    executable: &[u8],
) -> std::io::Result<(tempfile::TempDir, PathBuf)> {
    let td = tempfile::Builder::new().prefix("wechat-tweak-").tempdir()?;
    let app = td.path().join("WeChat.app");
    let macos = app.join("Contents").join("MacOS");
    std::fs::create_dir_all(&macos)?;

    let mut dict = plist::Dictionary::new();
    dict.insert("CFBundleIdentifier".into(), "com.tencent.xinWeChat".into());
    dict.insert("CFBundleVersion".into(), version.into());
    dict.insert("CFBundleExecutable".into(), "WeChat".into());
    plist::Value::from(dict)
        .to_file_xml(app.join("Contents").join("Info.plist"))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    std::fs::write(macos.join("WeChat"), executable)?;

    Ok((td, app))
}

pub fn main_executable(app: &Path) -> PathBuf {
    app.join("Contents").join("MacOS").join("WeChat")
}

/// A [CodeSigner] that records a digest of the main executable.
///
/// The "signature" is valid when the digest matches the executable's current
/// content, mirroring how a real code directory covers the binary.
#[derive(Default)]
pub struct RecordingSigner {
    sign_calls: Cell<usize>,
    produce_invalid: bool,
}

impl RecordingSigner {
    /// A signer whose signatures never verify.
    pub fn invalid() -> Self {
        Self {
            produce_invalid: true,
            ..Default::default()
        }
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.get()
    }

    fn signature_path(bundle: &Path) -> PathBuf {
        bundle
            .join("Contents")
            .join("_CodeSignature")
            .join("digest")
    }

    fn executable_digest(bundle: &Path) -> Result<String, SignError> {
        let exe = AppBundle::new_from_path(bundle)
            .and_then(|b| b.main_executable_path())
            .map_err(|e| SignError::ToolFailure(e.to_string()))?;
        let data = std::fs::read(exe).map_err(|e| SignError::ToolFailure(e.to_string()))?;

        Ok(hex::encode(sha2::Sha256::digest(&data)))
    }
}

impl CodeSigner for RecordingSigner {
    fn sign(&self, bundle: &Path, identity: &SigningIdentity) -> Result<(), SignError> {
        if let SigningIdentity::Named(name) = identity {
            return Err(SignError::MissingIdentity(name.clone()));
        }

        self.sign_calls.set(self.sign_calls.get() + 1);

        let digest = if self.produce_invalid {
            "0".repeat(64)
        } else {
            Self::executable_digest(bundle)?
        };

        let path = Self::signature_path(bundle);
        std::fs::create_dir_all(path.parent().unwrap())
            .and_then(|_| std::fs::write(&path, digest))
            .map_err(|e| SignError::ToolFailure(e.to_string()))
    }

    fn verify(&self, bundle: &Path) -> Result<bool, SignError> {
        match std::fs::read_to_string(Self::signature_path(bundle)) {
            Ok(recorded) => Ok(recorded == Self::executable_digest(bundle)?),
            Err(_) => Ok(false),
        }
    }
}
