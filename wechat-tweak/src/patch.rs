// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Injecting a library load command into Mach-O binaries.
//!
//! The rewrite happens on an in-memory copy of the executable. The new
//! load command consumes padding between the existing load commands and the
//! first section, so no other content moves and every offset recorded in the
//! binary (segments, sections, `__LINKEDIT` tables, fat arch records) stays
//! valid. The result is published by renaming a temporary file over the
//! original.

use {
    crate::{
        catalog::{BinaryEdit, PatchRecipe},
        error::PatchError,
        macho::{macho_slices, weak_dylib_command, write_load_command_totals, SliceLayout},
    },
    log::{info, warn},
    std::{collections::BTreeSet, io::Write, path::Path},
};

/// What happened to one architecture slice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SliceOutcome {
    /// The slice already loads the library and was left alone.
    AlreadyPatched { arch: String },
    /// A load command was inserted and edits applied.
    Patched {
        arch: String,
        command_size: usize,
        edits_applied: usize,
    },
}

/// Result of patching a file on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PatchResult {
    /// Every slice already loads the library. The file was not written.
    AlreadyPatched,
    /// At least one slice was rewritten and the file replaced.
    Patched { slices: Vec<SliceOutcome> },
}

/// A rewritten executable image.
#[derive(Clone, Debug)]
pub struct PatchedImage {
    pub data: Vec<u8>,
    pub slices: Vec<SliceOutcome>,
}

impl PatchedImage {
    /// Whether any slice differs from the input.
    pub fn is_modified(&self) -> bool {
        self.slices
            .iter()
            .any(|s| matches!(s, SliceOutcome::Patched { .. }))
    }
}

/// Applies a [PatchRecipe] to Mach-O executables.
pub struct PatchEngine<'a> {
    recipe: &'a PatchRecipe,
}

impl<'a> PatchEngine<'a> {
    pub fn new(recipe: &'a PatchRecipe) -> Self {
        Self { recipe }
    }

    /// Rewrite Mach-O data (single arch or universal) in memory.
    ///
    /// Slices already loading the recipe's library are skipped. The input is
    /// never modified.
    pub fn patch_data(&self, data: &[u8]) -> Result<PatchedImage, PatchError> {
        let slices = macho_slices(data)?;

        let slice_arches = slices.iter().map(|s| s.arch()).collect::<BTreeSet<_>>();
        for edit in &self.recipe.edits {
            if !slice_arches.contains(&edit.arch) {
                warn!(
                    "{} edit at {:#x} targets {} which is not present in binary; ignoring",
                    edit.target, edit.address, edit.arch
                );
            }
        }

        let mut output = data.to_vec();
        let mut outcomes = vec![];

        for slice in slices {
            let slice_data = &mut output[slice.offset..slice.offset + slice.size];
            outcomes.push(self.patch_slice(slice_data)?);
        }

        Ok(PatchedImage {
            data: output,
            slices: outcomes,
        })
    }

    /// Patch a single architecture binary in place.
    fn patch_slice(&self, data: &mut [u8]) -> Result<SliceOutcome, PatchError> {
        let layout = SliceLayout::parse(data)?;
        let arch = layout.arch();
        let library = self.recipe.library.as_str();

        if layout.loads_library(library) {
            warn!("{} slice already loads {}; skipping", arch, library);
            return Ok(SliceOutcome::AlreadyPatched { arch });
        }

        let command = weak_dylib_command(library, layout.is_64, layout.endian)?;

        if command.len() > layout.slack {
            return Err(PatchError::InsufficientSpace {
                arch,
                required: command.len(),
                available: layout.slack,
            });
        }

        // Resolve all edits before writing anything.
        let slice_size = data.len();
        let edits = self
            .recipe
            .edits
            .iter()
            .filter(|edit| edit.arch == arch)
            .map(|edit| resolve_edit(&layout, edit, slice_size).map(|offset| (offset, edit)))
            .collect::<Result<Vec<_>, _>>()?;

        let start = layout.commands_end();
        info!(
            "{}: writing {} byte load command at offset {} ({} bytes of padding available)",
            arch,
            command.len(),
            start,
            layout.slack
        );
        data[start..start + command.len()].copy_from_slice(&command);

        let ncmds = layout.ncmds + 1;
        let sizeofcmds = layout.sizeofcmds + command.len();
        write_load_command_totals(data, ncmds, sizeofcmds)?;

        for (offset, edit) in &edits {
            info!(
                "{}: {} writing {} bytes at {:#x} (file offset {})",
                arch,
                edit.target,
                edit.bytes.len(),
                edit.address,
                offset
            );
            data[*offset..*offset + edit.bytes.len()].copy_from_slice(&edit.bytes);
        }

        // A nice side-effect of re-parsing is that it catches bugs if we write malformed Mach-O.
        let patched = SliceLayout::parse(data)?;
        if patched.ncmds != ncmds
            || patched.sizeofcmds != sizeofcmds
            || !patched.loads_library(library)
        {
            return Err(PatchError::CorruptHeader(format!(
                "{} slice failed verification after inserting load command",
                arch
            )));
        }

        warn!("injected {} into {} slice", library, arch);

        Ok(SliceOutcome::Patched {
            arch,
            command_size: command.len(),
            edits_applied: edits.len(),
        })
    }

    /// Patch the executable at `path`, replacing it atomically.
    ///
    /// On error, or when every slice is already patched, the file is left
    /// untouched.
    pub fn patch_file(&self, path: &Path) -> Result<PatchResult, PatchError> {
        let data = std::fs::read(path)?;
        let image = self.patch_data(&data)?;

        if !image.is_modified() {
            return Ok(PatchResult::AlreadyPatched);
        }

        write_atomic(path, &image.data)?;

        Ok(PatchResult::Patched {
            slices: image.slices,
        })
    }
}

fn resolve_edit(
    layout: &SliceLayout,
    edit: &BinaryEdit,
    slice_size: usize,
) -> Result<usize, PatchError> {
    let offset = layout
        .file_offset_for_address(edit.address, edit.bytes.len())
        .ok_or_else(|| {
            PatchError::CorruptHeader(format!(
                "{} edit address {:#x} is not mapped to file content in {} slice",
                edit.target, edit.address, edit.arch
            ))
        })?;

    if offset < layout.content_offset || offset + edit.bytes.len() > slice_size {
        return Err(PatchError::CorruptHeader(format!(
            "{} edit address {:#x} resolves outside code and data of {} slice",
            edit.target, edit.address, edit.arch
        )));
    }

    Ok(offset)
}

/// Replace the file at `path` with `data` via a temporary file and rename.
///
/// The temporary file lives in the same directory so the rename stays on one
/// filesystem. The original's permissions are carried over.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PatchError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let permissions = std::fs::metadata(path)?.permissions();

    let mut temp = tempfile::Builder::new()
        .prefix(".wechattweak-")
        .tempfile_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    std::fs::set_permissions(temp.path(), permissions)?;

    temp.persist(path).map_err(|e| PatchError::Io(e.error))?;

    Ok(())
}
