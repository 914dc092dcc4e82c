// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tweak installed macOS applications.
//!
//! This crate injects an externally supplied dynamic library into an
//! application bundle's main executable and restores a valid code signature
//! so the operating system still runs it. A run goes through these steps:
//!
//! 1. Read the application version from the bundle's `Info.plist`. (See
//!    [probe_version].)
//! 2. Select the patch recipe for exactly that version from a JSON config,
//!    read from disk or fetched over HTTP. (See [RecipeCatalog].)
//! 3. Insert an `LC_LOAD_WEAK_DYLIB` load command into every architecture
//!    slice of the executable and apply the recipe's byte edits, then replace
//!    the executable atomically. (See [PatchEngine].)
//! 4. Re-sign the bundle. (See [BundleSigner] and [CodeSigner].)
//!
//! [Pipeline] drives these steps in order and records which stage failed.
//!
//! Patching is idempotent: slices already loading the library are left
//! alone, and an executable whose slices are all patched is never rewritten.
//!
//! Load commands are only ever written into the padding linkers leave
//! between the load commands and the first section. Binaries without
//! enough padding are rejected rather than relaid out.

mod bundle;
pub use bundle::*;
mod catalog;
pub use catalog::*;
mod error;
pub use error::*;
mod macho;
pub use macho::*;
mod patch;
pub use patch::*;
mod pipeline;
pub use pipeline::*;
mod settings;
pub use settings::*;
mod signing;
pub use signing::*;

#[cfg(test)]
mod testutil;
