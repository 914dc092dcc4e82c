// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {std::path::PathBuf, thiserror::Error};

/// A stage of the tweak pipeline.
///
/// Errors are attributed to the stage that produced them so users know
/// whether the version probe, the recipe catalog, the binary rewrite, or
/// the re-signing went wrong.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Version,
    Config,
    Patch,
    Resign,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Version => "Version",
            Self::Config => "Config",
            Self::Patch => "Patch",
            Self::Resign => "Resign",
        })
    }
}

/// Errors from rewriting a Mach-O executable.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("not a recognized Mach-O or universal binary")]
    UnsupportedFormat,

    #[error("insufficient room in {arch} slice for new load command: need {required} bytes, {available} available")]
    InsufficientSpace {
        arch: String,
        required: usize,
        available: usize,
    },

    #[error("corrupt Mach-O header: {0}")]
    CorruptHeader(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<goblin::error::Error> for PatchError {
    fn from(e: goblin::error::Error) -> Self {
        Self::CorruptHeader(format!("binary parsing error: {}", e))
    }
}

impl From<scroll::Error> for PatchError {
    fn from(e: scroll::Error) -> Self {
        Self::CorruptHeader(format!("data structure error: {}", e))
    }
}

/// Errors from re-signing a bundle.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("signing identity not found: {0}")]
    MissingIdentity(String),

    #[error("signing tool failure: {0}")]
    ToolFailure(String),

    #[error("bundle does not exist: {0}")]
    BundleNotFound(PathBuf),
}

/// Unified error type for tweaking an application.
#[derive(Debug, Error)]
pub enum TweakError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid app version: {0}")]
    Version(String),

    #[error("error interfacing with app bundle: {0}")]
    DirectoryBundle(anyhow::Error),

    #[error("unable to locate main executable: {0}")]
    MainExecutable(anyhow::Error),

    #[error("pipeline has already run")]
    PipelineAlreadyRun,

    #[error("invalid patch config: {0}")]
    Config(String),

    #[error("invalid patch config JSON: {0}")]
    ConfigJson(#[from] serde_json::Error),

    #[error("HTTP error fetching patch config: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unsupported app version: {0}")]
    NoMatch(String),

    #[error("{0}")]
    Patch(#[from] PatchError),

    #[error("{0}")]
    Sign(#[from] SignError),
}

impl TweakError {
    /// The pipeline stage this error is attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            // A reused pipeline never gets past its first stage.
            Self::Version(_) | Self::DirectoryBundle(_) | Self::PipelineAlreadyRun => {
                Stage::Version
            }
            Self::CliUnknownCommand
            | Self::CliBadArgument(_)
            | Self::Config(_)
            | Self::ConfigJson(_)
            | Self::Http(_)
            | Self::NoMatch(_) => Stage::Config,
            Self::Io(_) | Self::MainExecutable(_) | Self::Patch(_) => Stage::Patch,
            Self::Sign(_) => Stage::Resign,
        }
    }
}
