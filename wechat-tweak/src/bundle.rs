// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application bundles backed by a directory.

use {
    crate::error::TweakError,
    anyhow::{anyhow, Context, Result},
    std::path::{Path, PathBuf},
};

/// An application bundle on the filesystem.
///
/// Only the pieces needed to locate and identify the main executable are
/// exposed.
#[derive(Clone, Debug)]
pub struct AppBundle {
    /// Root directory of this bundle.
    root: PathBuf,

    /// Whether the bundle is shallow.
    ///
    /// If false, content is in a `Contents/` sub-directory.
    shallow: bool,

    /// Parsed `Info.plist` file.
    info_plist: plist::Dictionary,
}

impl AppBundle {
    /// Open an existing bundle from a filesystem path.
    ///
    /// The specified path should be the root directory of the bundle, e.g.
    /// `WeChat.app`. Validation is limited to locating and parsing an
    /// `Info.plist` file.
    pub fn new_from_path(directory: &Path) -> Result<Self> {
        if !directory.is_dir() {
            return Err(anyhow!("{} is not a directory", directory.display()));
        }

        let contents = directory.join("Contents");
        let shallow = !contents.is_dir();

        let info_plist_path = if shallow {
            directory.join("Info.plist")
        } else {
            contents.join("Info.plist")
        };

        if !info_plist_path.is_file() {
            return Err(anyhow!("Info.plist not found; not a valid bundle"));
        }

        let info_plist_data = std::fs::read(&info_plist_path)?;
        let cursor = std::io::Cursor::new(info_plist_data);
        let value = plist::Value::from_reader(cursor).context("parsing Info.plist")?;
        let info_plist = value
            .into_dictionary()
            .ok_or_else(|| anyhow!("{} is not a dictionary", info_plist_path.display()))?;

        Ok(Self {
            root: directory.to_path_buf(),
            shallow,
            info_plist,
        })
    }

    /// Resolve the absolute path to a file in the bundle.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        if self.shallow {
            self.root.join(path.as_ref())
        } else {
            self.root.join("Contents").join(path.as_ref())
        }
    }

    /// The root directory of this bundle.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Obtain an `Info.plist` key as a `String`.
    ///
    /// Will return `None` if the specified key doesn't exist. Errors if the key value
    /// is not a string.
    pub fn info_plist_key_string(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.info_plist.get(key) {
            Ok(Some(
                value
                    .as_string()
                    .ok_or_else(|| anyhow!("key {} is not a string", key))?
                    .to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Obtain the bundle identifier (`CFBundleIdentifier`).
    pub fn identifier(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundleIdentifier")
    }

    /// Obtain the build version string (`CFBundleVersion`).
    ///
    /// Patch configs are keyed by this value.
    pub fn version(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundleVersion")
    }

    /// Obtain the marketing version string (`CFBundleShortVersionString`).
    pub fn short_version(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundleShortVersionString")
    }

    /// Obtain the name of the bundle's main executable file (`CFBundleExecutable`).
    pub fn main_executable(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundleExecutable")
    }

    /// Resolve the path to the main executable.
    ///
    /// Errors if `CFBundleExecutable` is not defined.
    pub fn main_executable_path(&self) -> Result<PathBuf> {
        let name = self
            .main_executable()?
            .ok_or_else(|| anyhow!("Info.plist does not define CFBundleExecutable"))?;

        if self.shallow {
            Ok(self.root.join(name))
        } else {
            Ok(self.resolve_path("MacOS").join(name))
        }
    }
}

/// Read the installed version of the application at `app_path`.
pub fn probe_version(app_path: &Path) -> Result<String, TweakError> {
    if !app_path.exists() {
        return Err(TweakError::Version(format!(
            "{} does not exist",
            app_path.display()
        )));
    }

    let bundle = AppBundle::new_from_path(app_path).map_err(TweakError::DirectoryBundle)?;

    match bundle.version().map_err(TweakError::DirectoryBundle)? {
        Some(version) if !version.trim().is_empty() => Ok(version),
        _ => Err(TweakError::Version(format!(
            "{} does not define CFBundleVersion",
            bundle.resolve_path("Info.plist").display()
        ))),
    }
}
