// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Version-keyed patch recipes.

A patch config is a JSON array of records. Each record names the exact
application version it applies to, the library to inject, and optionally
groups of fixed-address byte replacements:

```json
[
  {
    "version": "31927",
    "library": "@executable_path/../Frameworks/WeChatTweak.framework/WeChatTweak",
    "targets": [
      {
        "identifier": "revoke",
        "entries": [
          { "arch": "arm64", "addr": "1045ccb38", "asm": "00008052C0035FD6" }
        ]
      }
    ]
  }
]
```
*/

use {
    crate::error::TweakError,
    log::info,
    reqwest::Url,
    serde::Deserialize,
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
    },
};

#[derive(Clone, Debug, Deserialize)]
struct RecipeRecord {
    version: String,
    library: String,
    #[serde(default)]
    targets: Vec<TargetRecord>,
}

#[derive(Clone, Debug, Deserialize)]
struct TargetRecord {
    identifier: String,
    #[serde(default)]
    entries: Vec<EntryRecord>,
}

#[derive(Clone, Debug, Deserialize)]
struct EntryRecord {
    arch: String,
    addr: String,
    asm: String,
}

/// Replacement of bytes at a fixed virtual address in one architecture.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryEdit {
    /// Name of the feature this edit belongs to.
    pub target: String,
    /// Architecture name of the slice to edit (e.g. `arm64`).
    pub arch: String,
    /// Virtual address of the first replaced byte.
    pub address: u64,
    /// Replacement bytes.
    pub bytes: Vec<u8>,
}

/// Instructions for tweaking one specific application version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchRecipe {
    pub version: String,
    /// Install name of the library to load at launch.
    pub library: String,
    pub edits: Vec<BinaryEdit>,
}

impl std::fmt::Display for PatchRecipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "version {} -> {} ({} edits)",
            self.version,
            self.library,
            self.edits.len()
        )
    }
}

fn parse_address(s: &str) -> Result<u64, TweakError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    u64::from_str_radix(digits, 16)
        .map_err(|_| TweakError::Config(format!("address {} is not hexadecimal", s)))
}

impl TryFrom<RecipeRecord> for PatchRecipe {
    type Error = TweakError;

    fn try_from(record: RecipeRecord) -> Result<Self, Self::Error> {
        if record.version.trim().is_empty() {
            return Err(TweakError::Config("record has empty version".into()));
        }
        if record.library.trim().is_empty() || record.library.contains('\0') {
            return Err(TweakError::Config(format!(
                "record for version {} has invalid library {:?}",
                record.version, record.library
            )));
        }

        let mut edits = vec![];

        for target in record.targets {
            for entry in target.entries {
                let bytes = hex::decode(entry.asm.trim()).map_err(|e| {
                    TweakError::Config(format!(
                        "{}: bad replacement bytes for {}: {}",
                        target.identifier, entry.arch, e
                    ))
                })?;

                if bytes.is_empty() {
                    return Err(TweakError::Config(format!(
                        "{}: empty replacement bytes for {}",
                        target.identifier, entry.arch
                    )));
                }

                edits.push(BinaryEdit {
                    target: target.identifier.clone(),
                    arch: entry.arch,
                    address: parse_address(entry.addr.trim())?,
                    bytes,
                });
            }
        }

        Ok(Self {
            version: record.version,
            library: record.library,
            edits,
        })
    }
}

/// Where a patch config comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CatalogSource {
    Path(PathBuf),
    Url(Url),
}

impl std::fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Url(u) => write!(f, "{}", u),
        }
    }
}

impl CatalogSource {
    /// Interpret a user supplied string as a local file or a remote URL.
    ///
    /// Existing files win over URL parsing.
    pub fn parse(s: &str) -> Result<Self, TweakError> {
        let path = Path::new(s);

        if path.is_file() {
            Ok(Self::Path(path.to_path_buf()))
        } else {
            Url::parse(s)
                .map(Self::Url)
                .map_err(|e| TweakError::Config(format!("{} is neither a file nor a URL: {}", s, e)))
        }
    }

    /// Obtain the raw config bytes.
    pub fn fetch(&self) -> Result<Vec<u8>, TweakError> {
        match self {
            Self::Path(path) => std::fs::read(path)
                .map_err(|e| TweakError::Config(format!("reading {}: {}", path.display(), e))),
            Self::Url(url) => {
                info!("fetching patch config from {}", url);
                let response = reqwest::blocking::get(url.clone())?;

                if !response.status().is_success() {
                    return Err(TweakError::Config(format!(
                        "HTTP {} fetching {}",
                        response.status(),
                        url
                    )));
                }

                Ok(response.bytes()?.to_vec())
            }
        }
    }
}

/// A collection of patch recipes keyed by application version.
#[derive(Clone, Debug, Default)]
pub struct RecipeCatalog {
    recipes: Vec<PatchRecipe>,
}

impl RecipeCatalog {
    /// Parse a catalog from JSON bytes.
    pub fn from_json_slice(data: &[u8]) -> Result<Self, TweakError> {
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(TweakError::Config("patch config is empty".into()));
        }

        let records = serde_json::from_slice::<Vec<RecipeRecord>>(data)?;

        if records.is_empty() {
            return Err(TweakError::Config("patch config contains no records".into()));
        }

        let recipes = records
            .into_iter()
            .map(PatchRecipe::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { recipes })
    }

    /// Fetch and parse a catalog from a source.
    pub fn load(source: &CatalogSource) -> Result<Self, TweakError> {
        Self::from_json_slice(&source.fetch()?)
    }

    /// Find the recipe for an exact version string.
    ///
    /// When several records share a version, the first one wins.
    pub fn find(&self, version: &str) -> Option<&PatchRecipe> {
        self.recipes.iter().find(|r| r.version == version)
    }

    /// Distinct versions in the order they appear.
    pub fn versions(&self) -> Vec<&str> {
        let mut seen = HashSet::new();

        self.recipes
            .iter()
            .map(|r| r.version.as_str())
            .filter(|v| seen.insert(*v))
            .collect()
    }

    /// All recipes, including duplicates, in source order.
    pub fn recipes(&self) -> &[PatchRecipe] {
        &self.recipes
    }
}
