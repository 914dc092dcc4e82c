// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Settings for a tweak run.

use {
    crate::{catalog::CatalogSource, signing::SigningIdentity},
    reqwest::Url,
    std::path::{Path, PathBuf},
};

/// Where the application is installed by default.
pub const DEFAULT_APP_PATH: &str = "/Applications/WeChat.app";

/// Where the patch config is published by default.
pub const DEFAULT_CONFIG_URL: &str =
    "https://raw.githubusercontent.com/sunnyyoung/WeChatTweak/refs/heads/feature/2.0/config.json";

/// Represents settings for tweaking an application.
#[derive(Clone, Debug)]
pub struct TweakSettings {
    app_path: PathBuf,
    catalog_source: CatalogSource,
    identity: SigningIdentity,
    force_sign: bool,
}

impl Default for TweakSettings {
    fn default() -> Self {
        Self {
            app_path: PathBuf::from(DEFAULT_APP_PATH),
            catalog_source: CatalogSource::Url(
                Url::parse(DEFAULT_CONFIG_URL).expect("default config URL should parse"),
            ),
            identity: SigningIdentity::AdHoc,
            force_sign: false,
        }
    }
}

impl TweakSettings {
    /// Path of the application bundle to tweak.
    pub fn app_path(&self) -> &Path {
        &self.app_path
    }

    pub fn set_app_path(&mut self, path: impl AsRef<Path>) {
        self.app_path = path.as_ref().to_path_buf();
    }

    /// Where to read the patch config from.
    pub fn catalog_source(&self) -> &CatalogSource {
        &self.catalog_source
    }

    pub fn set_catalog_source(&mut self, source: CatalogSource) {
        self.catalog_source = source;
    }

    /// The identity used to re-sign the bundle.
    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    pub fn set_identity(&mut self, identity: SigningIdentity) {
        self.identity = identity;
    }

    /// Whether to sign even when the existing signature is valid.
    pub fn force_sign(&self) -> bool {
        self.force_sign
    }

    pub fn set_force_sign(&mut self, value: bool) {
        self.force_sign = value;
    }
}
