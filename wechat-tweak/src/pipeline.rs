// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The version probe → recipe match → patch → re-sign sequence.

use {
    crate::{
        bundle::{probe_version, AppBundle},
        catalog::{PatchRecipe, RecipeCatalog},
        error::{Stage, TweakError},
        patch::{PatchEngine, PatchResult},
        settings::TweakSettings,
        signing::{BundleSigner, CodeSigner, SignResult},
    },
    log::warn,
};

/// Where a pipeline run is at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineState {
    Idle,
    VersionDetected,
    RecipeMatched,
    Patched,
    Signed,
    Done,
    Failed(Stage),
}

/// Summary of a successful run.
#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub version: String,
    pub recipe: PatchRecipe,
    pub patch: PatchResult,
    pub sign: SignResult,
}

/// Drives a tweak run for a single application.
///
/// Steps run strictly in order and the first failure ends the run. A
/// bundle that was patched but failed to sign is left patched: the
/// executable replacement is atomic so the bundle is structurally valid,
/// just not launchable until signed.
pub struct Pipeline<S: CodeSigner> {
    settings: TweakSettings,
    signer: BundleSigner<S>,
    history: Vec<PipelineState>,
}

impl<S: CodeSigner> Pipeline<S> {
    pub fn new(settings: TweakSettings, signer: S) -> Self {
        Self {
            settings,
            signer: BundleSigner::new(signer),
            history: vec![PipelineState::Idle],
        }
    }

    /// The current state.
    pub fn state(&self) -> PipelineState {
        *self
            .history
            .last()
            .expect("history always has an initial state")
    }

    /// Every state the run has been in, in order.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn advance(&mut self, next: PipelineState) {
        self.history.push(next);
    }

    /// Execute the pipeline.
    ///
    /// Can only be called once per instance. Later calls fail with
    /// [TweakError::PipelineAlreadyRun] without touching the history.
    pub fn run(&mut self) -> Result<PipelineReport, TweakError> {
        if self.state() != PipelineState::Idle {
            return Err(TweakError::PipelineAlreadyRun);
        }

        match self.run_steps() {
            Ok(report) => Ok(report),
            Err(e) => {
                self.advance(PipelineState::Failed(e.stage()));
                Err(e)
            }
        }
    }

    fn run_steps(&mut self) -> Result<PipelineReport, TweakError> {
        let app_path = self.settings.app_path().to_path_buf();

        warn!("------ Version ------");
        let version = probe_version(&app_path)?;
        warn!("app version: {}", version);
        self.advance(PipelineState::VersionDetected);

        warn!("------ Config ------");
        let catalog = RecipeCatalog::load(self.settings.catalog_source())?;
        let recipe = catalog
            .find(&version)
            .cloned()
            .ok_or_else(|| TweakError::NoMatch(version.clone()))?;
        warn!("matched config: {}", recipe);
        self.advance(PipelineState::RecipeMatched);

        warn!("------ Patch ------");
        let executable = AppBundle::new_from_path(&app_path)
            .and_then(|bundle| bundle.main_executable_path())
            .map_err(TweakError::MainExecutable)?;
        let patch = PatchEngine::new(&recipe).patch_file(&executable)?;
        match &patch {
            PatchResult::AlreadyPatched => {
                warn!("{} already patched", executable.display())
            }
            PatchResult::Patched { slices } => {
                warn!("patched {} ({} slices)", executable.display(), slices.len())
            }
        }
        self.advance(PipelineState::Patched);

        warn!("------ Resign ------");
        // A fresh rewrite always needs a new signature. An untouched binary
        // only does if its current signature is invalid.
        let force = self.settings.force_sign() || matches!(patch, PatchResult::Patched { .. });
        let sign = self
            .signer
            .sign(&app_path, self.settings.identity(), force)?;
        self.advance(PipelineState::Signed);

        self.advance(PipelineState::Done);
        warn!("Done!");

        Ok(PipelineReport {
            version,
            recipe,
            patch,
            sign,
        })
    }
}
