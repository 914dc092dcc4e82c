// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-signing bundles after their executable was rewritten.
//!
//! Any modification of a Mach-O binary invalidates its embedded code
//! signature. We don't produce signatures ourselves: signing is delegated to
//! a [CodeSigner], which by default is Apple's `codesign` tool.

use {
    crate::error::SignError,
    log::{error, info, warn},
    std::{
        io::{BufRead, BufReader},
        path::{Path, PathBuf},
    },
};

/// The identity to sign with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigningIdentity {
    /// An ad-hoc signature not tied to a developer certificate.
    AdHoc,
    /// A certificate in the keychain, by common name or SHA-1 hash.
    Named(String),
}

impl Default for SigningIdentity {
    fn default() -> Self {
        Self::AdHoc
    }
}

impl std::fmt::Display for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdHoc => f.write_str("-"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl TryFrom<&str> for SigningIdentity {
    type Error = SignError;

    fn try_from(v: &str) -> Result<Self, Self::Error> {
        match v.trim() {
            "" => Err(SignError::MissingIdentity("empty identity".into())),
            "-" => Ok(Self::AdHoc),
            name => Ok(Self::Named(name.to_string())),
        }
    }
}

/// A capability to sign and verify bundles.
pub trait CodeSigner {
    /// Produce a signature over the bundle's current content.
    ///
    /// Existing signatures are replaced. Entitlements of the existing
    /// signature should be preserved.
    fn sign(&self, bundle: &Path, identity: &SigningIdentity) -> Result<(), SignError>;

    /// Whether the bundle's signature is valid for its current content.
    fn verify(&self, bundle: &Path) -> Result<bool, SignError>;
}

/// Signs bundles by running Apple's `codesign` tool.
///
/// Tools are located on `PATH` each time they are needed, so constructing
/// an instance never fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct CodesignTool;

impl CodesignTool {
    pub fn new() -> Self {
        Self
    }

    fn codesign_exe(&self) -> Result<PathBuf, SignError> {
        which::which("codesign")
            .map_err(|e| SignError::ToolFailure(format!("unable to find codesign: {}", e)))
    }

    /// Run `codesign` with arguments, forwarding its output to the log.
    fn run(&self, args: Vec<String>) -> Result<bool, SignError> {
        let codesign_exe = self.codesign_exe()?;
        info!("invoking {} with args: {:?}", codesign_exe.display(), args);

        let reader = duct::cmd(&codesign_exe, args)
            .stderr_to_stdout()
            .unchecked()
            .reader()
            .map_err(|e| SignError::ToolFailure(format!("running codesign: {}", e)))?;

        let mut lines = vec![];
        {
            let buffered = BufReader::new(&reader);
            for line in buffered.lines() {
                let line = line.map_err(|e| SignError::ToolFailure(e.to_string()))?;
                info!("codesign> {}", line);
                lines.push(line);
            }
        }

        let output = reader
            .try_wait()
            .map_err(|e| SignError::ToolFailure(e.to_string()))?
            .ok_or_else(|| SignError::ToolFailure("unable to wait on codesign".into()))?;

        if output.status.success() {
            Ok(true)
        } else {
            for line in &lines {
                error!("codesign error> {}", line);
            }
            Ok(false)
        }
    }

    /// Whether the keychain has a code signing identity matching `name`.
    fn has_identity(&self, name: &str) -> Result<bool, SignError> {
        let security_exe = match which::which("security") {
            Ok(exe) => exe,
            Err(_) => {
                warn!("security tool not found; unable to validate identity {}", name);
                return Ok(true);
            }
        };

        let output = duct::cmd(&security_exe, ["find-identity", "-v", "-p", "codesigning"])
            .stderr_null()
            .read()
            .map_err(|e| SignError::ToolFailure(format!("running security: {}", e)))?;

        Ok(output.lines().any(|line| line.contains(name)))
    }
}

impl CodeSigner for CodesignTool {
    fn sign(&self, bundle: &Path, identity: &SigningIdentity) -> Result<(), SignError> {
        if let SigningIdentity::Named(name) = identity {
            if !self.has_identity(name)? {
                return Err(SignError::MissingIdentity(name.clone()));
            }
        }

        let args = vec![
            "--force".to_string(),
            "--deep".to_string(),
            "--preserve-metadata=entitlements".to_string(),
            "--sign".to_string(),
            identity.to_string(),
            bundle.display().to_string(),
        ];

        if self.run(args)? {
            Ok(())
        } else {
            Err(SignError::ToolFailure(format!(
                "codesign failed to sign {}",
                bundle.display()
            )))
        }
    }

    fn verify(&self, bundle: &Path) -> Result<bool, SignError> {
        self.run(vec![
            "--verify".to_string(),
            "--deep".to_string(),
            "--strict".to_string(),
            bundle.display().to_string(),
        ])
    }
}

/// Result of signing a bundle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignResult {
    /// A new signature was written.
    Signed,
    /// The existing signature was already valid and left alone.
    AlreadySigned,
}

/// Signs bundles and validates the outcome.
pub struct BundleSigner<S: CodeSigner> {
    signer: S,
}

impl<S: CodeSigner> BundleSigner<S> {
    pub fn new(signer: S) -> Self {
        Self { signer }
    }

    /// The underlying signing capability.
    pub fn signer(&self) -> &S {
        &self.signer
    }

    /// Sign the bundle at `bundle`.
    ///
    /// Unless `force` is set, a bundle whose existing signature validates is
    /// left alone. After signing the signature must validate.
    pub fn sign(
        &self,
        bundle: &Path,
        identity: &SigningIdentity,
        force: bool,
    ) -> Result<SignResult, SignError> {
        if !bundle.exists() {
            return Err(SignError::BundleNotFound(bundle.to_path_buf()));
        }

        if !force && self.signer.verify(bundle)? {
            warn!("{} signature already valid", bundle.display());
            return Ok(SignResult::AlreadySigned);
        }

        warn!("signing {} with identity {}", bundle.display(), identity);
        self.signer.sign(bundle, identity)?;

        if self.signer.verify(bundle)? {
            Ok(SignResult::Signed)
        } else {
            Err(SignError::ToolFailure(format!(
                "signature of {} does not verify after signing",
                bundle.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{create_app, MachOFixture, RecordingSigner},
    };

    #[test]
    fn identity_parsing() {
        assert_eq!(SigningIdentity::try_from("-").unwrap(), SigningIdentity::AdHoc);
        assert_eq!(
            SigningIdentity::try_from("Developer ID Application: Me").unwrap(),
            SigningIdentity::Named("Developer ID Application: Me".into())
        );
        assert!(matches!(
            SigningIdentity::try_from("  "),
            Err(SignError::MissingIdentity(_))
        ));
        assert_eq!(SigningIdentity::default().to_string(), "-");
    }

    #[test]
    fn sign_then_noop() -> Result<(), SignError> {
        let (_temp, app) = create_app("2.0.0", &MachOFixture::arm64().build()).unwrap();
        let signer = BundleSigner::new(RecordingSigner::default());

        assert_eq!(
            signer.sign(&app, &SigningIdentity::AdHoc, false)?,
            SignResult::Signed
        );
        assert_eq!(signer.signer().sign_calls(), 1);

        // Valid signature is a no-op unless forced.
        assert_eq!(
            signer.sign(&app, &SigningIdentity::AdHoc, false)?,
            SignResult::AlreadySigned
        );
        assert_eq!(signer.signer().sign_calls(), 1);

        assert_eq!(
            signer.sign(&app, &SigningIdentity::AdHoc, true)?,
            SignResult::Signed
        );
        assert_eq!(signer.signer().sign_calls(), 2);

        Ok(())
    }

    #[test]
    fn missing_bundle_and_identity() {
        let (temp, app) = create_app("2.0.0", &MachOFixture::arm64().build()).unwrap();
        let signer = BundleSigner::new(RecordingSigner::default());

        assert!(matches!(
            signer.sign(&temp.path().join("Missing.app"), &SigningIdentity::AdHoc, true),
            Err(SignError::BundleNotFound(_))
        ));

        assert!(matches!(
            signer.sign(&app, &SigningIdentity::Named("Nobody".into()), true),
            Err(SignError::MissingIdentity(_))
        ));
        assert_eq!(signer.signer().sign_calls(), 0);
    }

    #[test]
    fn codesign_located_when_used() {
        let tool = CodesignTool::new();

        if which::which("codesign").is_err() {
            let (_temp, app) = create_app("2.0.0", &MachOFixture::arm64().build()).unwrap();
            assert!(matches!(tool.verify(&app), Err(SignError::ToolFailure(_))));
            assert!(matches!(
                tool.sign(&app, &SigningIdentity::AdHoc),
                Err(SignError::ToolFailure(_))
            ));
        }
    }

    #[test]
    fn broken_tool_detected() {
        let (_temp, app) = create_app("2.0.0", &MachOFixture::arm64().build()).unwrap();
        let signer = BundleSigner::new(RecordingSigner::invalid());

        assert!(matches!(
            signer.sign(&app, &SigningIdentity::AdHoc, true),
            Err(SignError::ToolFailure(_))
        ));
    }
}
