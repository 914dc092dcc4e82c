// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    log::LevelFilter,
    std::path::Path,
    wechat_tweak::{
        inspect_slices, AppBundle, CatalogSource, CodesignTool, PatchResult, Pipeline,
        RecipeCatalog, SignResult, SigningIdentity, SliceOutcome, TweakError, TweakSettings,
        DEFAULT_APP_PATH, DEFAULT_CONFIG_URL,
    },
};

const CONFIG_ABOUT: &str = "\
Path or http(s) URL of the JSON patch config.

The config is an array of records, each naming the exact application
version it applies to and the install name of the library to inject.";

fn catalog_source(args: &ArgMatches) -> Result<Option<CatalogSource>, TweakError> {
    args.value_of("config").map(CatalogSource::parse).transpose()
}

fn command_inspect(args: &ArgMatches) -> Result<(), TweakError> {
    let path = Path::new(
        args.value_of("path")
            .ok_or_else(|| TweakError::CliBadArgument("path is required".into()))?,
    );

    let executable = if path.is_dir() {
        AppBundle::new_from_path(path)
            .and_then(|bundle| bundle.main_executable_path())
            .map_err(TweakError::MainExecutable)?
    } else {
        path.to_path_buf()
    };

    let data = std::fs::read(&executable)?;

    println!("{}", executable.display());
    for slice in inspect_slices(&data)? {
        print!("{}", slice);
    }

    Ok(())
}

fn command_list_versions(args: &ArgMatches) -> Result<(), TweakError> {
    let mut settings = TweakSettings::default();
    if let Some(source) = catalog_source(args)? {
        settings.set_catalog_source(source);
    }

    let catalog = RecipeCatalog::load(settings.catalog_source())?;

    for version in catalog.versions() {
        println!("{}", version);
    }

    Ok(())
}

fn command_patch(args: &ArgMatches) -> Result<(), TweakError> {
    let mut settings = TweakSettings::default();

    if let Some(app) = args.value_of("app") {
        settings.set_app_path(app);
    }
    if let Some(source) = catalog_source(args)? {
        settings.set_catalog_source(source);
    }
    if let Some(identity) = args.value_of("identity") {
        settings.set_identity(SigningIdentity::try_from(identity)?);
    }
    settings.set_force_sign(args.is_present("force_sign"));

    let report = Pipeline::new(settings, CodesignTool::new()).run()?;

    println!("version: {}", report.version);
    println!("library: {}", report.recipe.library);
    match report.patch {
        PatchResult::AlreadyPatched => println!("executable: already patched"),
        PatchResult::Patched { slices } => {
            for slice in slices {
                match slice {
                    SliceOutcome::AlreadyPatched { arch } => {
                        println!("{}: already patched", arch)
                    }
                    SliceOutcome::Patched {
                        arch,
                        command_size,
                        edits_applied,
                    } => println!(
                        "{}: added {} byte load command; applied {} edits",
                        arch, command_size, edits_applied
                    ),
                }
            }
        }
    }
    match report.sign {
        SignResult::Signed => println!("signature: signed"),
        SignResult::AlreadySigned => println!("signature: already valid"),
    }

    Ok(())
}

fn main_impl() -> Result<(), TweakError> {
    let config_arg = Arg::new("config")
        .long("config")
        .short('c')
        .takes_value(true)
        .help("Patch config to use")
        .long_help(CONFIG_ABOUT)
        .default_value(DEFAULT_CONFIG_URL);

    let app = Command::new("Inject a tweak library into WeChat for macOS")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Patch and re-sign a macOS application bundle")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("inspect")
            .about("Print load command information of a Mach-O binary or app bundle")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path of Mach-O binary or .app bundle to inspect"),
            ),
    );

    let app = app.subcommand(
        Command::new("list-versions")
            .alias("versions")
            .about("List application versions the patch config supports")
            .arg(config_arg.clone()),
    );

    let app = app.subcommand(
        Command::new("patch")
            .about("Inject the tweak library and re-sign the application")
            .arg(
                Arg::new("app")
                    .long("app")
                    .short('a')
                    .takes_value(true)
                    .default_value(DEFAULT_APP_PATH)
                    .help("Path of the .app bundle to patch"),
            )
            .arg(config_arg)
            .arg(
                Arg::new("identity")
                    .long("identity")
                    .takes_value(true)
                    .default_value("-")
                    .help("Code signing identity to re-sign with (- for ad-hoc)"),
            )
            .arg(
                Arg::new("force_sign")
                    .long("force-sign")
                    .help("Re-sign even if the existing signature is valid"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels. rustls spews unwanted
    // output when fetching configs, so nerf it as well.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false)
            .filter_module("rustls", LevelFilter::Error);
    }

    builder.init();

    match matches.subcommand() {
        Some(("inspect", args)) => command_inspect(args),
        Some(("list-versions", args)) => command_list_versions(args),
        Some(("patch", args)) => command_patch(args),
        _ => Err(TweakError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {} stage failed: {}", err.stage(), err);
            1
        }
    };

    std::process::exit(exit_code)
}
