// SPDX-License-Identifier: Apache-2.0

mod catsig;
mod dump;
mod gendata;
mod sign;

use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::info;

use sgx_sign::key::{self, KeyKind, RsaKeyMaterial};

/// Measure and sign SGX enclave images.
///
/// The tool parses a compiled enclave shared object, synthesizes the
/// memory layout the hardware will build at load time, replays the
/// architectural measurement, signs the result with an RSA-3072 exponent-3
/// key and writes the signed metadata back into the image.
#[derive(Parser, Debug)]
#[clap(version)]
pub struct Options {
    /// Logging options
    #[clap(flatten)]
    logger: LogOptions,

    /// Subcommands (with their own options)
    #[clap(subcommand)]
    cmd: Subcommands,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        self.logger.init();
        self.cmd.dispatch()
    }
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    Sign(sign::Options),
    Gendata(gendata::Options),
    Catsig(catsig::Options),
    Dump(dump::Options),
}

impl Subcommands {
    fn dispatch(self) -> anyhow::Result<()> {
        match self {
            Self::Sign(cmd) => cmd.execute(),
            Self::Gendata(cmd) => cmd.execute(),
            Self::Catsig(cmd) => cmd.execute(),
            Self::Dump(cmd) => cmd.execute(),
        }
    }
}

/// Common logging options
#[derive(Args, Debug)]
pub struct LogOptions {
    /// Increase log verbosity. Pass multiple times for more log output.
    ///
    /// By default only errors are shown. Passing `-v` adds warnings,
    /// `-vv` info, `-vvv` debug and `-vvvv` trace.
    #[clap(long = "verbose", short = 'v', parse(from_occurrences))]
    verbosity: u8,

    /// Set fancier logging filters, equivalent to the `RUST_LOG`
    /// environment variable.
    #[clap(long = "log-filter", env = "SGX_SIGN_LOG")]
    log_filter: Option<String>,
}

impl LogOptions {
    fn init(&self) {
        env_logger::Builder::new()
            .filter_level(self.verbosity_level())
            .parse_filters(self.log_filter.as_deref().unwrap_or(""))
            .init();
    }

    fn verbosity_level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

/// Load a key file and require the given kind.
pub(crate) fn load_key(path: &Path, want: KeyKind) -> anyhow::Result<RsaKeyMaterial> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let (kind, material) = key::parse_key(&text);
    if kind != want {
        match want {
            KeyKind::Private => bail!("{} is not an RSA private key", path.display()),
            _ => bail!("{} is not an RSA public key", path.display()),
        }
    }
    Ok(material)
}

/// Write an output file, removing any partial file on failure.
pub(crate) fn write_output(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Err(err) = fs::write(path, bytes) {
        let _ = fs::remove_file(path);
        return Err(err).with_context(|| format!("failed to write {}", path.display()));
    }
    info!("wrote {}", path.display());
    Ok(())
}
