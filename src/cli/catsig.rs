// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use log::info;

use sgx_sign::config::Parameters;
use sgx_sign::key::KeyKind;
use sgx_sign::{metadata, pipeline};

/// Attach an externally produced signature to the enclave.
///
/// The enclave and configuration must match the ones the signing payload
/// was generated from; any difference is rejected before the signature is
/// accepted.
#[derive(Args, Debug)]
pub struct Options {
    /// Enclave shared object to sign
    #[clap(long, value_name = "FILE")]
    enclave: PathBuf,

    /// Enclave configuration file
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// RSA-3072 public key of the external signer, PEM encoded
    #[clap(long, value_name = "FILE")]
    key: PathBuf,

    /// Raw signature over the signing payload, 384 bytes big-endian
    #[clap(long, value_name = "FILE")]
    sig: PathBuf,

    /// The signing payload written by gendata
    #[clap(long, value_name = "FILE")]
    unsigned: PathBuf,

    /// Where to write the signed enclave
    #[clap(long, value_name = "FILE")]
    out: PathBuf,

    /// Also write a textual metadata dump
    #[clap(long, value_name = "FILE")]
    dumpfile: Option<PathBuf>,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let params = Parameters::load(self.config.as_deref())?;
        let material = super::load_key(&self.key, KeyKind::Public)?;

        let unsigned = fs::read(&self.unsigned)
            .with_context(|| format!("failed to read {}", self.unsigned.display()))?;
        let signature = fs::read(&self.sig)
            .with_context(|| format!("failed to read {}", self.sig.display()))?;

        let mut image = fs::read(&self.enclave)
            .with_context(|| format!("failed to read {}", self.enclave.display()))?;

        let mut measured = pipeline::measure_enclave(&mut image, &params)?;
        pipeline::catsig(&mut measured, &material, &unsigned, &signature)?;
        pipeline::install_metadata(&mut image, &measured)?;

        super::write_output(&self.out, &image)?;

        if let Some(path) = &self.dumpfile {
            let text = metadata::dump(&measured.metadata.note_area()?)?;
            super::write_output(path, text.as_bytes())?;
        }

        info!("succeed");
        Ok(())
    }
}
