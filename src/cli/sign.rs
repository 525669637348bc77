// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use log::info;

use sgx_sign::config::Parameters;
use sgx_sign::key::KeyKind;
use sgx_sign::{metadata, pipeline};

/// Measure the enclave and sign it with a private key.
#[derive(Args, Debug)]
pub struct Options {
    /// Enclave shared object to sign
    #[clap(long, value_name = "FILE")]
    enclave: PathBuf,

    /// Enclave configuration file
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// RSA-3072 private key with exponent 3, PEM encoded
    #[clap(long, value_name = "FILE")]
    key: PathBuf,

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
        let material = super::load_key(&self.key, KeyKind::Private)?;

        let mut image = fs::read(&self.enclave)
            .with_context(|| format!("failed to read {}", self.enclave.display()))?;

        let mut measured = pipeline::measure_enclave(&mut image, &params)?;
        pipeline::sign(&mut measured, &material)?;
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
