// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use log::info;

use sgx_sign::config::Parameters;
use sgx_sign::pipeline;

/// Measure the enclave and write the unsigned signing payload for an
/// external signing facility.
#[derive(Args, Debug)]
pub struct Options {
    /// Enclave shared object to measure
    #[clap(long, value_name = "FILE")]
    enclave: PathBuf,

    /// Enclave configuration file
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where to write the signing payload
    #[clap(long, value_name = "FILE")]
    out: PathBuf,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let params = Parameters::load(self.config.as_deref())?;

        let mut image = fs::read(&self.enclave)
            .with_context(|| format!("failed to read {}", self.enclave.display()))?;

        let measured = pipeline::measure_enclave(&mut image, &params)?;
        super::write_output(&self.out, &pipeline::signing_data(&measured))?;

        info!("succeed");
        Ok(())
    }
}
