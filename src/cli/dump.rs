// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use log::info;

use sgx_sign::{metadata, pipeline};

/// Dump the metadata of an already-signed enclave as text.
#[derive(Args, Debug)]
pub struct Options {
    /// Signed enclave shared object
    #[clap(long, value_name = "FILE")]
    enclave: PathBuf,

    /// Where to write the dump
    #[clap(long, value_name = "FILE")]
    dumpfile: PathBuf,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let image = fs::read(&self.enclave)
            .with_context(|| format!("failed to read {}", self.enclave.display()))?;

        let block = pipeline::find_metadata(&image)?;
        let text = metadata::dump(block)?;
        super::write_output(&self.dumpfile, text.as_bytes())?;

        info!("succeed");
        Ok(())
    }
}
