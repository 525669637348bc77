// SPDX-License-Identifier: Apache-2.0

//! One tool invocation, end to end.
//!
//! The pipeline is synchronous and fail-fast: parse the image, synthesize
//! the layout, apply the patch fixups, measure, fill and sign the signature
//! container, then write the metadata into the output image. Nothing
//! touches the disk until every step has succeeded; the caller removes a
//! partially written output on error.

use crate::config::Parameters;
use crate::css::{self, EnclaveCss, SIGNING_DATA_SIZE};
use crate::elf::{self, EnclaveElf};
use crate::error::{Error, Result};
use crate::key::RsaKeyMaterial;
use crate::layout;
use crate::measure;
use crate::metadata::{Metadata, PatchSource, METADATA_MAGIC, METADATA_SIZE};

use log::{debug, info};

/// A measured enclave: the parsed image description and the metadata with
/// the enclave hash already installed.
pub struct Measured {
    pub elf: EnclaveElf,
    pub metadata: Metadata,
}

impl Measured {
    pub fn enclave_hash(&self) -> [u8; 32] {
        self.metadata.enclave_css.body.enclave_hash
    }
}

/// Copy every patch-table fixup into the image bytes.
fn apply_patches(image: &mut [u8], meta: &Metadata) -> Result<()> {
    for patch in &meta.patches {
        let dst = patch.dst as usize;
        let size = patch.size as usize;
        if dst + size > image.len() {
            return Err(Error::format("patch target outside the image"));
        }
        match patch.source {
            PatchSource::GlobalData => {
                image[dst..dst + size].copy_from_slice(&meta.global_data[..size])
            }
            PatchSource::Zero => image[dst..dst + size].fill(0),
        }
    }
    Ok(())
}

/// Parse, build the layout, patch the image and measure it.
///
/// On return the image bytes carry the patch fixups and the metadata holds
/// the measurement; the signature container still lacks key, signature and
/// Q1/Q2.
pub fn measure_enclave(image: &mut [u8], params: &Parameters) -> Result<Measured> {
    let elf = elf::parse(image)?;

    let slot = &elf.metadata_slot;
    if (slot.size as usize) < METADATA_SIZE {
        return Err(Error::format(format!(
            "metadata slot holds {:#x} bytes, {:#x} required",
            slot.size, METADATA_SIZE
        )));
    }
    if slot.offset as usize + METADATA_SIZE > image.len() {
        return Err(Error::format("metadata slot outside the image"));
    }

    let magic = u64::from_le_bytes(
        image[slot.offset as usize..slot.offset as usize + 8]
            .try_into()
            .unwrap(),
    );
    if magic == METADATA_MAGIC {
        return Err(Error::validation("enclave is already signed"));
    }

    let mut enclave_css = EnclaveCss::from_parameters(params);
    enclave_css.header.date = css::bcd_date_now();

    let mut metadata = Metadata::new(params.tcs_policy, params.tcs_min_pool, enclave_css);
    layout::build(&mut metadata, params, &elf)?;

    apply_patches(image, &metadata)?;

    let hash = measure::measure(image, &elf, &metadata)?;
    metadata.enclave_css.body.enclave_hash = hash;
    debug!("enclave hash: {}", hex_string(&hash));

    Ok(Measured { elf, metadata })
}

/// Sign mode: hash and sign with the private key.
pub fn sign(measured: &mut Measured, material: &RsaKeyMaterial) -> Result<()> {
    let css = &mut measured.metadata.enclave_css;
    css.set_key(material);
    css::create_signature(css, material, None)?;
    css::verify_signature(css, material)?;
    info!("signature created and verified");
    Ok(())
}

/// Catsig mode: adopt an externally produced signature.
///
/// The freshly rebuilt header and body must byte-compare equal to the dump
/// `gendata` produced (the date is adopted from the dump first); the
/// signature bytes come from the signature file.
pub fn catsig(
    measured: &mut Measured,
    material: &RsaKeyMaterial,
    unsigned: &[u8],
    signature: &[u8],
) -> Result<()> {
    let css = &mut measured.metadata.enclave_css;
    css.set_key(material);

    let unsigned: &[u8; SIGNING_DATA_SIZE] = unsigned
        .try_into()
        .map_err(|_| Error::validation("unsigned data file has the wrong size"))?;

    // The dump was taken at gendata time; its date is authoritative.
    css.header.date = u32::from_le_bytes(unsigned[20..24].try_into().unwrap());
    if css.signing_data() != *unsigned {
        return Err(Error::validation(
            "unsigned data does not match this enclave and configuration",
        ));
    }

    css::create_signature(css, material, Some(signature))?;
    css::verify_signature(css, material)?;
    info!("external signature attached and verified");
    Ok(())
}

/// Write the signed metadata blocks into the image's note slot.
pub fn install_metadata(image: &mut [u8], measured: &Measured) -> Result<()> {
    let note = measured.metadata.note_area()?;
    let offset = measured.elf.metadata_slot.offset as usize;
    image[offset..offset + note.len()].copy_from_slice(&note);
    Ok(())
}

/// The unsigned signing-payload dump written by gendata mode.
pub fn signing_data(measured: &Measured) -> [u8; SIGNING_DATA_SIZE] {
    measured.metadata.enclave_css.signing_data()
}

/// Locate the metadata block inside an already-signed image.
///
/// Signed images carry blanked section headers (a patch-table target), so
/// the note section cannot be found by name; the block is located by its
/// magic instead. The note descriptor follows the unpadded note name, so
/// the block may sit at any byte offset.
pub fn find_metadata(image: &[u8]) -> Result<&[u8]> {
    let magic = METADATA_MAGIC.to_le_bytes();
    let mut offset = 0;
    while offset + METADATA_SIZE <= image.len() {
        if image[offset..offset + 8] == magic {
            return Ok(&image[offset..offset + METADATA_SIZE]);
        }
        offset += 1;
    }
    Err(Error::format("image carries no signed metadata"))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
