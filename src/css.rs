// SPDX-License-Identifier: Apache-2.0

//! The signature container embedded in the enclave metadata.
//!
//! The container is split the way the hardware consumes it: `header` and
//! `body` are the signed payload, `key` and `buffer` carry the public key,
//! the signature and the Q1/Q2 verifier auxiliaries. Sub-struct sizes and
//! field order are part of the wire contract.

use crate::arch::{Attributes, EXPONENT_SIZE, KEY_SIZE};
use crate::config::Parameters;
use crate::error::{Error, Result};
use crate::key::RsaKeyMaterial;

use std::time::{SystemTime, UNIX_EPOCH};

use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign};
use sha2::{Digest, Sha256};

pub const CSS_HEADER_SIZE: usize = 128;
pub const CSS_KEY_SIZE: usize = 772;
pub const CSS_BODY_SIZE: usize = 128;
pub const CSS_BUFFER_SIZE: usize = 780;
pub const CSS_SIZE: usize = CSS_HEADER_SIZE + CSS_KEY_SIZE + CSS_BODY_SIZE + CSS_BUFFER_SIZE;

/// Size of the unsigned dump produced by `gendata` (header then body).
pub const SIGNING_DATA_SIZE: usize = CSS_HEADER_SIZE + CSS_BODY_SIZE;

const HEADER1: [u8; 12] = [6, 0, 0, 0, 0xE1, 0, 0, 0, 0, 0, 1, 0];
const HEADER2: [u8; 16] = [1, 1, 0, 0, 0x60, 0, 0, 0, 0x60, 0, 0, 0, 1, 0, 0, 0];

/// First signed block: vendor identity and date.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CssHeader {
    pub header: [u8; 12],
    pub css_type: u32,
    pub module_vendor: u32,
    pub date: u32,
    pub header2: [u8; 16],
    pub hw_version: u32,
    reserved: [u8; 84],
}

/// Public key material, byte-reversed relative to big-endian DER.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct CssKey {
    pub modulus: [u8; KEY_SIZE],
    pub exponent: [u8; EXPONENT_SIZE],
    pub signature: [u8; KEY_SIZE],
}

/// Second signed block: select/mask pairs, the enclave hash and the
/// product identity.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CssBody {
    pub misc_select: u32,
    pub misc_mask: u32,
    reserved: [u8; 20],
    pub attributes: Attributes,
    pub attribute_mask: Attributes,
    pub enclave_hash: [u8; 32],
    reserved2: [u8; 32],
    pub isv_prod_id: u16,
    pub isv_svn: u16,
}

/// Verifier auxiliaries, byte-reversed little-endian.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct CssBuffer {
    reserved: [u8; 12],
    pub q1: [u8; KEY_SIZE],
    pub q2: [u8; KEY_SIZE],
}

#[derive(Copy, Clone)]
pub struct EnclaveCss {
    pub header: CssHeader,
    pub key: CssKey,
    pub body: CssBody,
    pub buffer: CssBuffer,
}

impl Default for CssHeader {
    fn default() -> Self {
        Self {
            header: [0; 12],
            css_type: 0,
            module_vendor: 0,
            date: 0,
            header2: [0; 16],
            hw_version: 0,
            reserved: [0; 84],
        }
    }
}

impl Default for CssKey {
    fn default() -> Self {
        Self {
            modulus: [0; KEY_SIZE],
            exponent: [0; EXPONENT_SIZE],
            signature: [0; KEY_SIZE],
        }
    }
}

impl Default for CssBody {
    fn default() -> Self {
        Self {
            misc_select: 0,
            misc_mask: 0,
            reserved: [0; 20],
            attributes: Attributes::default(),
            attribute_mask: Attributes::default(),
            enclave_hash: [0; 32],
            reserved2: [0; 32],
            isv_prod_id: 0,
            isv_svn: 0,
        }
    }
}

impl Default for CssBuffer {
    fn default() -> Self {
        Self {
            reserved: [0; 12],
            q1: [0; KEY_SIZE],
            q2: [0; KEY_SIZE],
        }
    }
}

impl Default for EnclaveCss {
    fn default() -> Self {
        Self {
            header: CssHeader::default(),
            key: CssKey::default(),
            body: CssBody::default(),
            buffer: CssBuffer::default(),
        }
    }
}

impl CssHeader {
    pub fn to_bytes(&self) -> [u8; CSS_HEADER_SIZE] {
        let mut out = [0u8; CSS_HEADER_SIZE];
        out[0..12].copy_from_slice(&self.header);
        out[12..16].copy_from_slice(&self.css_type.to_le_bytes());
        out[16..20].copy_from_slice(&self.module_vendor.to_le_bytes());
        out[20..24].copy_from_slice(&self.date.to_le_bytes());
        out[24..40].copy_from_slice(&self.header2);
        out[40..44].copy_from_slice(&self.hw_version.to_le_bytes());
        out
    }
}

impl CssBody {
    pub fn to_bytes(&self) -> [u8; CSS_BODY_SIZE] {
        let mut out = [0u8; CSS_BODY_SIZE];
        out[0..4].copy_from_slice(&self.misc_select.to_le_bytes());
        out[4..8].copy_from_slice(&self.misc_mask.to_le_bytes());
        out[28..44].copy_from_slice(&self.attributes.to_bytes());
        out[44..60].copy_from_slice(&self.attribute_mask.to_bytes());
        out[60..92].copy_from_slice(&self.enclave_hash);
        out[124..126].copy_from_slice(&self.isv_prod_id.to_le_bytes());
        out[126..128].copy_from_slice(&self.isv_svn.to_le_bytes());
        out
    }
}

impl EnclaveCss {
    /// Populate everything the configuration determines: the fixed header
    /// strings, vendor/type/hw fields and the attribute and misc pairs.
    /// The date, key, hash and signature are filled later in the pipeline.
    pub fn from_parameters(params: &Parameters) -> Self {
        use crate::arch::*;

        let mut css = EnclaveCss::default();
        css.header.header = HEADER1;
        css.header.header2 = HEADER2;
        // Bit 31 distinguishes debug from product signing requests.
        css.header.css_type = if params.release_type & 1 != 0 { 1 << 31 } else { 0 };
        css.header.module_vendor = if params.intel_signed & 1 != 0 { 0x8086 } else { 0 };
        css.header.hw_version = params.hw;

        css.body.misc_select = params.misc_select;
        css.body.misc_mask = params.misc_mask;

        css.body.attributes.flags = 0;
        css.body.attribute_mask.flags = !SGX_FLAGS_DEBUG;
        if params.disable_debug {
            css.body.attributes.flags &= !SGX_FLAGS_DEBUG;
            css.body.attribute_mask.flags |= SGX_FLAGS_DEBUG;
        }
        if params.provision_key {
            css.body.attributes.flags |= SGX_FLAGS_PROVISION_KEY;
            css.body.attribute_mask.flags |= SGX_FLAGS_PROVISION_KEY;
        }
        if params.launch_key {
            css.body.attributes.flags |= SGX_FLAGS_EINITTOKEN_KEY;
            css.body.attribute_mask.flags |= SGX_FLAGS_EINITTOKEN_KEY;
        }
        css.body.attributes.flags |= SGX_FLAGS_MODE64BIT;
        css.body.attribute_mask.flags |= SGX_FLAGS_MODE64BIT;

        css.body.attributes.xfrm = SGX_XFRM_LEGACY;
        css.body.attribute_mask.xfrm = SGX_XFRM_LEGACY | SGX_XFRM_RESERVED;

        css.body.isv_prod_id = params.prod_id;
        css.body.isv_svn = params.isv_svn;
        css
    }

    /// Install the public key part: modulus byte-reversed, exponent as-is.
    pub fn set_key(&mut self, material: &RsaKeyMaterial) {
        self.key.modulus = material.n;
        self.key.exponent = material.e;
    }

    /// The signed payload: `header ‖ body`.
    pub fn signing_data(&self) -> [u8; SIGNING_DATA_SIZE] {
        let mut out = [0u8; SIGNING_DATA_SIZE];
        out[..CSS_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        out[CSS_HEADER_SIZE..].copy_from_slice(&self.body.to_bytes());
        out
    }

    /// Full container serialization into `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= CSS_SIZE);
        out[0..128].copy_from_slice(&self.header.to_bytes());
        out[128..512].copy_from_slice(&self.key.modulus);
        out[512..516].copy_from_slice(&self.key.exponent);
        out[516..900].copy_from_slice(&self.key.signature);
        out[900..1028].copy_from_slice(&self.body.to_bytes());
        out[1040..1424].copy_from_slice(&self.buffer.q1);
        out[1424..1808].copy_from_slice(&self.buffer.q2);
    }
}

/// Today's UTC date as `0xYYYYMMDD`: the decimal digits of the civil date
/// reinterpreted as hex digits, matching the hardware convention.
pub fn bcd_date_now() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let (y, m, d) = civil_from_days((secs / 86400) as i64);
    bcd_date(y as u32, m, d)
}

fn bcd_date(year: u32, month: u32, day: u32) -> u32 {
    let decimal = year * 10000 + month * 100 + day;
    u32::from_str_radix(&decimal.to_string(), 16).unwrap_or(0)
}

/// Days-since-epoch to civil date (proleptic Gregorian).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Byte-reverse `src` into a fixed-width array, zero-padding the tail.
/// The source must not exceed the target width.
pub fn reversed<const N: usize>(src: &[u8]) -> [u8; N] {
    debug_assert!(src.len() <= N);
    let mut out = [0u8; N];
    for (dst, b) in out.iter_mut().zip(src.iter().rev()) {
        *dst = *b;
    }
    out
}

/// Compute the Q1/Q2 verifier auxiliaries from a big-endian signature and
/// modulus.
///
/// Kept as the literal two-step sequence (square, divide; multiply the
/// remainder, divide) rather than a closed form: the hardware verifier
/// depends on this exact rounding behavior.
fn q1_q2(signature_be: &[u8], modulus_be: &[u8]) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let s = BigUint::from_bytes_be(signature_be);
    let m = BigUint::from_bytes_be(modulus_be);

    let t1 = &s * &s;
    let q1 = &t1 / &m;
    let r = &t1 % &m;
    let t2 = &s * &r;
    let q2 = &t2 / &m;

    let clamp = |v: BigUint| -> [u8; KEY_SIZE] {
        let mut bytes = v.to_bytes_le();
        bytes.truncate(KEY_SIZE);
        let mut out = [0u8; KEY_SIZE];
        out[..bytes.len()].copy_from_slice(&bytes);
        out
    };

    (clamp(q1), clamp(q2))
}

/// Produce the container signature.
///
/// In sign mode (`external` is `None`) the payload is hashed and signed with
/// the private key; in catsig mode the raw big-endian signature bytes come
/// from the caller. Either way the signature lands byte-reversed in the key
/// block and Q1/Q2 are recomputed.
pub fn create_signature(
    css: &mut EnclaveCss,
    material: &RsaKeyMaterial,
    external: Option<&[u8]>,
) -> Result<()> {
    let signature_be: [u8; KEY_SIZE] = match external {
        Some(raw) => raw
            .try_into()
            .map_err(|_| Error::validation("signature file must be exactly 384 bytes"))?,
        None => {
            let key = material.to_private_key()?;
            let digest = Sha256::digest(css.signing_data());
            let sig = key
                .sign(Pkcs1v15Sign::new::<Sha256>(), &digest[..])
                .map_err(|e| Error::crypto(format!("signing failed: {}", e)))?;
            sig.as_slice()
                .try_into()
                .map_err(|_| Error::crypto("unexpected signature width"))?
        }
    };

    css.key.signature = reversed(&signature_be);

    let modulus_be: [u8; KEY_SIZE] = reversed(&css.key.modulus);
    let (q1, q2) = q1_q2(&signature_be, &modulus_be);
    css.buffer.q1 = q1;
    css.buffer.q2 = q2;
    Ok(())
}

/// Independently verify the container signature against the public key.
/// Run before the tool reports success, in both sign and catsig modes.
pub fn verify_signature(css: &EnclaveCss, material: &RsaKeyMaterial) -> Result<()> {
    let key = material.to_public_key()?;
    if key.size() != KEY_SIZE {
        return Err(Error::crypto("modulus width mismatch"));
    }

    let digest = Sha256::digest(css.signing_data());
    let signature_be: [u8; KEY_SIZE] = reversed(&css.key.signature);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest[..], &signature_be)
        .map_err(|e| Error::crypto(format!("signature verification failed: {}", e)))
}
