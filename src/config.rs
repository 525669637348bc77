// SPDX-License-Identifier: Apache-2.0

//! Enclave configuration file.
//!
//! A TOML file with the classic enclave parameter names. Every key is
//! optional; omitted keys take their defaults. Range checking happens here,
//! cross-field validation (heap/stack ordering, thread pool bounds) happens
//! in the layout builder.

use crate::error::{Error, Result};

use std::fs;
use std::path::Path;

use log::debug;
use serde::Deserialize;

const STACK_SIZE_MIN: u64 = 0x2000;
const STACK_SIZE_MAX: u64 = 0x40000;
const HEAP_SIZE_MIN: u64 = 0x1000;
const HEAP_SIZE_MAX: u64 = 0x100000;
const TCS_NUM_MIN: u64 = 1;
const TCS_POLICY_BIND: u64 = 0;
const TCS_POLICY_UNBIND: u64 = 1;
const DEFAULT_MISC_SELECT: u64 = 0;
const DEFAULT_MISC_MASK: u64 = 0xFFFF_FFFF;
const ENCLAVE_SIZE_LIMIT: u64 = 0x1F_FFFF_FFFF;

/// Raw configuration as it appears on disk.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnclaveConfig {
    #[serde(rename = "ProdID")]
    pub prod_id: Option<u64>,
    #[serde(rename = "ISVSVN")]
    pub isv_svn: Option<u64>,
    #[serde(rename = "ReleaseType")]
    pub release_type: Option<u64>,
    #[serde(rename = "IntelSigned")]
    pub intel_signed: Option<u64>,
    #[serde(rename = "ProvisionKey")]
    pub provision_key: Option<u64>,
    #[serde(rename = "LaunchKey")]
    pub launch_key: Option<u64>,
    #[serde(rename = "DisableDebug")]
    pub disable_debug: Option<u64>,
    #[serde(rename = "HW")]
    pub hw: Option<u64>,
    #[serde(rename = "TCSNum")]
    pub tcs_num: Option<u64>,
    #[serde(rename = "TCSMaxNum")]
    pub tcs_max_num: Option<u64>,
    #[serde(rename = "TCSMinPool")]
    pub tcs_min_pool: Option<u64>,
    #[serde(rename = "TCSPolicy")]
    pub tcs_policy: Option<u64>,
    #[serde(rename = "StackMaxSize")]
    pub stack_max_size: Option<u64>,
    #[serde(rename = "StackMinSize")]
    pub stack_min_size: Option<u64>,
    #[serde(rename = "HeapMaxSize")]
    pub heap_max_size: Option<u64>,
    #[serde(rename = "HeapMinSize")]
    pub heap_min_size: Option<u64>,
    #[serde(rename = "HeapInitSize")]
    pub heap_init_size: Option<u64>,
    #[serde(rename = "HeapExecutable")]
    pub heap_executable: Option<u64>,
    #[serde(rename = "MiscSelect")]
    pub misc_select: Option<u64>,
    #[serde(rename = "MiscMask")]
    pub misc_mask: Option<u64>,
}

/// Range-checked parameter table consumed by the rest of the pipeline.
#[derive(Clone, Debug)]
pub struct Parameters {
    pub prod_id: u16,
    pub isv_svn: u16,
    pub release_type: u32,
    pub intel_signed: u32,
    pub provision_key: bool,
    pub launch_key: bool,
    pub disable_debug: bool,
    pub hw: u32,
    pub tcs_num: u32,
    pub tcs_max_num: u32,
    pub tcs_min_pool: u32,
    pub tcs_policy: u32,
    pub stack_max_size: u64,
    pub stack_min_size: u64,
    pub heap_max_size: u64,
    pub heap_min_size: u64,
    pub heap_init_size: u64,
    pub heap_executable: bool,
    pub misc_select: u32,
    pub misc_mask: u32,

    /// Whether the optional keys were present; their cross-checks only
    /// apply when the user actually set them.
    pub tcs_max_num_set: bool,
    pub tcs_min_pool_set: bool,
    pub heap_init_size_set: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters::from_config(&EnclaveConfig::default())
            .expect("default configuration is in range")
    }
}

fn in_range(name: &str, value: u64, min: u64, max: u64) -> Result<u64> {
    if value < min || value > max {
        return Err(Error::validation(format!(
            "{} = {:#x} outside [{:#x}, {:#x}]",
            name, value, min, max
        )));
    }
    Ok(value)
}

impl Parameters {
    /// Apply defaults and hard ranges to a raw configuration.
    pub fn from_config(cfg: &EnclaveConfig) -> Result<Self> {
        let prod_id = in_range("ProdID", cfg.prod_id.unwrap_or(0), 0, 0xFFFF)?;
        let isv_svn = in_range("ISVSVN", cfg.isv_svn.unwrap_or(0), 0, 0xFFFF)?;
        let release_type = in_range("ReleaseType", cfg.release_type.unwrap_or(0), 0, 1)?;
        let intel_signed = in_range("IntelSigned", cfg.intel_signed.unwrap_or(0), 0, 1)?;
        let provision_key = in_range("ProvisionKey", cfg.provision_key.unwrap_or(0), 0, 1)?;
        let launch_key = in_range("LaunchKey", cfg.launch_key.unwrap_or(0), 0, 1)?;
        let disable_debug = in_range("DisableDebug", cfg.disable_debug.unwrap_or(0), 0, 1)?;
        let hw = in_range("HW", cfg.hw.unwrap_or(0), 0, 0x10)?;
        let tcs_num = in_range(
            "TCSNum",
            cfg.tcs_num.unwrap_or(TCS_NUM_MIN),
            TCS_NUM_MIN,
            u32::MAX as u64,
        )?;
        let tcs_max_num = in_range(
            "TCSMaxNum",
            cfg.tcs_max_num.unwrap_or(tcs_num),
            TCS_NUM_MIN,
            u32::MAX as u64,
        )?;
        let tcs_min_pool = in_range(
            "TCSMinPool",
            cfg.tcs_min_pool.unwrap_or(TCS_NUM_MIN),
            0,
            u32::MAX as u64,
        )?;
        let tcs_policy = in_range(
            "TCSPolicy",
            cfg.tcs_policy.unwrap_or(TCS_POLICY_UNBIND),
            TCS_POLICY_BIND,
            TCS_POLICY_UNBIND,
        )?;
        let stack_max_size = in_range(
            "StackMaxSize",
            cfg.stack_max_size.unwrap_or(STACK_SIZE_MAX),
            STACK_SIZE_MIN,
            ENCLAVE_SIZE_LIMIT,
        )?;
        let stack_min_size = in_range(
            "StackMinSize",
            cfg.stack_min_size.unwrap_or(STACK_SIZE_MIN),
            STACK_SIZE_MIN,
            ENCLAVE_SIZE_LIMIT,
        )?;
        let heap_max_size = in_range(
            "HeapMaxSize",
            cfg.heap_max_size.unwrap_or(HEAP_SIZE_MAX),
            0,
            ENCLAVE_SIZE_LIMIT,
        )?;
        let heap_min_size = in_range(
            "HeapMinSize",
            cfg.heap_min_size.unwrap_or(HEAP_SIZE_MIN),
            0,
            ENCLAVE_SIZE_LIMIT,
        )?;
        let heap_init_size = in_range(
            "HeapInitSize",
            cfg.heap_init_size.unwrap_or(heap_max_size),
            0,
            ENCLAVE_SIZE_LIMIT,
        )?;
        let heap_executable = in_range("HeapExecutable", cfg.heap_executable.unwrap_or(0), 0, 1)?;
        let misc_select = in_range(
            "MiscSelect",
            cfg.misc_select.unwrap_or(DEFAULT_MISC_SELECT),
            0,
            0xFFFF_FFFF,
        )?;
        let misc_mask = in_range(
            "MiscMask",
            cfg.misc_mask.unwrap_or(DEFAULT_MISC_MASK),
            0,
            0xFFFF_FFFF,
        )?;

        Ok(Parameters {
            prod_id: prod_id as u16,
            isv_svn: isv_svn as u16,
            release_type: release_type as u32,
            intel_signed: intel_signed as u32,
            provision_key: provision_key != 0,
            launch_key: launch_key != 0,
            disable_debug: disable_debug != 0,
            hw: hw as u32,
            tcs_num: tcs_num as u32,
            tcs_max_num: tcs_max_num as u32,
            tcs_min_pool: tcs_min_pool as u32,
            tcs_policy: tcs_policy as u32,
            stack_max_size,
            stack_min_size,
            heap_max_size,
            heap_min_size,
            heap_init_size,
            heap_executable: heap_executable != 0,
            misc_select: misc_select as u32,
            misc_mask: misc_mask as u32,
            tcs_max_num_set: cfg.tcs_max_num.is_some(),
            tcs_min_pool_set: cfg.tcs_min_pool.is_some(),
            heap_init_size_set: cfg.heap_init_size.is_some(),
        })
    }

    /// Load parameters from an optional configuration file path.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = match path {
            None => {
                debug!("no configuration file, using defaults");
                EnclaveConfig::default()
            }
            Some(path) => {
                let text = fs::read_to_string(path)?;
                toml::from_str(&text)
                    .map_err(|e| Error::format(format!("{}: {}", path.display(), e)))?
            }
        };
        Parameters::from_config(&cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let params = Parameters::default();
        assert_eq!(params.tcs_num, 1);
        assert_eq!(params.tcs_max_num, 1);
        assert_eq!(params.tcs_min_pool, 1);
        assert_eq!(params.stack_max_size, STACK_SIZE_MAX);
        assert_eq!(params.stack_min_size, STACK_SIZE_MIN);
        assert_eq!(params.heap_max_size, HEAP_SIZE_MAX);
        // With no explicit init size, the heap is fully committed up front.
        assert_eq!(params.heap_init_size, HEAP_SIZE_MAX);
        assert_eq!(params.misc_mask, 0xFFFF_FFFF);
        assert!(!params.heap_init_size_set);
        assert!(!params.tcs_max_num_set);
    }

    #[test]
    fn parses_toml() {
        let cfg: EnclaveConfig = toml::from_str(
            r#"
            ProdID = 42
            ISVSVN = 3
            TCSNum = 5
            TCSMaxNum = 10
            TCSMinPool = 2
            StackMaxSize = 0x40000
            HeapMaxSize = 0x100000
            "#,
        )
        .unwrap();
        let params = Parameters::from_config(&cfg).unwrap();
        assert_eq!(params.prod_id, 42);
        assert_eq!(params.tcs_max_num, 10);
        assert!(params.tcs_max_num_set);
        assert!(params.tcs_min_pool_set);
        assert!(!params.heap_init_size_set);
    }

    #[test]
    fn tcs_max_defaults_to_tcs_num() {
        let cfg: EnclaveConfig = toml::from_str("TCSNum = 4").unwrap();
        let params = Parameters::from_config(&cfg).unwrap();
        assert_eq!(params.tcs_max_num, 4);
        assert!(!params.tcs_max_num_set);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let cfg: EnclaveConfig = toml::from_str("ReleaseType = 2").unwrap();
        assert!(matches!(
            Parameters::from_config(&cfg),
            Err(Error::Validation(_))
        ));

        let cfg: EnclaveConfig = toml::from_str("StackMaxSize = 0x1000").unwrap();
        assert!(Parameters::from_config(&cfg).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<EnclaveConfig>("Bogus = 1").is_err());
    }
}
