use core::num::NonZeroU64;
use std::borrow::Cow;

use serde::Deserialize;

/// Chain-level configuration that is not fixed by the preset.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub config_name: Cow<'static, str>,
    pub preset_base: Cow<'static, str>,
    pub seconds_per_slot: NonZeroU64,
}

impl Default for Config {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl Config {
    #[must_use]
    pub const fn mainnet() -> Self {
        Self {
            config_name: Cow::Borrowed("mainnet"),
            preset_base: Cow::Borrowed("mainnet"),
            seconds_per_slot: nonzero(12),
        }
    }

    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            config_name: Cow::Borrowed("minimal"),
            preset_base: Cow::Borrowed("minimal"),
            seconds_per_slot: nonzero(6),
        }
    }
}

const fn nonzero(value: u64) -> NonZeroU64 {
    match NonZeroU64::new(value) {
        Some(value) => value,
        None => panic!("value is zero"),
    }
}
