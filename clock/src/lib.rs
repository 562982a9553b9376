//! A [`Stream`]-based slot timer.
//!
//! Implemented over [`tokio::time::Interval`]. An interval may produce items
//! late, but delays do not accumulate. Each slot is divided into
//! [`TickKind::CARDINALITY`] equal intervals; consumers that only care about
//! slot boundaries filter on [`Tick::is_start_of_slot`].

use core::time::Duration;
use std::time::{Instant, SystemTime};

use anyhow::Result;
use enum_iterator::Sequence;
use futures::stream::{Stream, StreamExt as _};
use helper_functions::misc;
use serde::Deserialize;
use strum::AsRefStr;
use thiserror::Error;
use tokio_stream::wrappers::IntervalStream;
use types::{
    config::Config,
    phase0::consts::GENESIS_SLOT,
    phase0::primitives::{Epoch, Slot, UnixSeconds},
    preset::Preset,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Deserialize)]
pub struct Tick {
    pub slot: Slot,
    pub kind: TickKind,
}

impl Tick {
    #[must_use]
    pub const fn start_of_slot(slot: Slot) -> Self {
        Self::new(slot, TickKind::Propose)
    }

    pub fn at_time(config: &Config, time: UnixSeconds, genesis_time: UnixSeconds) -> Result<Self> {
        Self::from_duration(config, Duration::from_secs(time), genesis_time)
    }

    pub fn current(config: &Config, genesis_time: UnixSeconds) -> Result<Self> {
        let duration_since_unix_epoch = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)?;
        Self::from_duration(config, duration_since_unix_epoch, genesis_time)
    }

    #[must_use]
    pub fn epoch<P: Preset>(self) -> Epoch {
        misc::compute_epoch_at_slot::<P>(self.slot)
    }

    #[must_use]
    pub const fn is_start_of_slot(self) -> bool {
        matches!(self.kind, TickKind::Propose)
    }

    #[must_use]
    pub fn is_start_of_epoch<P: Preset>(self) -> bool {
        misc::is_epoch_start::<P>(self.slot) && self.is_start_of_slot()
    }

    fn from_duration(
        config: &Config,
        duration_since_unix_epoch: Duration,
        genesis_time: UnixSeconds,
    ) -> Result<Self> {
        let unix_epoch_to_genesis = Duration::from_secs(genesis_time);

        // `Duration` does not implement `Div<Duration>` or `Rem<Duration>`,
        // so the arithmetic is done on nanoseconds.
        let nanos_since_genesis = duration_since_unix_epoch
            .saturating_sub(unix_epoch_to_genesis)
            .as_nanos();

        let nanos_per_tick = tick_duration(config).as_nanos();
        let ticks_per_slot = u128::try_from(TickKind::CARDINALITY)?;
        let ticks_since_genesis = nanos_since_genesis / nanos_per_tick;
        let slots_since_genesis = u64::try_from(ticks_since_genesis / ticks_per_slot)?;
        let ticks_since_slot = usize::try_from(ticks_since_genesis % ticks_per_slot)?;
        let slot = GENESIS_SLOT + slots_since_genesis;

        let kind = enum_iterator::all::<TickKind>()
            .nth(ticks_since_slot)
            .expect("more ticks would add up to additional slots");

        Ok(Self::new(slot, kind))
    }

    const fn new(slot: Slot, kind: TickKind) -> Self {
        Self { slot, kind }
    }

    fn next(self) -> Result<Self> {
        let Self { slot, kind } = self;

        let next_slot = match kind.next() {
            Some(_) => slot,
            None => slot.checked_add(1).ok_or(ClockError::RanOutOfSlots)?,
        };

        let next_kind = enum_iterator::next_cycle(&kind);

        Ok(Self::new(next_slot, next_kind))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Sequence, AsRefStr, Deserialize)]
pub enum TickKind {
    Propose,
    Attest,
    Aggregate,
}

/// An endless stream of [`Tick`]s starting with the one after the current one.
pub fn ticks(config: &Config, genesis_time: UnixSeconds) -> Result<impl Stream<Item = Result<Tick>>> {
    let now = Instant::now();
    let current_tick = Tick::current(config, genesis_time)?;
    let tick_duration = tick_duration(config);

    let next_tick = current_tick.next()?;

    // The stream starts one full tick from now, which is close enough for the
    // first item. Later items stay aligned because delays do not accumulate.
    let interval = tokio::time::interval_at((now + tick_duration).into(), tick_duration);

    let stream = IntervalStream::new(interval).scan(next_tick, |tick, _| {
        let current = *tick;
        let next = current.next();

        let result = match next {
            Ok(next) => {
                *tick = next;
                Some(Ok(current))
            }
            Err(error) => Some(Err(error)),
        };

        futures::future::ready(result)
    });

    Ok(stream)
}

fn slot_duration(config: &Config) -> Duration {
    Duration::from_secs(config.seconds_per_slot.get())
}

fn tick_duration(config: &Config) -> Duration {
    let ticks_per_slot =
        u32::try_from(TickKind::CARDINALITY).expect("tick kind cardinality fits in u32");

    slot_duration(config) / ticks_per_slot
}

#[derive(Debug, Error)]
enum ClockError {
    #[error("ran out of slots")]
    RanOutOfSlots,
}
