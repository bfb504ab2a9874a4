//! Frame clock for timestamp correlation
//!
//! Every date carried by a frame is expressed in ticks of [`CLOCK_FREQ`].

use super::types::Rational;

/// Global clock frequency (ticks per second)
pub const CLOCK_FREQ: u64 = 27_000_000;

/// Convert a count expressed in `time_base` units to ticks
pub fn rescale(value: u64, time_base: Rational) -> u64 {
    if time_base.den == 0 {
        return 0;
    }
    (value as u128 * CLOCK_FREQ as u128 * time_base.num as u128 / time_base.den as u128) as u64
}

/// Reference point a date is expressed against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateKind {
    /// Clock reference (arrival at the decoder buffer)
    Cr,
    /// Decoding timestamp
    Dts,
    /// Presentation timestamp
    Pts,
}

/// A date in one clock domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
    pub value: u64,
    pub kind: DateKind,
}

impl Date {
    pub fn pts(value: u64) -> Self {
        Self {
            value,
            kind: DateKind::Pts,
        }
    }

    pub fn dts(value: u64) -> Self {
        Self {
            value,
            kind: DateKind::Dts,
        }
    }
}

/// Clock domain of a date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Local system clock
    Sys,
    /// Program clock of the stream
    Prog,
    /// Original clock as received
    Orig,
}

/// Dates and delays attached to a frame
///
/// Each domain stores a single date plus the kind it refers to. The other
/// dates are derived from the delays: `dts = pts - dts_pts_delay` and
/// `cr = dts - cr_dts_delay`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameClock {
    pub sys: Option<Date>,
    pub prog: Option<Date>,
    pub orig: Option<Date>,
    pub dts_pts_delay: Option<u64>,
    pub cr_dts_delay: Option<u64>,
    pub duration: Option<u64>,
}

impl FrameClock {
    /// Clock with a program PTS only
    pub fn with_pts(pts: u64) -> Self {
        Self {
            prog: Some(Date::pts(pts)),
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }

    fn slot(&self, domain: Domain) -> Option<Date> {
        match domain {
            Domain::Sys => self.sys,
            Domain::Prog => self.prog,
            Domain::Orig => self.orig,
        }
    }

    fn slot_mut(&mut self, domain: Domain) -> &mut Option<Date> {
        match domain {
            Domain::Sys => &mut self.sys,
            Domain::Prog => &mut self.prog,
            Domain::Orig => &mut self.orig,
        }
    }

    /// Date stored for `domain`, as is
    pub fn date(&self, domain: Domain) -> Option<Date> {
        self.slot(domain)
    }

    pub fn set_date(&mut self, domain: Domain, date: Date) {
        *self.slot_mut(domain) = Some(date);
    }

    /// Decoding timestamp in `domain`
    pub fn dts(&self, domain: Domain) -> Option<u64> {
        let date = self.slot(domain)?;
        match date.kind {
            DateKind::Dts => Some(date.value),
            DateKind::Pts => Some(
                date.value
                    .saturating_sub(self.dts_pts_delay.unwrap_or(0)),
            ),
            DateKind::Cr => Some(date.value + self.cr_dts_delay.unwrap_or(0)),
        }
    }

    /// Presentation timestamp in `domain`
    pub fn pts(&self, domain: Domain) -> Option<u64> {
        let date = self.slot(domain)?;
        match date.kind {
            DateKind::Pts => Some(date.value),
            _ => self
                .dts(domain)
                .map(|dts| dts + self.dts_pts_delay.unwrap_or(0)),
        }
    }

    /// Clock reference in `domain`
    pub fn cr(&self, domain: Domain) -> Option<u64> {
        let date = self.slot(domain)?;
        match date.kind {
            DateKind::Cr => Some(date.value),
            _ => self
                .dts(domain)
                .map(|dts| dts.saturating_sub(self.cr_dts_delay.unwrap_or(0))),
        }
    }

    /// Re-express every present date as a decoding timestamp
    pub fn rebase_dts(&mut self) {
        for domain in [Domain::Sys, Domain::Prog, Domain::Orig] {
            if let Some(dts) = self.dts(domain) {
                *self.slot_mut(domain) = Some(Date::dts(dts));
            }
        }
    }

    /// Advance every present date by `ticks`
    pub fn shift(&mut self, ticks: u64) {
        for domain in [Domain::Sys, Domain::Prog, Domain::Orig] {
            if let Some(date) = self.slot_mut(domain) {
                date.value += ticks;
            }
        }
    }
}
