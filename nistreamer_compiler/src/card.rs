//! Implements the [`Card`] struct: one named NI device with its sample rate, output channels and
//! per-device synchronization settings.
//!
//! A NI control system consists of one or both of the components:
//! 1. Cards directly attached to the computer via PCIe/USB.
//! 2. A PCIe link card connected to a PXIe chassis, which hosts multiple PXIe cards.
//!
//! Each [`Card`] hosts one task type: analog output (channels named `ao(number)`) or digital
//! output (channels named `port(number)/line(number)`).
//!
//! ### Synchronization settings
//! [`SyncConfig`] mirrors what the card does with shared signals during a run:
//! - `start_trig_in` / `start_trig_out`: import or export the start trigger;
//! - `samp_clk_in` / `samp_clk_out`: import or export the sample clock;
//! - `ref_clk_in`: import the 10 MHz reference clock (exporting it is a cross-card decision kept in
//!   [`SyncState`](crate::experiment::SyncState)).

use std::fmt;

use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use crate::channel::*;
use crate::error::*;
use crate::instruction::*;
use crate::program::CompiledCard;
use crate::utils::time_to_tick;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardKind {
    Analog,
    Digital,
}

impl fmt::Display for CardKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CardKind::Analog => write!(f, "AO"),
            CardKind::Digital => write!(f, "DO"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    pub start_trig_in: Option<String>,
    pub start_trig_out: Option<String>,
    pub samp_clk_in: Option<String>,
    pub samp_clk_out: Option<String>,
    pub ref_clk_in: Option<String>,
    pub ref_clk_rate: Option<f64>,
    /// Some(finite timeout in seconds) or None to wait indefinitely for buffer writes.
    pub min_bufwrite_timeout: Option<f64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_trig_in: None,
            start_trig_out: None,
            samp_clk_in: None,
            samp_clk_out: None,
            ref_clk_in: None,
            ref_clk_rate: None,
            min_bufwrite_timeout: Some(5.0),
        }
    }
}

pub struct Card {
    max_name: String,
    kind: CardKind,
    samp_rate: f64,
    nickname: Option<String>,
    channels: IndexMap<String, ChannelTimeline>,
    sync: SyncConfig,
}

impl Card {
    pub fn new(max_name: &str, kind: CardKind, samp_rate: f64) -> Self {
        Self {
            max_name: max_name.to_string(),
            kind,
            samp_rate,
            nickname: None,
            channels: IndexMap::new(),
            sync: SyncConfig::default(),
        }
    }

    pub fn max_name(&self) -> &str {
        &self.max_name
    }
    pub fn kind(&self) -> CardKind {
        self.kind
    }
    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }
    pub fn clock_period(&self) -> f64 {
        1.0 / self.samp_rate
    }
    pub fn nickname(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.max_name)
    }
    pub fn set_nickname(&mut self, nickname: Option<&str>) {
        self.nickname = nickname.map(str::to_string);
    }
    pub fn channels(&self) -> &IndexMap<String, ChannelTimeline> {
        &self.channels
    }
    pub fn channels_(&mut self) -> &mut IndexMap<String, ChannelTimeline> {
        &mut self.channels
    }
    pub fn sync(&self) -> &SyncConfig {
        &self.sync
    }
    pub fn sync_(&mut self) -> &mut SyncConfig {
        &mut self.sync
    }

    fn unknown_chan(&self, name: &str) -> StreamerError {
        StreamerError::UnknownChannel {
            card: self.max_name.clone(),
            chan: name.to_string(),
            registered: self.channels.keys().cloned().collect(),
        }
    }
    /// Shortcut to borrow a channel by name
    pub fn chan(&self, name: &str) -> Result<&ChannelTimeline> {
        self.channels.get(name).ok_or_else(|| self.unknown_chan(name))
    }
    /// Shortcut to mutably borrow a channel by name
    pub fn chan_(&mut self, name: &str) -> Result<&mut ChannelTimeline> {
        let idx = self
            .channels
            .get_index_of(name)
            .ok_or_else(|| self.unknown_chan(name))?;
        Ok(&mut self.channels[idx])
    }

    /// Validates a channel name against the naming convention of the card task type:
    /// - analog: `ao(number)`, e.g. `ao0`;
    /// - digital: `port(number)/line(number)`, e.g. `port0/line1`.
    pub fn check_chan_name(&self, name: &str) -> Result<()> {
        let (pattern, description) = match self.kind {
            CardKind::Analog => (r"^ao\d+$", "ao(number)"),
            CardKind::Digital => (r"^port\d+/line\d+$", "port(number)/line(number)"),
        };
        let re = Regex::new(pattern).map_err(|e| StreamerError::InvalidChannelName {
            name: name.to_string(),
            expected: e.to_string(),
        })?;
        if !re.is_match(name) {
            return Err(StreamerError::InvalidChannelName {
                name: name.to_string(),
                expected: description.to_string(),
            });
        }
        if self.channels.contains_key(name) {
            return Err(StreamerError::DuplicateChannel {
                card: self.max_name.clone(),
                chan: name.to_string(),
            });
        }
        Ok(())
    }

    /// Registers a new channel. `default_value` is the level for analog channels and the logical
    /// state for digital ones. The channel kind must match the card task type.
    pub fn add_channel(&mut self, name: &str, kind: ChannelKind, default_value: f64) -> Result<()> {
        if kind.is_digital() != (self.kind == CardKind::Digital) {
            return Err(StreamerError::InvalidChannelName {
                name: name.to_string(),
                expected: format!("a channel of a {} card", self.kind),
            });
        }
        self.check_chan_name(name)?;
        debug!("card {}: adding channel {name} ({kind:?})", self.max_name);
        let chan = ChannelTimeline::new(name, kind, self.samp_rate, default_value);
        self.channels.insert(name.to_string(), chan);
        Ok(())
    }

    pub fn last_instr_end_pos(&self) -> usize {
        self.channels
            .values()
            .map(|chan| chan.last_instr_end_pos())
            .max()
            .unwrap_or(0)
    }
    pub fn last_instr_end_time(&self) -> f64 {
        self.last_instr_end_pos() as f64 / self.samp_rate
    }

    pub fn is_edited(&self) -> bool {
        self.channels.values().any(|chan| chan.is_edited())
    }
    pub fn is_fresh_compiled(&self) -> bool {
        self.channels.values().all(|chan| chan.is_fresh_compiled())
    }

    pub fn clear_edit_cache(&mut self) {
        for chan in self.channels.values_mut() {
            chan.clear()
        }
    }

    /// Restores "no external sync" defaults and drops all instructions.
    /// Sample rate and registered channels are kept.
    pub fn reset(&mut self) {
        self.clear_edit_cache();
        self.sync = SyncConfig::default();
    }

    /// Reset instructions for every channel at `reset_time`, validated but not committed.
    pub fn check_reset_instr(&self, reset_time: f64) -> Result<Vec<(String, InstrBook)>> {
        let reset_pos = time_to_tick(reset_time, self.samp_rate).ok_or_else(|| {
            StreamerError::InvalidRange(format!(
                "card {}: reset_time {reset_time} does not fit on the clock grid",
                self.max_name
            ))
        })?;
        if reset_pos < self.last_instr_end_pos() {
            return Err(StreamerError::InvalidRange(format!(
                "card {}: reset_time {reset_time} was rounded to {reset_pos} clock cycles \
                which is below the last instruction end_pos {}",
                self.max_name,
                self.last_instr_end_pos()
            )));
        }
        let instr = Instruction::new(reset_time, None, false, InstrKind::Reset);
        self.channels
            .values()
            .map(|chan| Ok((chan.name().to_string(), chan.check(instr)?)))
            .collect()
    }

    /// `true` if a finite-duration instruction ends exactly on `stop_tick` on any channel.
    pub fn check_end_clipped(&self, stop_tick: usize) -> bool {
        self.channels.values().any(|chan| chan.ends_at(stop_tick))
    }

    /// Compiles all channels against `stop_time`.
    ///
    /// If the last instruction on some channel is a duration instruction ending precisely on the
    /// stop tick, the card runs one clock cycle longer. Without the extra sample the generation
    /// would stop at the last sample of the pulse and the hardware would keep that value, so the
    /// pulse would have its opening edge but not its closing one. The extra sample is filled with
    /// the after-end padding of the channel.
    pub fn compile(&mut self, stop_time: f64) -> Result<CompiledCard> {
        let stop_tick = time_to_tick(stop_time, self.samp_rate).ok_or_else(|| {
            StreamerError::InvalidRange(format!(
                "card {}: stop_time {stop_time} does not fit on the clock grid",
                self.max_name
            ))
        })?;
        if stop_tick < self.last_instr_end_pos() {
            return Err(StreamerError::InvalidRange(format!(
                "card {}: stop_time {stop_time} was rounded to {stop_tick} clock cycles \
                which is below the last instruction end_pos {}",
                self.max_name,
                self.last_instr_end_pos()
            )));
        }
        let stop_pos = if self.check_end_clipped(stop_tick) {
            stop_tick.checked_add(1).ok_or_else(|| {
                StreamerError::InvalidRange(format!(
                    "card {}: no room for the closing-edge tick after {stop_tick}",
                    self.max_name
                ))
            })?
        } else {
            stop_tick
        };
        let mut compiled = IndexMap::new();
        for (name, chan) in self.channels.iter_mut() {
            chan.validate()?;
            compiled.insert(name.clone(), chan.compile(stop_pos)?);
        }
        debug!("card {}: compiled to {stop_pos} samples", self.max_name);
        Ok(CompiledCard::new(self.samp_rate, stop_pos, compiled))
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let samp_clk_info = match (&self.sync.samp_clk_in, &self.sync.samp_clk_out) {
            (Some(src), _) => format!("imported from {src}"),
            (None, Some(dest)) => format!("onboard, exported to {dest}"),
            (None, None) => "onboard".to_string(),
        };
        let trig_info = match (&self.sync.start_trig_in, &self.sync.start_trig_out) {
            (Some(src), _) => format!("imported from {src}"),
            (None, Some(dest)) => format!("exported to {dest}"),
            (None, None) => "software start".to_string(),
        };
        let ref_clk_info = match &self.sync.ref_clk_in {
            Some(src) => format!(
                "imported from {src} at {} Hz",
                self.sync.ref_clk_rate.unwrap_or(1e7)
            ),
            None => "onboard".to_string(),
        };
        write!(
            f,
            "{} card {} ({})\n\
            \tsamp_rate: {} Sa/s\n\
            \tsample clock: {samp_clk_info}\n\
            \tstart trigger: {trig_info}\n\
            \treference clock: {ref_clk_info}\n\
            \tchannels: {:?}",
            self.kind,
            self.max_name,
            self.nickname(),
            self.samp_rate,
            self.channels.keys().collect::<Vec<_>>()
        )
    }
}
