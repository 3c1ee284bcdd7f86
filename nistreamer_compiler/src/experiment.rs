//! The experiment module provides the highest level of abstraction: an explicit, owning registry of
//! cards together with the global synchronization state and the compile cache.
//!
//! ## Overview
//!
//! The behavior of a registry is defined by the [`BaseExperiment`] trait through default
//! implementations on top of a handful of field accessors. [`Experiment`] is the plain
//! implementation in this crate; other crates wrap the same fields and pick up every method with
//! [`impl_exp_boilerplate`].
//!
//! Methods fall into these groups:
//! 1. Registration: [`add_ao_card`], [`add_do_card`], [`add_ao_chan`], [`add_do_chan`],
//!    [`add_do_chan_flat`], [`remove_card`].
//! 2. Instruction builders taking a [`ChanHandle`]: [`constant`], [`go_constant`], [`sine`],
//!    [`go_sine`], [`ramp`], [`high`], [`low`], [`go_high`], [`go_low`], [`on`], [`off`],
//!    [`go_on`], [`go_off`], [`add_reset_instr`]. Each returns the time at which the instruction
//!    ends, so timelines can be chained as `t = exp.constant(&ch, t, dur, val, keep_val)?`.
//! 3. Synchronization: [`cfg_start_trig`], [`cfg_samp_clk_src`], [`cfg_samp_clk_out`],
//!    [`cfg_ref_clk`], [`set_starts_last`], [`set_ref_clk_provider`], [`reset_card`].
//! 4. Compilation and inspection: [`compile`], [`calc_signal`], [`last_instr_end_time`],
//!    [`total_run_time`], [`clear_edit_cache`].
//!
//! Every edit drops the compiled program: signal queries and runs require a fresh [`compile`].
//!
//! [`add_ao_card`]: BaseExperiment::add_ao_card
//! [`add_do_card`]: BaseExperiment::add_do_card
//! [`add_ao_chan`]: BaseExperiment::add_ao_chan
//! [`add_do_chan`]: BaseExperiment::add_do_chan
//! [`add_do_chan_flat`]: BaseExperiment::add_do_chan_flat
//! [`remove_card`]: BaseExperiment::remove_card
//! [`constant`]: BaseExperiment::constant
//! [`go_constant`]: BaseExperiment::go_constant
//! [`sine`]: BaseExperiment::sine
//! [`go_sine`]: BaseExperiment::go_sine
//! [`ramp`]: BaseExperiment::ramp
//! [`high`]: BaseExperiment::high
//! [`low`]: BaseExperiment::low
//! [`go_high`]: BaseExperiment::go_high
//! [`go_low`]: BaseExperiment::go_low
//! [`on`]: BaseExperiment::on
//! [`off`]: BaseExperiment::off
//! [`go_on`]: BaseExperiment::go_on
//! [`go_off`]: BaseExperiment::go_off
//! [`add_reset_instr`]: BaseExperiment::add_reset_instr
//! [`cfg_start_trig`]: BaseExperiment::cfg_start_trig
//! [`cfg_samp_clk_src`]: BaseExperiment::cfg_samp_clk_src
//! [`cfg_samp_clk_out`]: BaseExperiment::cfg_samp_clk_out
//! [`cfg_ref_clk`]: BaseExperiment::cfg_ref_clk
//! [`set_starts_last`]: BaseExperiment::set_starts_last
//! [`set_ref_clk_provider`]: BaseExperiment::set_ref_clk_provider
//! [`reset_card`]: BaseExperiment::reset_card
//! [`compile`]: BaseExperiment::compile
//! [`calc_signal`]: BaseExperiment::calc_signal
//! [`last_instr_end_time`]: BaseExperiment::last_instr_end_time
//! [`total_run_time`]: BaseExperiment::total_run_time
//! [`clear_edit_cache`]: BaseExperiment::clear_edit_cache

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::Array1;
use tracing::{debug, info, warn};

use crate::backend::StreamBackend;
use crate::card::*;
use crate::channel::*;
use crate::error::*;
use crate::instruction::*;
use crate::program::*;
use crate::utils::*;

/// Reference rate the onboard clock is exported at
pub const REF_CLK_RATE: f64 = 1e7;

/// Binds a channel to its card. The only way instructions reach a channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChanHandle {
    card: String,
    chan: String,
}

impl ChanHandle {
    pub fn new(card: &str, chan: &str) -> Self {
        Self {
            card: card.to_string(),
            chan: chan.to_string(),
        }
    }
    pub fn card(&self) -> &str {
        &self.card
    }
    pub fn chan(&self) -> &str {
        &self.chan
    }
}

impl fmt::Display for ChanHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.card, self.chan)
    }
}

/// Cross-card synchronization roles.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncState {
    /// Card started only after every other card's start call returned.
    pub starts_last: Option<String>,
    /// Card exporting its 10 MHz reference clock, and the terminal it is exported to.
    pub ref_clk_provider: Option<(String, String)>,
}

pub trait BaseExperiment {
    // FIELD methods
    fn cards(&self) -> &IndexMap<String, Card>;
    fn cards_(&mut self) -> &mut IndexMap<String, Card>;
    fn sync_state(&self) -> &SyncState;
    fn sync_state_(&mut self) -> &mut SyncState;
    fn backend(&self) -> &Arc<dyn StreamBackend>;
    fn compiled(&self) -> Option<&CompiledProgram>;
    fn compiled_(&mut self) -> &mut Option<CompiledProgram>;

    fn unknown_card(&self, name: &str) -> StreamerError {
        StreamerError::UnknownCard {
            name: name.to_string(),
            registered: self.cards().keys().cloned().collect(),
        }
    }

    /// Shortcut to borrow a card by `max_name`
    fn card(&self, name: &str) -> Result<&Card> {
        self.cards().get(name).ok_or_else(|| self.unknown_card(name))
    }

    /// Shortcut to mutably borrow a card by `max_name`
    fn card_(&mut self, name: &str) -> Result<&mut Card> {
        let idx = self
            .cards()
            .get_index_of(name)
            .ok_or_else(|| self.unknown_card(name))?;
        Ok(&mut self.cards_()[idx])
    }

    fn chan(&self, handle: &ChanHandle) -> Result<&ChannelTimeline> {
        self.card(handle.card())?.chan(handle.chan())
    }

    /// Drops the compiled program. Called by every edit.
    fn invalidate(&mut self) {
        if self.compiled_().take().is_some() {
            debug!("compiled program invalidated");
        }
    }

    // =============== Registration ===============

    fn add_card_base(&mut self, name: &str, kind: CardKind, samp_rate: f64) -> Result<()> {
        if self.cards().contains_key(name) {
            return Err(StreamerError::DuplicateCard(name.to_string()));
        }
        if !samp_rate.is_finite() || samp_rate <= 0.0 {
            return Err(StreamerError::InvalidRange(format!(
                "card {name}: sample rate must be positive, got {samp_rate}"
            )));
        }
        match kind {
            CardKind::Analog => self.backend().add_analog_device(name, samp_rate)?,
            CardKind::Digital => self.backend().add_digital_device(name, samp_rate)?,
        };
        info!("registered {kind} card {name} at {samp_rate} Sa/s");
        self.cards_()
            .insert(name.to_string(), Card::new(name, kind, samp_rate));
        self.invalidate();
        Ok(())
    }

    fn add_ao_card(&mut self, name: &str, samp_rate: f64) -> Result<()> {
        self.add_card_base(name, CardKind::Analog, samp_rate)
    }

    fn add_do_card(&mut self, name: &str, samp_rate: f64) -> Result<()> {
        self.add_card_base(name, CardKind::Digital, samp_rate)
    }

    /// Drops the card from the registry and clears any sync role naming it.
    fn remove_card(&mut self, name: &str) -> Result<()> {
        self.card(name)?;
        self.cards_().shift_remove(name);
        let sync = self.sync_state_();
        if sync.starts_last.as_deref() == Some(name) {
            warn!("removed card {name} was designated to start last; clearing");
            sync.starts_last = None;
        }
        if sync.ref_clk_provider.as_ref().map(|(card, _)| card.as_str()) == Some(name) {
            warn!("removed card {name} was the reference clock provider; clearing");
            sync.ref_clk_provider = None;
        }
        self.invalidate();
        Ok(())
    }

    fn set_card_nickname(&mut self, name: &str, nickname: Option<&str>) -> Result<()> {
        self.card_(name)?.set_nickname(nickname);
        Ok(())
    }

    fn set_chan_nickname(&mut self, handle: &ChanHandle, nickname: Option<&str>) -> Result<()> {
        self.card_(handle.card())?
            .chan_(handle.chan())?
            .set_nickname(nickname);
        Ok(())
    }

    /// Adds analog output channel `ao(channel_id)` to an analog card.
    fn add_ao_chan(&mut self, card: &str, channel_id: usize, default_value: f64) -> Result<ChanHandle> {
        let name = format!("ao{channel_id}");
        let card_ref = self.card(card)?;
        if card_ref.kind() != CardKind::Analog {
            return Err(StreamerError::InvalidChannelName {
                name,
                expected: format!("port(number)/line(number) on DO card {card}"),
            });
        }
        if !default_value.is_finite() {
            return Err(StreamerError::InvalidRange(format!(
                "{card}/{name}: default value {default_value} is not finite"
            )));
        }
        card_ref.check_chan_name(&name)?;
        self.backend()
            .add_analog_channel(card, channel_id, default_value)?;
        self.card_(card)?
            .add_channel(&name, ChannelKind::AnalogOut, default_value)?;
        self.invalidate();
        Ok(ChanHandle::new(card, &name))
    }

    /// Adds digital output channel `port(port)/line(line)` to a digital card.
    ///
    /// `default_on` is the logical idle state. For `inverted` lines, logical on is physical low
    /// and the line idles at the complement of `default_on`.
    fn add_do_chan(
        &mut self,
        card: &str,
        port: usize,
        line: usize,
        default_on: bool,
        inverted: bool,
    ) -> Result<ChanHandle> {
        let name = format!("port{port}/line{line}");
        let card_ref = self.card(card)?;
        if card_ref.kind() != CardKind::Digital {
            return Err(StreamerError::InvalidChannelName {
                name,
                expected: format!("ao(number) on AO card {card}"),
            });
        }
        card_ref.check_chan_name(&name)?;
        let kind = if inverted {
            ChannelKind::InvertedDigitalOut
        } else {
            ChannelKind::DigitalOut
        };
        let physical_default = kind.default_value(default_on as u8 as f64) != 0.0;
        self.backend()
            .add_digital_channel(card, port, line, physical_default)?;
        self.card_(card)?
            .add_channel(&name, kind, default_on as u8 as f64)?;
        self.invalidate();
        Ok(ChanHandle::new(card, &name))
    }

    /// Same as [`BaseExperiment::add_do_chan`] for cards addressing lines by a flat index,
    /// split as `port = idx / lines_per_port`, `line = idx % lines_per_port`.
    fn add_do_chan_flat(
        &mut self,
        card: &str,
        idx: usize,
        lines_per_port: usize,
        default_on: bool,
        inverted: bool,
    ) -> Result<ChanHandle> {
        let (port, line) = flat_to_port_line(idx, lines_per_port).ok_or_else(|| {
            StreamerError::InvalidRange("lines_per_port must be positive".to_string())
        })?;
        self.add_do_chan(card, port, line, default_on, inverted)
    }

    // =============== Instructions ===============

    /// Validates, forwards to the backend, then commits. Nothing is committed on failure.
    /// Returns the instruction end time (`t_start` for go-instructions).
    fn add_instr(&mut self, handle: &ChanHandle, instr: Instruction) -> Result<f64> {
        let chan = self.chan(handle)?;
        if chan.kind().emit(&instr, chan.default_value()).is_none() {
            return Err(StreamerError::WrongChannelKind {
                card: handle.card().to_string(),
                chan: handle.chan().to_string(),
                instr: instr.kind.name().to_string(),
            });
        }
        let book = chan.check(instr)?;
        self.backend().emit(handle.card(), handle.chan(), &instr)?;
        self.card_(handle.card())?.chan_(handle.chan())?.insert(book);
        self.invalidate();
        Ok(instr.t_end().unwrap_or(instr.t_start))
    }

    /// Holds `value` over `[t, t + dur)`. With `keep_val` the channel stays at `value` until the
    /// next instruction, otherwise it returns to its default value.
    fn constant(
        &mut self,
        handle: &ChanHandle,
        t: f64,
        dur: f64,
        value: f64,
        keep_val: bool,
    ) -> Result<f64> {
        let kind = InstrKind::Constant(ConstArgs { value });
        self.add_instr(handle, Instruction::new(t, Some(dur), keep_val, kind))
    }

    /// Sets the channel to `value` at `t` and holds it until the next instruction.
    fn go_constant(&mut self, handle: &ChanHandle, t: f64, value: f64) -> Result<f64> {
        let kind = InstrKind::Constant(ConstArgs { value });
        self.add_instr(handle, Instruction::new(t, None, false, kind))
    }

    fn sine(
        &mut self,
        handle: &ChanHandle,
        t: f64,
        dur: f64,
        args: SineArgs,
        keep_val: bool,
    ) -> Result<f64> {
        self.add_instr(handle, Instruction::new(t, Some(dur), keep_val, InstrKind::Sine(args)))
    }

    fn go_sine(&mut self, handle: &ChanHandle, t: f64, args: SineArgs) -> Result<f64> {
        self.add_instr(handle, Instruction::new(t, None, false, InstrKind::Sine(args)))
    }

    /// Linear ramp over `[t, t + dur)`. With `keep_val` the channel holds `end_val` afterwards.
    fn ramp(
        &mut self,
        handle: &ChanHandle,
        t: f64,
        dur: f64,
        args: RampArgs,
        keep_val: bool,
    ) -> Result<f64> {
        self.add_instr(handle, Instruction::new(t, Some(dur), keep_val, InstrKind::Ramp(args)))
    }

    fn high(&mut self, handle: &ChanHandle, t: f64, dur: f64) -> Result<f64> {
        self.add_instr(handle, Instruction::new(t, Some(dur), false, InstrKind::High))
    }

    fn low(&mut self, handle: &ChanHandle, t: f64, dur: f64) -> Result<f64> {
        self.add_instr(handle, Instruction::new(t, Some(dur), false, InstrKind::Low))
    }

    fn go_high(&mut self, handle: &ChanHandle, t: f64) -> Result<f64> {
        self.add_instr(handle, Instruction::new(t, None, false, InstrKind::GoHigh))
    }

    fn go_low(&mut self, handle: &ChanHandle, t: f64) -> Result<f64> {
        self.add_instr(handle, Instruction::new(t, None, false, InstrKind::GoLow))
    }

    // Physical direction of the logical state on this line
    fn logical_kind(&self, handle: &ChanHandle, on: bool, go: bool) -> Result<InstrKind> {
        let high = self.chan(handle)?.kind().go_state(on) != 0.0;
        Ok(match (high, go) {
            (true, false) => InstrKind::High,
            (false, false) => InstrKind::Low,
            (true, true) => InstrKind::GoHigh,
            (false, true) => InstrKind::GoLow,
        })
    }

    fn on(&mut self, handle: &ChanHandle, t: f64, dur: f64) -> Result<f64> {
        let kind = self.logical_kind(handle, true, false)?;
        self.add_instr(handle, Instruction::new(t, Some(dur), false, kind))
    }

    fn off(&mut self, handle: &ChanHandle, t: f64, dur: f64) -> Result<f64> {
        let kind = self.logical_kind(handle, false, false)?;
        self.add_instr(handle, Instruction::new(t, Some(dur), false, kind))
    }

    fn go_on(&mut self, handle: &ChanHandle, t: f64) -> Result<f64> {
        let kind = self.logical_kind(handle, true, true)?;
        self.add_instr(handle, Instruction::new(t, None, false, kind))
    }

    fn go_off(&mut self, handle: &ChanHandle, t: f64) -> Result<f64> {
        let kind = self.logical_kind(handle, false, true)?;
        self.add_instr(handle, Instruction::new(t, None, false, kind))
    }

    /// Returns every channel of every card to its default value at `reset_time`
    /// (defaults to the current [`BaseExperiment::last_instr_end_time`]).
    ///
    /// Either all channels receive the reset instruction or none does.
    fn add_reset_instr(&mut self, reset_time: Option<f64>) -> Result<f64> {
        let last_instr_end_time = self.last_instr_end_time();
        let reset_time = match reset_time {
            Some(reset_time) => {
                if reset_time < last_instr_end_time {
                    return Err(StreamerError::InvalidRange(format!(
                        "requested reset at t = {reset_time} [s] \
                        but some channels have instructions spanning until {last_instr_end_time} [s]"
                    )));
                }
                reset_time
            }
            None => last_instr_end_time,
        };
        let mut pending = Vec::new();
        for card in self.cards().values() {
            for (chan, book) in card.check_reset_instr(reset_time)? {
                pending.push((card.max_name().to_string(), chan, book));
            }
        }
        for (card, chan, book) in pending.iter() {
            self.backend().emit(card, chan, &book.instr)?;
        }
        for (card, chan, book) in pending {
            self.card_(&card)?.chan_(&chan)?.insert(book);
        }
        self.invalidate();
        Ok(reset_time)
    }

    // =============== Synchronization ===============

    /// Exports (`export = true`) or imports the card start trigger on `line`.
    fn cfg_start_trig(&mut self, card: &str, line: &str, export: bool) -> Result<()> {
        self.card(card)?;
        let (trig_in, trig_out) = if export {
            (None, Some(line))
        } else {
            (Some(line), None)
        };
        self.backend().set_start_trig_in(card, trig_in)?;
        self.backend().set_start_trig_out(card, trig_out)?;
        let sync = self.card_(card)?.sync_();
        sync.start_trig_in = trig_in.map(str::to_string);
        sync.start_trig_out = trig_out.map(str::to_string);
        self.invalidate();
        Ok(())
    }

    /// Imports the sample clock from `src`. `None` returns to the onboard clock.
    fn cfg_samp_clk_src(&mut self, card: &str, src: Option<&str>) -> Result<()> {
        self.card(card)?;
        self.backend().set_samp_clk_in(card, src)?;
        self.card_(card)?.sync_().samp_clk_in = src.map(str::to_string);
        self.invalidate();
        Ok(())
    }

    /// Exports the sample clock to `term`. `None` stops exporting.
    fn cfg_samp_clk_out(&mut self, card: &str, term: Option<&str>) -> Result<()> {
        self.card(card)?;
        self.backend().set_samp_clk_out(card, term)?;
        self.card_(card)?.sync_().samp_clk_out = term.map(str::to_string);
        self.invalidate();
        Ok(())
    }

    /// With `export = true` the card becomes the reference clock provider, exporting its onboard
    /// 10 MHz clock to `line` during runs; `rate` must acknowledge 10 MHz.
    /// With `export = false` the card imports its reference clock from `line` at `rate`.
    fn cfg_ref_clk(&mut self, card: &str, line: &str, rate: f64, export: bool) -> Result<()> {
        self.card(card)?;
        if export {
            if rate != REF_CLK_RATE {
                return Err(StreamerError::SyncConfig(format!(
                    "card {card} can only export its 10 MHz reference clock, \
                    acknowledge by setting rate = 1e7 (got {rate})"
                )));
            }
            self.set_ref_clk_provider(Some((card, line)))?;
            let sync = self.card_(card)?.sync_();
            sync.ref_clk_rate = Some(rate);
        } else {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(StreamerError::InvalidRange(format!(
                    "card {card}: reference clock rate must be positive, got {rate}"
                )));
            }
            if let Some((provider, _)) = &self.sync_state().ref_clk_provider {
                if provider == card {
                    return Err(StreamerError::SyncConfig(format!(
                        "card {card} exports the reference clock and cannot also import it"
                    )));
                }
            }
            self.backend().set_ref_clk_in(card, Some(line))?;
            let sync = self.card_(card)?.sync_();
            sync.ref_clk_in = Some(line.to_string());
            sync.ref_clk_rate = Some(rate);
        }
        self.invalidate();
        Ok(())
    }

    /// Stops importing the reference clock on `card`.
    fn clear_ref_clk_in(&mut self, card: &str) -> Result<()> {
        self.card(card)?;
        self.backend().set_ref_clk_in(card, None)?;
        let sync = self.card_(card)?.sync_();
        sync.ref_clk_in = None;
        sync.ref_clk_rate = None;
        Ok(())
    }

    fn set_min_bufwrite_timeout(&mut self, card: &str, timeout: Option<f64>) -> Result<()> {
        self.card(card)?;
        if let Some(timeout) = timeout {
            if !timeout.is_finite() || timeout < 0.0 {
                return Err(StreamerError::InvalidRange(format!(
                    "card {card}: buffer write timeout must be non-negative, got {timeout}"
                )));
            }
        }
        self.backend().set_min_bufwrite_timeout(card, timeout)?;
        self.card_(card)?.sync_().min_bufwrite_timeout = timeout;
        Ok(())
    }

    fn set_starts_last(&mut self, card: Option<&str>) -> Result<()> {
        if let Some(name) = card {
            if !self.cards().contains_key(name) {
                return Err(StreamerError::SyncConfig(format!(
                    "starts_last names unregistered card {name}. Registered cards are {:?}",
                    self.cards().keys().collect::<Vec<_>>()
                )));
            }
        }
        self.sync_state_().starts_last = card.map(str::to_string);
        Ok(())
    }

    fn set_ref_clk_provider(&mut self, provider: Option<(&str, &str)>) -> Result<()> {
        if let Some((name, _)) = provider {
            let card = self.cards().get(name).ok_or_else(|| {
                StreamerError::SyncConfig(format!(
                    "ref_clk_provider names unregistered card {name}. Registered cards are {:?}",
                    self.cards().keys().collect::<Vec<_>>()
                ))
            })?;
            if let Some(src) = &card.sync().ref_clk_in {
                return Err(StreamerError::SyncConfig(format!(
                    "card {name} imports its reference clock from {src} and cannot also export it"
                )));
            }
        }
        // The previous provider no longer drives the 10 MHz line
        let old = self.sync_state().ref_clk_provider.as_ref().map(|(card, _)| card.clone());
        if let Some(old) = old {
            if provider.map_or(true, |(name, _)| name != old) {
                if let Some(card) = self.cards_().get_mut(&old) {
                    card.sync_().ref_clk_rate = None;
                }
            }
        }
        self.sync_state_().ref_clk_provider =
            provider.map(|(card, term)| (card.to_string(), term.to_string()));
        Ok(())
    }

    /// Re-checks the global sync roles against the current registry.
    fn check_sync_state(&self) -> Result<()> {
        let sync = self.sync_state();
        if let Some(name) = &sync.starts_last {
            if !self.cards().contains_key(name) {
                return Err(StreamerError::SyncConfig(format!(
                    "starts_last names unregistered card {name}"
                )));
            }
        }
        if let Some((name, _)) = &sync.ref_clk_provider {
            let card = self.cards().get(name).ok_or_else(|| {
                StreamerError::SyncConfig(format!("ref_clk_provider names unregistered card {name}"))
            })?;
            if card.sync().ref_clk_in.is_some() {
                return Err(StreamerError::SyncConfig(format!(
                    "card {name} both imports and exports the reference clock"
                )));
            }
        }
        Ok(())
    }

    /// Restores the card to "no external sync" defaults and drops its instructions.
    /// The registry entry and sample rate are kept. Resetting twice is the same as once.
    fn reset_card(&mut self, name: &str) -> Result<()> {
        self.card(name)?;
        self.backend().device_reset(name)?;
        self.card_(name)?.reset();
        let sync = self.sync_state_();
        if sync.ref_clk_provider.as_ref().map(|(card, _)| card.as_str()) == Some(name) {
            sync.ref_clk_provider = None;
        }
        self.invalidate();
        Ok(())
    }

    fn reset_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.cards().keys().cloned().collect();
        for name in names {
            self.reset_card(&name)?;
        }
        Ok(())
    }

    // =============== Compilation ===============

    /// Latest instruction end across all cards, each measured on its own clock grid.
    fn last_instr_end_time(&self) -> f64 {
        self.cards()
            .values()
            .map(|card| card.last_instr_end_time())
            .fold(0.0, f64::max)
    }

    fn is_edited(&self) -> bool {
        self.cards().values().any(|card| card.is_edited())
    }

    fn is_fresh_compiled(&self) -> bool {
        self.compiled().is_some() && self.cards().values().all(|card| card.is_fresh_compiled())
    }

    fn compiled_program(&self) -> Result<&CompiledProgram> {
        match self.compiled() {
            Some(program) if self.is_fresh_compiled() => Ok(program),
            _ => Err(StreamerError::NotCompiled(
                "there are edits since the last compile, call compile() first".to_string(),
            )),
        }
    }

    /// Longest card run time of the compiled program, closing-edge ticks included.
    fn total_run_time(&self) -> Result<f64> {
        Ok(self.compiled_program()?.total_run_time())
    }

    /// Resolves all timelines into a [`CompiledProgram`] and returns the global stop time:
    /// the maximum of `stop_time` and every channel's last instruction end time.
    ///
    /// An explicit `stop_time` below the last instruction end is raised to it.
    fn compile(&mut self, stop_time: Option<f64>) -> Result<f64> {
        let mut timer = TickTimer::new();
        self.invalidate();
        let last_end = self.last_instr_end_time();
        let global_stop_time = match stop_time {
            Some(t) if !t.is_finite() || t < 0.0 => {
                return Err(StreamerError::InvalidRange(format!(
                    "stop_time must be non-negative, got {t}"
                )))
            }
            Some(t) if t < last_end => {
                warn!("stop_time = {t} [s] is below the last instruction end {last_end} [s], using the latter");
                last_end
            }
            Some(t) => t,
            None if !self.is_edited() => {
                return Err(StreamerError::NotCompiled(
                    "no channel has any instructions and no stop_time was given".to_string(),
                ))
            }
            None => last_end,
        };

        let mut compiled_cards = IndexMap::new();
        for (name, card) in self.cards_().iter_mut() {
            compiled_cards.insert(name.clone(), card.compile(global_stop_time)?);
        }
        let backend_stop_time = self.backend().compile(Some(global_stop_time))?;
        debug!("backend reports global stop time {backend_stop_time}");

        let program = CompiledProgram::new(compiled_cards, global_stop_time);
        info!(
            "compiled {} cards, global stop time {global_stop_time} [s], total run time {} [s]",
            program.cards().len(),
            program.total_run_time()
        );
        *self.compiled_() = Some(program);
        timer.tick_log("compile");
        Ok(global_stop_time)
    }

    /// Drops all instructions on every channel. Registrations and sync settings stay.
    fn clear_edit_cache(&mut self) -> Result<()> {
        self.backend().clear_edit_cache()?;
        for card in self.cards_().values_mut() {
            card.clear_edit_cache();
        }
        self.invalidate();
        Ok(())
    }

    fn clear_compile_cache(&mut self) {
        self.invalidate()
    }

    fn channel_last_instr_end_time(&self, handle: &ChanHandle) -> Result<f64> {
        Ok(self.chan(handle)?.last_instruction_end_time())
    }

    /// Samples the compiled signal of one channel at `nsamps` evenly spaced points in
    /// `[t_start, t_end)`. `t_start` defaults to `0.0`, `t_end` to the channel's last instruction
    /// end time. Fails with [`StreamerError::NotCompiled`] if there are edits since the last
    /// compile.
    fn calc_signal(
        &self,
        handle: &ChanHandle,
        t_start: Option<f64>,
        t_end: Option<f64>,
        nsamps: usize,
    ) -> Result<Array1<f64>> {
        self.chan(handle)?;
        let compiled_chan = self
            .compiled_program()?
            .chan(handle.card(), handle.chan())?;
        let t_start = t_start.unwrap_or(0.0);
        let t_end = t_end.unwrap_or_else(|| compiled_chan.last_instr_end_time());
        compiled_chan.calc_signal(t_start, t_end, nsamps)
    }
}

/// A macro to implement [`BaseExperiment`] for a struct holding the registry fields
/// `cards`, `sync_state`, `backend` and `compiled`.
///
/// ```rust
/// use std::sync::Arc;
/// use indexmap::IndexMap;
/// use nistreamer_compiler::*;
///
/// struct CustomExperiment {
///     cards: IndexMap<String, Card>,
///     sync_state: SyncState,
///     backend: Arc<dyn StreamBackend>,
///     compiled: Option<CompiledProgram>,
///     some_property: f64,
/// }
/// impl_exp_boilerplate!(CustomExperiment);
/// ```
#[macro_export]
macro_rules! impl_exp_boilerplate {
    ($exp_type: ty) => {
        impl $crate::experiment::BaseExperiment for $exp_type {
            fn cards(&self) -> &indexmap::IndexMap<String, $crate::card::Card> {
                &self.cards
            }
            fn cards_(&mut self) -> &mut indexmap::IndexMap<String, $crate::card::Card> {
                &mut self.cards
            }
            fn sync_state(&self) -> &$crate::experiment::SyncState {
                &self.sync_state
            }
            fn sync_state_(&mut self) -> &mut $crate::experiment::SyncState {
                &mut self.sync_state
            }
            fn backend(&self) -> &std::sync::Arc<dyn $crate::backend::StreamBackend> {
                &self.backend
            }
            fn compiled(&self) -> Option<&$crate::program::CompiledProgram> {
                self.compiled.as_ref()
            }
            fn compiled_(&mut self) -> &mut Option<$crate::program::CompiledProgram> {
                &mut self.compiled
            }
        }
    };
}

/// A concrete registry of cards.
///
/// **Refer to the [`BaseExperiment`] trait for method behavior.**
pub struct Experiment {
    cards: IndexMap<String, Card>,
    sync_state: SyncState,
    backend: Arc<dyn StreamBackend>,
    compiled: Option<CompiledProgram>,
}

impl_exp_boilerplate!(Experiment);

impl Experiment {
    pub fn new(backend: Arc<dyn StreamBackend>) -> Self {
        Self {
            cards: IndexMap::new(),
            sync_state: SyncState::default(),
            backend,
            compiled: None,
        }
    }
}
