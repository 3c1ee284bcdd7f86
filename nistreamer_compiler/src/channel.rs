//! Per-channel instruction timelines.
//!
//! A [`ChannelTimeline`] owns the ordered, non-overlapping [`InstrBook`]s of one physical output
//! channel. Instructions are placed on the channel's clock grid when they are added, so overlap is
//! decided in clock ticks, the same resolution the hardware generates samples at.
//!
//! Channel behavior that differs between analog, digital and inverted digital lines is kept in the
//! closed [`ChannelKind`] set and reached through the [`OutputCapability`] trait.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::*;
use crate::instruction::*;
use crate::program::CompiledChannel;
use crate::utils::time_to_tick;

/// Capabilities that distinguish channel kinds.
pub trait OutputCapability {
    /// Physical level held before the first instruction, given the registered default.
    fn default_value(&self, registered: f64) -> f64;
    /// Physical level corresponding to the logical "on"/"off" state.
    fn go_state(&self, on: bool) -> f64;
    /// Resolves an instruction into the waveform the channel generates for it.
    /// Returns `None` if the channel cannot generate this instruction kind.
    fn emit(&self, instr: &Instruction, default_value: f64) -> Option<Waveform>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    AnalogOut,
    DigitalOut,
    InvertedDigitalOut,
}

impl ChannelKind {
    pub fn is_digital(&self) -> bool {
        !matches!(self, ChannelKind::AnalogOut)
    }
}

impl OutputCapability for ChannelKind {
    fn default_value(&self, registered: f64) -> f64 {
        match self {
            ChannelKind::AnalogOut => registered,
            ChannelKind::DigitalOut => (registered != 0.0) as u8 as f64,
            // Registered default is the logical state, the line idles at its complement
            ChannelKind::InvertedDigitalOut => (registered == 0.0) as u8 as f64,
        }
    }

    fn go_state(&self, on: bool) -> f64 {
        match self {
            ChannelKind::AnalogOut | ChannelKind::DigitalOut => on as u8 as f64,
            ChannelKind::InvertedDigitalOut => !on as u8 as f64,
        }
    }

    fn emit(&self, instr: &Instruction, default_value: f64) -> Option<Waveform> {
        let func = match (self.is_digital(), instr.kind) {
            (_, InstrKind::Reset) => Waveform::Const(default_value),
            (false, InstrKind::Constant(args)) => Waveform::Const(args.value),
            (false, InstrKind::Sine(args)) => Waveform::Sine {
                args,
                t0: instr.t_start,
            },
            (false, InstrKind::Ramp(args)) => Waveform::Ramp {
                args,
                t0: instr.t_start,
                t1: instr.t_end().unwrap_or(instr.t_start),
            },
            (true, InstrKind::High | InstrKind::GoHigh) => Waveform::Const(1.0),
            (true, InstrKind::Low | InstrKind::GoLow) => Waveform::Const(0.0),
            _ => return None,
        };
        Some(func)
    }
}

pub struct ChannelTimeline {
    name: String,
    kind: ChannelKind,
    samp_rate: f64,
    default_value: f64,
    nickname: Option<String>,
    instr_list: BTreeSet<InstrBook>,
    next_seq: usize,
    fresh_compiled: bool,
}

impl ChannelTimeline {
    /// `default_value` is the registered default: a level for analog channels and the logical
    /// state (`0.0`/`1.0`) for digital ones.
    pub fn new(name: &str, kind: ChannelKind, samp_rate: f64, default_value: f64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            samp_rate,
            default_value,
            nickname: None,
            instr_list: BTreeSet::new(),
            next_seq: 0,
            fresh_compiled: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }
    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }
    pub fn registered_default(&self) -> f64 {
        self.default_value
    }
    /// Physical level the channel holds where nothing else is defined.
    pub fn default_value(&self) -> f64 {
        self.kind.default_value(self.default_value)
    }
    /// Display name: the nickname if one was given, the physical name otherwise.
    pub fn nickname(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.name)
    }
    pub fn set_nickname(&mut self, nickname: Option<&str>) {
        self.nickname = nickname.map(str::to_string);
    }
    pub fn instr_list(&self) -> &BTreeSet<InstrBook> {
        &self.instr_list
    }
    pub fn is_edited(&self) -> bool {
        !self.instr_list.is_empty()
    }
    pub fn is_fresh_compiled(&self) -> bool {
        self.fresh_compiled
    }

    pub fn last_instr_end_pos(&self) -> usize {
        self.instr_list.last().map_or(0, |book| book.end_pos)
    }

    /// End time of the latest-ending instruction on the clock grid, `0.0` if empty.
    pub fn last_instruction_end_time(&self) -> f64 {
        self.last_instr_end_pos() as f64 / self.samp_rate
    }

    /// Places `instr` on the clock grid and validates it against the existing timeline
    /// without modifying anything.
    pub fn check(&self, instr: Instruction) -> Result<InstrBook> {
        instr
            .check_range()
            .map_err(|msg| StreamerError::InvalidRange(format!("channel {}: {msg}", self.name)))?;

        let out_of_range = || {
            StreamerError::InvalidRange(format!(
                "channel {}: instruction {instr} does not fit on the clock grid at samp_rate {}",
                self.name, self.samp_rate
            ))
        };
        let start_pos = time_to_tick(instr.t_start, self.samp_rate).ok_or_else(out_of_range)?;
        let end_pos = match instr.t_end() {
            Some(t_end) => time_to_tick(t_end, self.samp_rate),
            None => start_pos.checked_add(1),
        }
        .ok_or_else(out_of_range)?;
        if end_pos <= start_pos {
            return Err(StreamerError::InvalidRange(format!(
                "channel {}: instruction {instr} spans zero clock ticks at samp_rate {}",
                self.name, self.samp_rate
            )));
        }
        let new_book = InstrBook::new(start_pos, end_pos, self.next_seq, instr);

        let next = self.instr_list.range(&new_book..).next();
        let prev = self.instr_list.range(..&new_book).next_back();
        for existing in [prev, next].into_iter().flatten() {
            if existing.overlaps(&new_book) {
                return Err(StreamerError::Overlap {
                    chan: self.name.clone(),
                    new: new_book.to_string(),
                    existing: existing.to_string(),
                });
            }
        }
        Ok(new_book)
    }

    /// Commits a book produced by [`ChannelTimeline::check`].
    pub fn insert(&mut self, book: InstrBook) {
        debug!("channel {}: adding {}", self.name, book);
        self.next_seq = self.next_seq.max(book.seq) + 1;
        self.fresh_compiled = false;
        self.instr_list.insert(book);
    }

    pub fn add(&mut self, instr: Instruction) -> Result<()> {
        let book = self.check(instr)?;
        self.insert(book);
        Ok(())
    }

    /// Drops all instructions. Calling it on an empty timeline is a no-op.
    pub fn clear(&mut self) {
        if self.instr_list.is_empty() {
            return;
        }
        self.instr_list.clear();
        self.fresh_compiled = false;
    }

    /// Re-checks the non-overlap invariant over the whole timeline.
    pub fn validate(&self) -> Result<()> {
        let books: Vec<&InstrBook> = self.instr_list.iter().collect();
        for pair in books.windows(2) {
            if pair[0].overlaps(pair[1]) {
                return Err(StreamerError::Overlap {
                    chan: self.name.clone(),
                    new: pair[1].to_string(),
                    existing: pair[0].to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn ends_at(&self, stop_tick: usize) -> bool {
        self.instr_list
            .last()
            .map_or(false, |book| !book.instr.is_go() && book.end_pos == stop_tick)
    }

    /// Pads and merges the timeline into a continuous segment list ending at `stop_pos`.
    ///
    /// - Before the first instruction the channel holds its default value.
    /// - After a duration instruction it holds the value reached at `t_end` (`keep_val = true`)
    ///   or returns to the default value (`keep_val = false`).
    /// - Go-instructions extend to the next instruction or to `stop_pos`.
    /// - Equal neighbouring segments are merged.
    pub fn compile(&mut self, stop_pos: usize) -> Result<CompiledChannel> {
        if self.last_instr_end_pos() > stop_pos {
            return Err(StreamerError::InvalidRange(format!(
                "channel {}: compiling with stop_pos {stop_pos} while instructions end at {}",
                self.name,
                self.last_instr_end_pos()
            )));
        }
        let default = self.default_value();
        let mut last_val = default;
        let mut last_end = 0;
        let mut instr_end: Vec<usize> = Vec::new();
        let mut instr_val: Vec<Waveform> = Vec::new();

        let books: Vec<&InstrBook> = self.instr_list.iter().collect();
        for (i, book) in books.iter().enumerate() {
            if last_end < book.start_pos {
                instr_val.push(Waveform::Const(last_val));
                instr_end.push(book.start_pos);
            }
            let func = self.kind.emit(&book.instr, default).ok_or_else(|| {
                StreamerError::InvalidRange(format!(
                    "channel {}: cannot generate {}",
                    self.name, book.instr.kind
                ))
            })?;
            let end_pos = match book.instr.t_end() {
                Some(t_end) => {
                    last_val = if book.instr.keep_val {
                        func.eval_point(t_end)
                    } else {
                        default
                    };
                    book.end_pos
                }
                None => books.get(i + 1).map_or(stop_pos, |next| next.start_pos),
            };
            instr_val.push(func);
            instr_end.push(end_pos);
            last_end = end_pos;
        }
        if last_end < stop_pos || instr_end.is_empty() {
            instr_val.push(Waveform::Const(last_val));
            instr_end.push(stop_pos);
        }

        let mut ends: Vec<usize> = Vec::with_capacity(instr_end.len());
        let mut fns: Vec<Waveform> = Vec::with_capacity(instr_val.len());
        for (end, func) in instr_end.into_iter().zip(instr_val) {
            if fns.last() == Some(&func) {
                if let Some(last_end) = ends.last_mut() {
                    *last_end = end;
                }
            } else {
                fns.push(func);
                ends.push(end);
            }
        }
        self.fresh_compiled = true;
        Ok(CompiledChannel::new(
            self.samp_rate,
            ends,
            fns,
            self.is_edited(),
            self.last_instruction_end_time(),
        ))
    }
}

#[cfg(test)]
mod test {
    use crate::channel::*;

    fn constant(t: f64, dur: f64, value: f64) -> Instruction {
        Instruction::new(t, Some(dur), false, InstrKind::Constant(ConstArgs { value }))
    }

    #[test]
    fn ticks_beyond_usize_are_rejected() {
        let mut chan = ChannelTimeline::new("port0/line0", ChannelKind::DigitalOut, 10.0, 0.0);
        let go_high = Instruction::new(1e300, None, false, InstrKind::High);
        assert!(matches!(chan.add(go_high), Err(StreamerError::InvalidRange(_))));
        assert!(matches!(
            chan.add(constant(0.0, 1e300, 1.0)),
            Err(StreamerError::InvalidRange(_))
        ));
        assert!(!chan.is_edited());
    }

    #[test]
    fn non_overlapping_in_any_order() {
        let mut chan = ChannelTimeline::new("ao0", ChannelKind::AnalogOut, 1e3, 0.0);
        chan.add(constant(2.0, 1.0, 3.0)).unwrap();
        chan.add(constant(0.0, 1.0, 1.0)).unwrap();
        chan.add(constant(1.0, 1.0, 2.0)).unwrap();
        let starts: Vec<usize> = chan.instr_list().iter().map(|b| b.start_pos).collect();
        assert_eq!(starts, vec![0, 1000, 2000]);
        assert_eq!(chan.last_instruction_end_time(), 3.0);
    }

    #[test]
    fn overlap_leaves_timeline_unchanged() {
        let mut chan = ChannelTimeline::new("ao0", ChannelKind::AnalogOut, 1e3, 0.0);
        chan.add(constant(0.0, 1.0, 1.0)).unwrap();
        let before: Vec<String> = chan.instr_list().iter().map(|b| b.to_string()).collect();

        let err = chan.add(constant(0.5, 1.0, 2.0)).unwrap_err();
        assert!(matches!(err, StreamerError::Overlap { .. }));
        // Starting before and ending inside is an overlap too
        let go_inside = Instruction::new(0.999, None, false, InstrKind::Reset);
        assert!(matches!(chan.add(go_inside), Err(StreamerError::Overlap { .. })));

        let after: Vec<String> = chan.instr_list().iter().map(|b| b.to_string()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn zero_tick_instruction_rejected() {
        let mut chan = ChannelTimeline::new("ao0", ChannelKind::AnalogOut, 10.0, 0.0);
        let err = chan.add(constant(0.0, 0.01, 1.0)).unwrap_err();
        assert!(matches!(err, StreamerError::InvalidRange(_)));
        assert!(!chan.is_edited());
    }

    #[test]
    fn clear_is_idempotent() {
        let mut chan = ChannelTimeline::new("ao0", ChannelKind::AnalogOut, 10.0, 0.0);
        chan.add(constant(0.0, 1.0, 1.0)).unwrap();
        chan.clear();
        chan.clear();
        assert!(!chan.is_edited());
        assert_eq!(chan.last_instruction_end_time(), 0.0);
    }

    #[test]
    fn compile_pads_and_merges() {
        let mut chan = ChannelTimeline::new("ao0", ChannelKind::AnalogOut, 10.0, -1.0);
        chan.add(constant(1.0, 1.0, 2.0)).unwrap();
        chan.add(Instruction::new(
            2.0,
            Some(1.0),
            true,
            InstrKind::Ramp(RampArgs {
                start_val: 0.0,
                end_val: 4.0,
            }),
        ))
        .unwrap();
        let compiled = chan.compile(50).unwrap();
        assert_eq!(compiled.ends(), &vec![10, 20, 30, 50]);
        assert_eq!(compiled.fns()[0], Waveform::Const(-1.0));
        assert_eq!(compiled.fns()[1], Waveform::Const(2.0));
        // keep_val holds the ramp end value
        assert_eq!(compiled.fns()[3], Waveform::Const(4.0));
        assert!(chan.is_fresh_compiled());
    }

    #[test]
    fn go_instruction_holds_until_next() {
        let mut chan = ChannelTimeline::new("port0/line0", ChannelKind::DigitalOut, 10.0, 0.0);
        chan.add(Instruction::new(1.0, None, false, InstrKind::GoHigh)).unwrap();
        chan.add(Instruction::new(3.0, None, false, InstrKind::GoLow)).unwrap();
        let compiled = chan.compile(50).unwrap();
        assert_eq!(compiled.ends(), &vec![10, 30, 50]);
        assert_eq!(
            compiled.fns(),
            &vec![Waveform::Const(0.0), Waveform::Const(1.0), Waveform::Const(0.0)]
        );
    }

    #[test]
    fn inverted_line_idles_at_complement() {
        let kind = ChannelKind::InvertedDigitalOut;
        assert_eq!(kind.default_value(0.0), 1.0);
        assert_eq!(kind.go_state(true), 0.0);
        let sine = Instruction::new(
            0.0,
            Some(1.0),
            false,
            InstrKind::Sine(SineArgs::default()),
        );
        assert!(kind.emit(&sine, 1.0).is_none());
    }

    #[test]
    fn empty_channel_compiles_inactive() {
        let mut chan = ChannelTimeline::new("ao1", ChannelKind::AnalogOut, 10.0, 0.5);
        let compiled = chan.compile(20).unwrap();
        assert!(!compiled.is_active());
        assert_eq!(compiled.ends(), &vec![20]);
        assert_eq!(compiled.fns(), &vec![Waveform::Const(0.5)]);
    }
}
