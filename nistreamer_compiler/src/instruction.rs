//! Provides definitions and implementations for instruction-related functionalities.
//!
//! ## Main Structures and Enumerations:
//!
//! - [`InstrKind`]: the closed set of output directives (`Constant`, `Sine`, `Ramp`, `GoHigh`,
//!   `GoLow`, `High`, `Low`, `Reset`). Numeric parameters live in one argument struct per kind
//!   ([`ConstArgs`], [`SineArgs`], [`RampArgs`]) with explicit defaults.
//!
//! - [`Instruction`]: an immutable, time-stamped directive. Instructions with `duration = None`
//!   ("go"-instructions) hold until the next instruction on the channel or the end of the run.
//!
//! - [`InstrBook`]: an instruction placed on a channel's clock grid during the editing phase.
//!
//! - [`Waveform`]: the resolved, time-dependent function a compiled segment evaluates.
//!   Waveforms evaluate in-place on `ndarray` views holding time values.

use std::cmp::Ordering;
use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstArgs {
    pub value: f64,
}

/// Sine parameters. `phase` and `dc_offset` default to zero:
///
/// ```
/// use nistreamer_compiler::instruction::SineArgs;
///
/// let args = SineArgs { amp: 1.0, freq: 10.0, ..Default::default() };
/// assert_eq!(args.phase, 0.0);
/// assert_eq!(args.dc_offset, 0.0);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SineArgs {
    pub amp: f64,
    pub freq: f64,
    pub phase: f64,
    pub dc_offset: f64,
}

/// Linear ramp from `start_val` at the instruction start to `end_val` at its end.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RampArgs {
    pub start_val: f64,
    pub end_val: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum InstrKind {
    Constant(ConstArgs),
    Sine(SineArgs),
    Ramp(RampArgs),
    GoHigh,
    GoLow,
    High,
    Low,
    Reset,
}

impl InstrKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstrKind::Constant(_) => "Constant",
            InstrKind::Sine(_) => "Sine",
            InstrKind::Ramp(_) => "Ramp",
            InstrKind::GoHigh => "GoHigh",
            InstrKind::GoLow => "GoLow",
            InstrKind::High => "High",
            InstrKind::Low => "Low",
            InstrKind::Reset => "Reset",
        }
    }

    fn params(&self) -> Vec<f64> {
        match self {
            InstrKind::Constant(args) => vec![args.value],
            InstrKind::Sine(args) => vec![args.amp, args.freq, args.phase, args.dc_offset],
            InstrKind::Ramp(args) => vec![args.start_val, args.end_val],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for InstrKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InstrKind::Constant(args) => write!(f, "Constant(value={})", args.value),
            InstrKind::Sine(args) => write!(
                f,
                "Sine(amp={}, freq={}, phase={}, dc_offset={})",
                args.amp, args.freq, args.phase, args.dc_offset
            ),
            InstrKind::Ramp(args) => {
                write!(f, "Ramp(start_val={}, end_val={})", args.start_val, args.end_val)
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Immutable time-stamped output directive.
///
/// `t_end = t_start + duration` when `duration` is present. `keep_val` only matters for
/// duration instructions: `true` holds the value reached at `t_end` until the next instruction,
/// `false` returns the channel to its default value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instruction {
    pub t_start: f64,
    pub duration: Option<f64>,
    pub keep_val: bool,
    pub kind: InstrKind,
}

impl Instruction {
    pub fn new(t_start: f64, duration: Option<f64>, keep_val: bool, kind: InstrKind) -> Self {
        Self {
            t_start,
            duration,
            keep_val,
            kind,
        }
    }

    pub fn t_end(&self) -> Option<f64> {
        self.duration.map(|dur| self.t_start + dur)
    }

    pub fn is_go(&self) -> bool {
        self.duration.is_none()
    }

    /// Checks the parts of the instruction that do not depend on the channel clock.
    pub fn check_range(&self) -> Result<(), String> {
        if !self.t_start.is_finite() || self.t_start < 0.0 {
            return Err(format!("instruction {self} starts at t={} < 0", self.t_start));
        }
        if let Some(dur) = self.duration {
            if !dur.is_finite() || dur < 0.0 {
                return Err(format!("instruction {self} has negative duration {dur}"));
            }
        }
        if self.kind.params().iter().any(|val| !val.is_finite()) {
            return Err(format!("instruction {self} has non-finite parameters"));
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.duration {
            Some(dur) => write!(
                f,
                "{} at t={} for {} (keep_val={})",
                self.kind, self.t_start, dur, self.keep_val
            ),
            None => write!(f, "{} at t={}", self.kind, self.t_start),
        }
    }
}

/// Instruction placed on the clock grid of a channel.
///
/// `end_pos` is the exclusive end tick; a go-instruction occupies `start_pos..start_pos + 1`.
/// Books are ordered by `(start_pos, seq)`, where `seq` is the insertion number on the channel.
#[derive(Clone, Debug)]
pub struct InstrBook {
    pub start_pos: usize,
    pub end_pos: usize,
    pub seq: usize,
    pub instr: Instruction,
}

impl InstrBook {
    pub fn new(start_pos: usize, end_pos: usize, seq: usize, instr: Instruction) -> Self {
        InstrBook {
            start_pos,
            end_pos,
            seq,
            instr,
        }
    }

    pub fn overlaps(&self, other: &InstrBook) -> bool {
        self.start_pos < other.end_pos && other.start_pos < self.end_pos
    }
}

impl Ord for InstrBook {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_pos
            .cmp(&other.start_pos)
            .then(self.seq.cmp(&other.seq))
    }
}
impl PartialOrd for InstrBook {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for InstrBook {
    fn eq(&self, other: &Self) -> bool {
        self.start_pos == other.start_pos && self.seq == other.seq
    }
}
impl Eq for InstrBook {}

impl fmt::Display for InstrBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstrBook({}, {}-{})", self.instr, self.start_pos, self.end_pos)
    }
}

/// Resolved function of a compiled segment. Times are absolute, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Waveform {
    Const(f64),
    Sine { args: SineArgs, t0: f64 },
    Ramp { args: RampArgs, t0: f64, t1: f64 },
}

impl Waveform {
    pub fn eval_point(&self, t: f64) -> f64 {
        match *self {
            Waveform::Const(value) => value,
            Waveform::Sine { args, t0 } => {
                args.dc_offset + args.amp * (2.0 * PI * args.freq * (t - t0) + args.phase).sin()
            }
            Waveform::Ramp { args, t0, t1 } => {
                if t1 <= t0 {
                    return args.end_val;
                }
                args.start_val + (args.end_val - args.start_val) * (t - t0) / (t1 - t0)
            }
        }
    }

    /// Replaces the time values held by `t_arr` with the waveform evaluated at those times.
    ///
    /// ```
    /// use nistreamer_compiler::instruction::*;
    ///
    /// let mut t_arr = ndarray::Array1::linspace(0.0, 1.0, 5);
    /// let ramp = Waveform::Ramp { args: RampArgs { start_val: 0.0, end_val: 2.0 }, t0: 0.0, t1: 1.0 };
    /// ramp.eval_inplace(&mut t_arr.view_mut());
    /// assert_eq!(t_arr[4], 2.0);
    /// ```
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>) {
        match self {
            Waveform::Const(value) => t_arr.fill(*value),
            _ => t_arr.map_inplace(|t| *t = self.eval_point(*t)),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::instruction::*;

    #[test]
    fn check_range_rejects_negative_values() {
        let neg_start = Instruction::new(-0.1, Some(1.0), false, InstrKind::High);
        assert!(neg_start.check_range().is_err());

        let neg_dur = Instruction::new(0.0, Some(-1.0), false, InstrKind::High);
        assert!(neg_dur.check_range().is_err());

        let nan_val = Instruction::new(
            0.0,
            Some(1.0),
            false,
            InstrKind::Constant(ConstArgs { value: f64::NAN }),
        );
        assert!(nan_val.check_range().is_err());

        let go = Instruction::new(0.0, None, false, InstrKind::GoHigh);
        assert!(go.check_range().is_ok());
    }

    #[test]
    fn sine_is_relative_to_instruction_start() {
        let args = SineArgs {
            amp: 2.0,
            freq: 1.0,
            phase: 0.0,
            dc_offset: 1.0,
        };
        let sine = Waveform::Sine { args, t0: 3.0 };
        assert!((sine.eval_point(3.0) - 1.0).abs() < 1e-12);
        assert!((sine.eval_point(3.25) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn sine_args_defaults_from_json() {
        let args: SineArgs = serde_json::from_str(r#"{"amp": 1.5, "freq": 7.0}"#).unwrap();
        assert_eq!(
            args,
            SineArgs {
                amp: 1.5,
                freq: 7.0,
                phase: 0.0,
                dc_offset: 0.0
            }
        );
    }

    #[test]
    fn books_order_by_start_then_insertion() {
        let instr = Instruction::new(0.0, None, false, InstrKind::GoLow);
        let a = InstrBook::new(10, 11, 1, instr);
        let b = InstrBook::new(10, 11, 0, instr);
        let c = InstrBook::new(5, 6, 2, instr);
        let mut books = vec![a.clone(), b.clone(), c.clone()];
        books.sort();
        assert_eq!(books, vec![c, b, a]);
    }
}
