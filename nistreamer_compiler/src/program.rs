//! Read-only compiled snapshot and the signal evaluator.
//!
//! A [`CompiledChannel`] is a continuous list of segments: segment `i` spans clock ticks
//! `ends[i-1]..ends[i]` (the first one starts at tick 0) and generates `fns[i]`.
//! Signal evaluation is a pure function of the snapshot, so repeated queries with identical
//! arguments return identical samples.

use indexmap::IndexMap;
use ndarray::{s, Array1};

use crate::error::*;
use crate::instruction::Waveform;

// Slack when mapping a time onto the clock grid, in ticks
const TICK_TOL: f64 = 1e-6;

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledChannel {
    samp_rate: f64,
    ends: Vec<usize>,
    fns: Vec<Waveform>,
    active: bool,
    last_instr_end_time: f64,
}

impl CompiledChannel {
    pub fn new(
        samp_rate: f64,
        ends: Vec<usize>,
        fns: Vec<Waveform>,
        active: bool,
        last_instr_end_time: f64,
    ) -> Self {
        Self {
            samp_rate,
            ends,
            fns,
            active,
            last_instr_end_time,
        }
    }

    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }
    pub fn ends(&self) -> &Vec<usize> {
        &self.ends
    }
    pub fn fns(&self) -> &Vec<Waveform> {
        &self.fns
    }
    /// `false` for channels that had no instructions and only hold their default value.
    pub fn is_active(&self) -> bool {
        self.active
    }
    pub fn last_instr_end_time(&self) -> f64 {
        self.last_instr_end_time
    }
    pub fn stop_time(&self) -> f64 {
        self.ends.last().map_or(0.0, |&end| end as f64 / self.samp_rate)
    }

    // Index of the segment generating tick position `pos`
    fn segment_at(&self, pos: f64) -> usize {
        let idx = self.ends.partition_point(|&end| end as f64 <= pos + TICK_TOL);
        idx.min(self.ends.len().saturating_sub(1))
    }

    pub fn eval_point(&self, t: f64) -> f64 {
        match self.fns.get(self.segment_at(t * self.samp_rate)) {
            Some(func) => func.eval_point(t),
            None => 0.0,
        }
    }

    /// Replaces ascending time values in `t_arr` with the signal at those times.
    pub fn fill_signal(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>) {
        let nsamps = t_arr.len();
        if nsamps == 0 || self.fns.is_empty() {
            return;
        }
        let last_seg = self.fns.len() - 1;
        let mut cur = 0;
        for seg in self.segment_at(t_arr[0] * self.samp_rate)..=last_seg {
            let mut stop = cur;
            if seg == last_seg {
                stop = nsamps;
            } else {
                let end = self.ends[seg] as f64;
                while stop < nsamps && t_arr[stop] * self.samp_rate + TICK_TOL < end {
                    stop += 1;
                }
            }
            self.fns[seg].eval_inplace(&mut t_arr.slice_mut(s![cur..stop]));
            cur = stop;
            if cur == nsamps {
                break;
            }
        }
    }

    /// Samples the signal at `nsamps` evenly spaced points in `[t_start, t_end)`.
    pub fn calc_signal(&self, t_start: f64, t_end: f64, nsamps: usize) -> Result<Array1<f64>> {
        if !(t_start.is_finite() && t_end.is_finite()) || t_start < 0.0 || t_end < t_start {
            return Err(StreamerError::InvalidRange(format!(
                "cannot sample interval [{t_start}, {t_end})"
            )));
        }
        if t_end * self.samp_rate > *self.ends.last().unwrap_or(&0) as f64 + TICK_TOL {
            return Err(StreamerError::InvalidRange(format!(
                "t_end = {t_end} exceeds the compiled run which stops at {}",
                self.stop_time()
            )));
        }
        let dt = (t_end - t_start) / nsamps.max(1) as f64;
        let mut signal = Array1::from_shape_fn(nsamps, |i| t_start + i as f64 * dt);
        self.fill_signal(&mut signal.view_mut());
        Ok(signal)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledCard {
    samp_rate: f64,
    total_samps: usize,
    channels: IndexMap<String, CompiledChannel>,
}

impl CompiledCard {
    pub fn new(
        samp_rate: f64,
        total_samps: usize,
        channels: IndexMap<String, CompiledChannel>,
    ) -> Self {
        Self {
            samp_rate,
            total_samps,
            channels,
        }
    }
    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }
    /// Number of samples the card generates per repetition, closing-edge tick included.
    pub fn total_samps(&self) -> usize {
        self.total_samps
    }
    pub fn total_run_time(&self) -> f64 {
        self.total_samps as f64 / self.samp_rate
    }
    pub fn channels(&self) -> &IndexMap<String, CompiledChannel> {
        &self.channels
    }
    pub fn is_active(&self) -> bool {
        self.channels.values().any(|chan| chan.is_active())
    }
}

/// Snapshot produced by a successful compile. Dropped by any later edit.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledProgram {
    cards: IndexMap<String, CompiledCard>,
    global_stop_time: f64,
}

impl CompiledProgram {
    pub fn new(cards: IndexMap<String, CompiledCard>, global_stop_time: f64) -> Self {
        Self {
            cards,
            global_stop_time,
        }
    }
    pub fn global_stop_time(&self) -> f64 {
        self.global_stop_time
    }
    pub fn cards(&self) -> &IndexMap<String, CompiledCard> {
        &self.cards
    }
    /// Names of cards with at least one channel carrying instructions.
    pub fn active_cards(&self) -> Vec<String> {
        self.cards
            .iter()
            .filter(|(_, card)| card.is_active())
            .map(|(name, _)| name.clone())
            .collect()
    }
    pub fn total_run_time(&self) -> f64 {
        self.cards
            .values()
            .map(|card| card.total_run_time())
            .fold(0.0, f64::max)
    }

    pub fn chan(&self, card: &str, chan: &str) -> Result<&CompiledChannel> {
        let compiled_card = self.cards.get(card).ok_or_else(|| StreamerError::UnknownCard {
            name: card.to_string(),
            registered: self.cards.keys().cloned().collect(),
        })?;
        compiled_card
            .channels
            .get(chan)
            .ok_or_else(|| StreamerError::UnknownChannel {
                card: card.to_string(),
                chan: chan.to_string(),
                registered: compiled_card.channels.keys().cloned().collect(),
            })
    }
}

#[cfg(test)]
mod test {
    use crate::instruction::*;
    use crate::program::*;

    fn two_level() -> CompiledChannel {
        CompiledChannel::new(
            1e6,
            vec![1_000_000, 2_000_000],
            vec![Waveform::Const(5.0), Waveform::Const(0.0)],
            true,
            2.0,
        )
    }

    #[test]
    fn samples_are_end_exclusive() {
        let sig = two_level().calc_signal(0.0, 2.0, 2).unwrap();
        assert_eq!(sig.to_vec(), vec![5.0, 0.0]);
    }

    #[test]
    fn rejects_range_past_stop() {
        let chan = two_level();
        assert!(matches!(
            chan.calc_signal(0.0, 2.5, 10),
            Err(StreamerError::InvalidRange(_))
        ));
        assert!(matches!(
            chan.calc_signal(1.0, 0.5, 10),
            Err(StreamerError::InvalidRange(_))
        ));
    }

    #[test]
    fn fill_starts_mid_program() {
        let chan = CompiledChannel::new(
            10.0,
            vec![10, 20, 30],
            vec![
                Waveform::Const(1.0),
                Waveform::Ramp {
                    args: RampArgs {
                        start_val: 0.0,
                        end_val: 10.0,
                    },
                    t0: 1.0,
                    t1: 2.0,
                },
                Waveform::Const(-1.0),
            ],
            true,
            2.0,
        );
        let sig = chan.calc_signal(1.5, 2.5, 4).unwrap();
        assert_eq!(sig.len(), 4);
        assert!((sig[0] - 5.0).abs() < 1e-9);
        assert!((sig[1] - 7.5).abs() < 1e-9);
        assert_eq!(sig[2], -1.0);
        assert_eq!(sig[3], -1.0);
        assert_eq!(chan.eval_point(0.3), 1.0);
    }
}
