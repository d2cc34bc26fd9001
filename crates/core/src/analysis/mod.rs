use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{LightsError, Result};

/// Width of a raw magnitude frame.
pub const SPECTRUM_POINTS: usize = 256;
/// Number of reduced bands.
pub const NUM_BANDS: usize = 16;
/// PCM samples consumed per analysed frame.
pub const FFT_SIZE: usize = SPECTRUM_POINTS * 2;

/// Band partition over the raw spectrum, roughly one step per musical
/// interval. Band `i` covers `BAND_EDGES[i]..BAND_EDGES[i + 1]`.
const BAND_EDGES: [usize; NUM_BANDS + 1] = [
    0, 1, 2, 3, 5, 7, 10, 14, 20, 28, 40, 54, 74, 101, 137, 187, 255,
];
const MAGNITUDE_SHIFT: u32 = 7;

/// Reduced magnitude per band.
pub type Bands = [u8; NUM_BANDS];

/// One raw magnitude spectrum as delivered by the host.
#[derive(Clone, PartialEq, Eq)]
pub struct SpectrumFrame {
    magnitudes: [i16; SPECTRUM_POINTS],
}

impl SpectrumFrame {
    pub fn new(magnitudes: [i16; SPECTRUM_POINTS]) -> Self {
        Self { magnitudes }
    }

    /// Builds a frame from an arbitrary slice, truncating or zero padding it
    /// to [`SPECTRUM_POINTS`].
    pub fn from_slice(values: &[i16]) -> Self {
        let mut frame = Self::default();
        let len = values.len().min(SPECTRUM_POINTS);
        frame.magnitudes[..len].copy_from_slice(&values[..len]);
        frame
    }

    pub fn magnitudes(&self) -> &[i16; SPECTRUM_POINTS] {
        &self.magnitudes
    }

    pub fn set(&mut self, index: usize, value: i16) {
        if let Some(slot) = self.magnitudes.get_mut(index) {
            *slot = value;
        }
    }
}

impl Default for SpectrumFrame {
    fn default() -> Self {
        Self {
            magnitudes: [0; SPECTRUM_POINTS],
        }
    }
}

impl fmt::Debug for SpectrumFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peak = self.magnitudes.iter().copied().max().unwrap_or(0);
        f.debug_struct("SpectrumFrame").field("peak", &peak).finish()
    }
}

/// Folds a raw frame into [`NUM_BANDS`] log-scaled bands.
///
/// Each band takes the peak raw magnitude of its range, drops the low
/// [`MAGNITUDE_SHIFT`] bits and maps the result onto `0..=255` with a
/// logarithmic curve. Silence stays at zero.
pub fn reduce_spectrum(frame: &SpectrumFrame) -> Bands {
    let mut bands = [0u8; NUM_BANDS];
    for (band, edges) in bands.iter_mut().zip(BAND_EDGES.windows(2)) {
        let peak = frame.magnitudes[edges[0]..edges[1]]
            .iter()
            .map(|&value| i32::from(value))
            .fold(0, i32::max);
        *band = log_remap(peak);
    }
    bands
}

fn log_remap(peak: i32) -> u8 {
    let compressed = peak >> MAGNITUDE_SHIFT;
    if compressed <= 0 {
        return 0;
    }
    let scaled = f64::from(compressed).ln() * (256.0 / 256f64.ln());
    scaled.min(255.0) as u8
}

/// Per-band state carried between cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandState {
    pub current: u8,
    pub previous: u8,
    /// `|previous - current|`, the trigger signal.
    pub difference: u8,
    /// Activity accumulated over the current recalibration window.
    pub running_average: f64,
}

/// Current/previous band values, their differences and the smoothed overall
/// activity level.
#[derive(Debug, Clone)]
pub struct BandHistory {
    bands: [BandState; NUM_BANDS],
    window_len: usize,
    running_avg_difference: f64,
}

impl BandHistory {
    pub fn new(window_len: usize) -> Self {
        Self {
            bands: [BandState::default(); NUM_BANDS],
            window_len: window_len.max(1),
            running_avg_difference: 0.0,
        }
    }

    /// Shifts `current` into `previous`, stores the new values, recomputes
    /// the differences and folds their sum into the running average.
    /// Returns the summed difference of this cycle.
    pub fn update(&mut self, reduced: &Bands) -> u32 {
        let mut difference_sum = 0u32;
        let weight = 1.0 / self.window_len as f64;

        for (state, &value) in self.bands.iter_mut().zip(reduced) {
            state.previous = state.current;
            state.current = value;
            state.difference = state.previous.abs_diff(value);
            state.running_average += weight * f64::from(value);
            difference_sum += u32::from(state.difference);
        }

        self.running_avg_difference =
            0.99 * self.running_avg_difference + 0.01 * f64::from(difference_sum);
        difference_sum
    }

    pub fn difference(&self, band: usize) -> u8 {
        self.bands.get(band).map_or(0, |state| state.difference)
    }

    pub fn running_avg_difference(&self) -> f64 {
        self.running_avg_difference
    }

    pub fn running_averages(&self) -> [f64; NUM_BANDS] {
        std::array::from_fn(|band| self.bands[band].running_average)
    }

    pub fn reset_running_averages(&mut self) {
        for state in &mut self.bands {
            state.running_average = 0.0;
        }
    }

    pub fn bands(&self) -> &[BandState; NUM_BANDS] {
        &self.bands
    }
}

/// Turns PCM blocks into [`SpectrumFrame`]s, standing in for the spectrum a
/// media player would hand to a visualisation plugin.
pub struct SpectrumAnalyzer {
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    window: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(FFT_SIZE);
        let input = plan.make_input_vec();
        let spectrum = plan.make_output_vec();
        let scratch = plan.make_scratch_vec();
        let window = (0..FFT_SIZE).map(|index| hann_value(index, FFT_SIZE)).collect();
        Self {
            plan,
            input,
            spectrum,
            scratch,
            window,
        }
    }

    /// Analyses one block of mono samples in `-1.0..=1.0`. Shorter blocks are
    /// zero padded; only the first [`FFT_SIZE`] samples of longer ones count.
    pub fn analyze(&mut self, samples: &[f32]) -> Result<SpectrumFrame> {
        self.input.fill(0.0);
        for ((slot, sample), weight) in self.input.iter_mut().zip(samples).zip(&self.window) {
            *slot = sample * weight;
        }

        self.plan
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .map_err(|err| LightsError::msg(format!("fft failed: {err}")))?;

        // Full-scale sine through a Hann window peaks at FFT_SIZE / 4.
        let norm = 4.0 / FFT_SIZE as f32;
        let mut frame = SpectrumFrame::default();
        for (slot, bin) in frame.magnitudes.iter_mut().zip(self.spectrum.iter().skip(1)) {
            let amplitude = (bin.norm() * norm).clamp(0.0, 1.0);
            *slot = (amplitude * f32::from(i16::MAX)) as i16;
        }
        Ok(frame)
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("fft_size", &FFT_SIZE)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_reduces_to_zero() {
        assert_eq!(reduce_spectrum(&SpectrumFrame::default()), [0; NUM_BANDS]);
    }

    #[test]
    fn reduction_takes_band_peak_and_log_scales() {
        let mut frame = SpectrumFrame::default();
        // band 3 covers raw indices 3 and 4
        frame.set(3, 100);
        frame.set(4, 384);
        frame.set(200, i16::MAX);

        let bands = reduce_spectrum(&frame);
        // 384 >> 7 == 3, 32 * log2(3) == 50.7
        assert_eq!(bands[3], 50);
        assert_eq!(bands[15], 255);
        assert_eq!(bands[0], 0);
    }

    #[test]
    fn values_below_shift_vanish() {
        let mut frame = SpectrumFrame::default();
        frame.set(0, 127);
        frame.set(1, 255);
        frame.set(2, -500);
        let bands = reduce_spectrum(&frame);
        assert_eq!(bands[0], 0);
        // 255 >> 7 == 1 and ln(1) == 0
        assert_eq!(bands[1], 0);
        assert_eq!(bands[2], 0);
    }

    #[test]
    fn reduction_is_deterministic() {
        let values: Vec<i16> = (0..SPECTRUM_POINTS as i16).map(|i| i * 97).collect();
        let frame = SpectrumFrame::from_slice(&values);
        assert_eq!(reduce_spectrum(&frame), reduce_spectrum(&frame.clone()));
    }

    #[test]
    fn history_tracks_differences_and_average() {
        let mut history = BandHistory::new(150);
        let mut first = [0u8; NUM_BANDS];
        first[3] = 50;
        assert_eq!(history.update(&first), 50);
        assert_eq!(history.difference(3), 50);
        assert!((history.running_avg_difference() - 0.5).abs() < 1e-9);

        let mut second = [0u8; NUM_BANDS];
        second[3] = 20;
        history.update(&second);
        let state = history.bands()[3];
        assert_eq!((state.previous, state.current, state.difference), (50, 20, 30));
        assert!((state.running_average - 70.0 / 150.0).abs() < 1e-9);

        history.reset_running_averages();
        assert!(history.running_averages().iter().all(|&avg| avg == 0.0));
        assert_eq!(history.difference(99), 0);
    }

    #[test]
    fn analyzer_places_a_tone_in_the_expected_band() {
        let mut analyzer = SpectrumAnalyzer::new();
        // bin 8 lands on raw index 7, inside band 5
        let samples: Vec<f32> = (0..FFT_SIZE)
            .map(|n| (2.0 * PI * 8.0 * n as f32 / FFT_SIZE as f32).sin())
            .collect();
        let frame = analyzer.analyze(&samples).unwrap();
        let bands = reduce_spectrum(&frame);

        let loudest = (0..NUM_BANDS).max_by_key(|&band| bands[band]).unwrap();
        assert_eq!(loudest, 5);
        assert!(bands[5] > 200);
    }

    #[test]
    fn analyzer_is_silent_on_silence() {
        let mut analyzer = SpectrumAnalyzer::new();
        let frame = analyzer.analyze(&[0.0; 100]).unwrap();
        assert_eq!(frame, SpectrumFrame::default());
    }
}
