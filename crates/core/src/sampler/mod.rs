use crate::{lights::Roster, NUM_BANDS};

/// Upper end of the draw that feeds the exponential rank mapping.
const DRAW_SPAN: u32 = 256;
/// Draw units per doubling of the rank.
const DRAW_OCTAVE: f64 = 64.0;

/// A light moved onto a different band at the end of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reassignment {
    pub light: usize,
    pub band: usize,
}

/// Periodically moves one random light onto a band picked with a bias
/// towards the bands that were busiest over the last window.
#[derive(Debug, Clone)]
pub struct BandSampler {
    rng: fastrand::Rng,
}

impl BandSampler {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Picks a band: a quarter of the draws land on the busiest band, and
    /// each following rank is reached by a shrinking slice of the draw.
    /// Every rank keeps a non-zero chance.
    pub fn pick_band(&mut self, averages: &[f64; NUM_BANDS]) -> usize {
        let ranked = rank_bands(averages);
        let draw = f64::from(self.rng.u32(0..=DRAW_SPAN));
        let rank = ((draw / DRAW_OCTAVE).exp2() - 1.0).floor() as usize;
        ranked[rank.min(NUM_BANDS - 1)]
    }

    /// Moves a uniformly chosen light onto a freshly picked band.
    pub fn reassign(&mut self, roster: &mut Roster, averages: &[f64; NUM_BANDS]) -> Option<Reassignment> {
        if roster.is_empty() {
            return None;
        }
        let light = self.rng.usize(..roster.len());
        let band = self.pick_band(averages);
        roster.get_mut(light)?.set_watched_band(band).ok()?;
        Some(Reassignment { light, band })
    }
}

impl Default for BandSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Orders bands from most to least active. Among equal averages the higher
/// band index ranks first: the legacy ranking picked each maximum with a
/// `>=` scan over ascending indices, so the last equal band won.
pub fn rank_bands(averages: &[f64; NUM_BANDS]) -> [usize; NUM_BANDS] {
    let mut ranked: [usize; NUM_BANDS] = std::array::from_fn(|band| band);
    ranked.sort_by(|&a, &b| averages[b].total_cmp(&averages[a]).then_with(|| b.cmp(&a)));
    ranked
}
