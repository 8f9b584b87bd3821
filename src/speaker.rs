//! Dominant speaker detection from RTP audio-level header extensions.
//!
//! Each publisher's ingest loop feeds an `AudioLevelMeter`; the room's
//! detection ticker reads all meters and promotes a new dominant speaker
//! only after a challenger out-shouts the incumbent by a margin for several
//! consecutive ticks.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::id_types::PeerId;

/// Smoothed audio energy for one publisher, 0 (silent) to 127 (loud).
/// Fixed-point EWMA so ingest loops can update without locks.
#[derive(Default)]
pub struct AudioLevelMeter {
    /// energy * 256
    scaled: AtomicU32,
}

impl AudioLevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, energy: u8) {
        let sample = u32::from(energy) << 8;
        let mut current = self.scaled.load(Ordering::Relaxed);
        loop {
            // new = 7/8 old + 1/8 sample
            let updated = current - (current >> 3) + (sample >> 3);
            match self.scaled.compare_exchange_weak(
                current,
                updated,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn energy(&self) -> u8 {
        (self.scaled.load(Ordering::Relaxed) >> 8).min(127) as u8
    }
}

/// Energy below which a publisher is not considered to be speaking.
const ACTIVATION_THRESHOLD: u8 = 15;
/// How far a challenger must exceed the incumbent's energy.
const MARGIN: u8 = 10;
/// Consecutive ticks the challenger must hold the lead.
const REQUIRED_TICKS: u32 = 3;

pub struct DominantSpeakerDetector {
    current: Option<PeerId>,
    challenger: Option<PeerId>,
    challenger_ticks: u32,
}

impl Default for DominantSpeakerDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DominantSpeakerDetector {
    pub fn new() -> Self {
        DominantSpeakerDetector {
            current: None,
            challenger: None,
            challenger_ticks: 0,
        }
    }

    pub fn current(&self) -> Option<&PeerId> {
        self.current.as_ref()
    }

    /// Feeds one detection tick with the energy of every audio publisher.
    /// Returns `Some(new_dominant)` exactly once per transition.
    pub fn tick(&mut self, levels: &[(PeerId, u8)]) -> Option<Option<PeerId>> {
        // A departed incumbent loses the floor immediately.
        if let Some(current) = &self.current {
            let still_present = levels.iter().any(|(id, _)| id == current);
            if !still_present {
                self.current = None;
                self.challenger = None;
                self.challenger_ticks = 0;
                return Some(None);
            }
        }

        let loudest = levels
            .iter()
            .filter(|(_, energy)| *energy >= ACTIVATION_THRESHOLD)
            .max_by_key(|(_, energy)| *energy);

        let (candidate, candidate_energy) = match loudest {
            Some((id, energy)) => (id.clone(), *energy),
            None => {
                self.challenger = None;
                self.challenger_ticks = 0;
                return None;
            }
        };

        if Some(&candidate) == self.current.as_ref() {
            self.challenger = None;
            self.challenger_ticks = 0;
            return None;
        }

        let incumbent_energy = self
            .current
            .as_ref()
            .and_then(|id| levels.iter().find(|(pid, _)| pid == id))
            .map(|(_, energy)| *energy)
            .unwrap_or(0);

        if candidate_energy >= incumbent_energy.saturating_add(MARGIN) {
            if self.challenger.as_ref() == Some(&candidate) {
                self.challenger_ticks += 1;
            } else {
                self.challenger = Some(candidate.clone());
                self.challenger_ticks = 1;
            }
            if self.challenger_ticks >= REQUIRED_TICKS {
                self.current = Some(candidate.clone());
                self.challenger = None;
                self.challenger_ticks = 0;
                return Some(Some(candidate));
            }
        } else {
            self.challenger = None;
            self.challenger_ticks = 0;
        }
        None
    }
}
