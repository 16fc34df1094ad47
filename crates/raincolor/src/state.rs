//! Debounced notify/clear decisions per location.

use crate::color::Rgb;

/// Edge event for a location's condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Precipitation started: first non-baseline sample while un-notified.
    Started,
    /// Precipitation cleared: first baseline sample while notified.
    Cleared,
    /// No edge; includes still-active-while-notified.
    None,
}

/// Decide the transition for a new sample.
///
/// Pure in `(notified, baseline, sample_color)`. Edge-triggered: exactly one
/// `Started` per rise and one `Cleared` per fall, however many ticks the
/// condition persists, so a short polling interval never re-notifies.
pub fn decide(notified: bool, baseline: Rgb, sample_color: Rgb) -> Transition {
    match (notified, sample_color == baseline) {
        (false, false) => Transition::Started,
        (true, true) => Transition::Cleared,
        _ => Transition::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASELINE: Rgb = Rgb::DEFAULT_BASELINE;
    const ACTIVE: Rgb = Rgb::new(10, 10, 10);

    #[test]
    fn truth_table() {
        assert_eq!(decide(false, BASELINE, ACTIVE), Transition::Started);
        assert_eq!(decide(false, BASELINE, BASELINE), Transition::None);
        assert_eq!(decide(true, BASELINE, ACTIVE), Transition::None);
        assert_eq!(decide(true, BASELINE, BASELINE), Transition::Cleared);
    }

    #[test]
    fn persisting_condition_never_renotifies() {
        // Once notified, any number of further non-baseline samples is None.
        for color in [ACTIVE, Rgb::new(99, 0, 0), Rgb::BLACK] {
            assert_eq!(decide(true, BASELINE, color), Transition::None);
        }
    }

    #[test]
    fn sentinel_black_follows_the_same_equality_rule() {
        // Black is only special for actuation; the state machine treats it
        // as any other non-baseline color.
        assert_eq!(decide(false, BASELINE, Rgb::BLACK), Transition::Started);
        assert_eq!(decide(true, Rgb::BLACK, Rgb::BLACK), Transition::Cleared);
    }

    #[test]
    fn full_cycle_emits_one_started_one_cleared() {
        let mut notified = false;
        let samples = [ACTIVE, ACTIVE, ACTIVE, BASELINE, BASELINE];
        let mut started = 0;
        let mut cleared = 0;
        for color in samples {
            match decide(notified, BASELINE, color) {
                Transition::Started => {
                    notified = true;
                    started += 1;
                }
                Transition::Cleared => {
                    notified = false;
                    cleared += 1;
                }
                Transition::None => {}
            }
        }
        assert_eq!((started, cleared), (1, 1));
    }
}
