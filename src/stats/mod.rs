/////////////////////////////////////////////////////////////////////////////////////
//
// SARI model
//
// stats module
//
// per-day snapshots, the run history time series and the engine contract
// shared by both model variants
//
////////////////////////////////////////////////////////////////////////////////////

use serde::Serialize;
use std::fmt;

/// Aggregate counts per health category for one simulated day.
///
/// Field names follow the reporting categories: susceptible individuals are
/// "healthy" and recovered individuals are "cured".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct DayCounts {
    pub healthy: u64,
    pub vaccinated: u64,
    pub exposed: u64,
    pub infected: u64,
    pub cured: u64,
}

impl DayCounts {
    pub fn total(&self) -> u64 {
        self.healthy + self.vaccinated + self.exposed + self.infected + self.cured
    }

    /// True once the epidemic can no longer progress.
    pub fn extinguished(&self) -> bool {
        self.exposed == 0 && self.infected == 0
    }
}

impl fmt::Display for DayCounts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Healthy: {}, Vaccinated: {}, Exposed: {}, Infected: {}, Cured: {}",
            self.healthy, self.vaccinated, self.exposed, self.infected, self.cured
        )
    }
}

/// Append-only time series of day snapshots with peak tracking.
///
/// `peak_day` is 1-based; day 1 is the first simulated day.
#[derive(Debug, Clone, Default)]
pub struct History {
    days: Vec<DayCounts>,
    pub peak_day: usize,
    pub peak_infected: u64,
}

impl History {
    pub fn new() -> History {
        History {
            days: Vec::new(),
            peak_day: 0,
            peak_infected: 0,
        }
    }

    pub fn push(&mut self, counts: DayCounts) {
        self.days.push(counts);
        if counts.infected > self.peak_infected {
            self.peak_infected = counts.infected;
            self.peak_day = self.days.len();
        }
    }

    pub fn days(&self) -> &[DayCounts] {
        &self.days
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

/// Contract shared by the agent-based and compartmental engines.
///
/// `run` drives the model one day at a time, records one snapshot per day
/// actually executed and reports a human-readable status line per day through
/// the callback. The callback must only observe; it gets plain text.
pub trait Model {
    /// Advance the model by one simulated day and return the day's counts.
    fn step_day(&mut self) -> DayCounts;

    /// Run for the configured number of days (fewer on early stop).
    fn run(&mut self, log: &mut dyn FnMut(&str)) -> History;

    /// Fixed total population size of this run.
    fn population_size(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(infected: u64) -> DayCounts {
        DayCounts {
            healthy: 100 - infected,
            vaccinated: 0,
            exposed: 0,
            infected,
            cured: 0,
        }
    }

    #[test]
    fn history_tracks_first_peak_day() {
        let mut history = History::new();
        for &i in &[1, 4, 9, 9, 3] {
            history.push(counts(i));
        }
        assert_eq!(history.peak_infected, 9);
        assert_eq!(history.peak_day, 3); // first day at the peak, 1-based
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn extinguished_requires_both_compartments_empty() {
        let mut c = counts(0);
        assert!(c.extinguished());
        c.exposed = 1;
        assert!(!c.extinguished());
        c.exposed = 0;
        c.infected = 1;
        assert!(!c.extinguished());
    }

    #[test]
    fn total_sums_all_categories() {
        let c = DayCounts {
            healthy: 1,
            vaccinated: 2,
            exposed: 3,
            infected: 4,
            cured: 5,
        };
        assert_eq!(c.total(), 15);
    }
}
