/////////////////////////////////////////////////////////////////////////////////////
//
// SARI model
//
// virus module
//
// the fixed parameter record describing the circulating virus, shared by
// reference across every individual and both engine variants for one run
//
////////////////////////////////////////////////////////////////////////////////////

use serde::Serialize;

use crate::SimError;

/// Immutable virus parameters for a single simulation run.
///
/// Constructed once at the configuration boundary and passed by reference;
/// never overridden per person.
#[derive(Debug, Clone, Serialize)]
pub struct VirusParms {
    pub kind: String,
    /// Days between exposure and becoming infectious.
    pub incubation_period: u32,
    /// Days an individual stays infectious before recovery.
    pub infectious_period: u32,
    /// Base per-contact transmission probability, in [0, 1].
    pub transmission_probability: f64,
}

impl VirusParms {
    pub fn new(
        kind: &str,
        incubation_period: u32,
        infectious_period: u32,
        transmission_probability: f64,
    ) -> Result<VirusParms, SimError> {
        if incubation_period == 0 {
            return Err(SimError::InvalidConfig(
                "incubation_period must be at least 1 day".to_string(),
            ));
        }
        if infectious_period == 0 {
            return Err(SimError::InvalidConfig(
                "infectious_period must be at least 1 day".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&transmission_probability) {
            return Err(SimError::InvalidConfig(format!(
                "transmission_probability {} outside [0, 1]",
                transmission_probability
            )));
        }
        Ok(VirusParms {
            kind: String::from(kind),
            incubation_period,
            infectious_period,
            transmission_probability,
        })
    }
}

impl Default for VirusParms {
    fn default() -> VirusParms {
        VirusParms {
            kind: String::from("SARI"),
            incubation_period: 2,
            infectious_period: 6,
            transmission_probability: 0.12,
        }
    }
}
