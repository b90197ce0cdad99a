/////////////////////////////////////////////////////////////////////////////////////
//
// SARI model
//
// world module
//
// the individual-level side of the simulation: per-person immunity, the
// health-state machine, the population with optional cohort structure,
// the contact/transmission model and the agent-based engine
//
// In each cycle - ambient infection is applied, infectious people meet their
// contacts, then every person advances their state machine by one day
//
////////////////////////////////////////////////////////////////////////////////////

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::stats::{DayCounts, History, Model};
use crate::virus::VirusParms;
use crate::SimError;

// Probabilities are never allowed to reach certainty; empirical ceiling.
const MAX_INFECTION_PROBABILITY: f64 = 0.95;

// Per-day antibody retention; the vaccinated state decays more slowly.
const ANTIBODY_RETENTION: f64 = 0.97;
const VACCINATED_ANTIBODY_RETENTION: f64 = 0.99;

// Immunity boost magnitudes per event (antibody, memory). Recovery is the
// largest of any transition; vaccination boosts less than natural infection.
const EXPOSED_BOOST: (f64, f64) = (0.01, 0.0);
const INFECTED_DAILY_BOOST: (f64, f64) = (0.04, 0.02);
const RECOVERY_BOOST: (f64, f64) = (0.35, 0.30);
const VACCINATION_BOOST: (f64, f64) = (0.25, 0.20);

// Residual partial memory kept when vaccine protection runs out.
const VACCINE_WANE_ANTIBODY: f64 = 0.5;
const VACCINE_WANE_MEMORY: f64 = 0.7;

fn clamp01(value: f64) -> f64 {
    value.max(0.0).min(1.0)
}

fn clamp_probability(p: f64) -> f64 {
    p.max(0.0).min(MAX_INFECTION_PROBABILITY)
}

// Immunity ------------------------------------------------------------------------------------------

/// Per-individual immune state, owned exclusively by one person.
///
/// `antibody_level` and `memory_strength` stay in [0, 1] after every mutation
/// and decay monotonically absent a boosting event.
#[derive(Debug, Clone, Serialize)]
pub struct Immunity {
    pub innate_strength: f64,
    pub antibody_level: f64,
    pub memory_strength: f64,
    pub memory_decay_rate: f64,
    /// Days of exposure before anticipatory antibody production starts.
    pub adaptive_delay: u32,
    pub immunocompromised: bool,
}

impl Immunity {
    pub fn new(
        innate_strength: f64,
        memory_decay_rate: f64,
        adaptive_delay: u32,
        immunocompromised: bool,
    ) -> Immunity {
        Immunity {
            innate_strength: clamp01(innate_strength),
            antibody_level: 0.0,
            memory_strength: 0.0,
            memory_decay_rate: clamp01(memory_decay_rate),
            adaptive_delay,
            immunocompromised,
        }
    }

    /// Daily multiplicative decay, applied before any state-specific logic.
    pub fn decay(&mut self, antibody_retention: f64) {
        self.antibody_level = clamp01(self.antibody_level * antibody_retention);
        self.memory_strength = clamp01(self.memory_strength * (1.0 - self.memory_decay_rate));
    }

    /// Additive boost on infection progression, recovery or vaccination.
    /// Immunocompromised individuals mount half the response.
    pub fn boost(&mut self, antibody_delta: f64, memory_delta: f64) {
        let scale = if self.immunocompromised { 0.5 } else { 1.0 };
        self.antibody_level = clamp01(self.antibody_level + antibody_delta * scale);
        self.memory_strength = clamp01(self.memory_strength + memory_delta * scale);
    }

    /// Weighted protection in [0, 1] as seen by the transmission model.
    pub fn protection(&self) -> f64 {
        clamp01(self.antibody_level * 0.7 + self.memory_strength * 0.3)
    }
}

// Roles and age groups ------------------------------------------------------------------------------

#[derive(Hash, Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum Role {
    Generic,
    Student,
    Teacher,
}

impl Role {
    fn index(self) -> usize {
        match self {
            Role::Generic => 0,
            Role::Student => 1,
            Role::Teacher => 2,
        }
    }

    /// How strongly a source of this role transmits, relative to baseline.
    pub fn infectivity(self) -> f64 {
        match self {
            Role::Generic => 1.0,
            Role::Student => 1.15,
            Role::Teacher => 1.0,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Role, ()> {
        match s {
            "generic" => Ok(Role::Generic),
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            _ => Err(()),
        }
    }
}

/// Children carry weaker acquired immunity than teens, teens weaker than adults.
#[derive(Hash, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AgeGroup {
    Child,
    Teen,
    Adult,
}

impl AgeGroup {
    pub fn from_age(age: u32) -> AgeGroup {
        if age <= 10 {
            AgeGroup::Child
        } else if age <= 18 {
            AgeGroup::Teen
        } else {
            AgeGroup::Adult
        }
    }

    pub fn susceptibility(self) -> f64 {
        match self {
            AgeGroup::Child => 1.3,
            AgeGroup::Teen => 1.15,
            AgeGroup::Adult => 1.0,
        }
    }
}

/// Contact-weight multipliers keyed by (source role, target role), with
/// separate tables for own-group and cross-group encounters. Constructed once
/// per run and passed into the transmission model.
#[derive(Debug, Clone, Serialize)]
pub struct ContactWeights {
    own_group: [[f64; 3]; 3],
    cross_group: [[f64; 3]; 3],
}

impl ContactWeights {
    pub fn weight(&self, source: Role, target: Role, same_group: bool) -> f64 {
        let table = if same_group {
            &self.own_group
        } else {
            &self.cross_group
        };
        table[source.index()][target.index()]
    }
}

impl Default for ContactWeights {
    fn default() -> ContactWeights {
        // rows: source Generic/Student/Teacher, cols: target Generic/Student/Teacher
        ContactWeights {
            own_group: [
                [1.0, 0.9, 0.9],  // generic sources have no cohort of their own
                [0.9, 1.0, 0.8],  // classmates mix hardest
                [0.9, 0.8, 0.6],
            ],
            cross_group: [
                [0.4, 0.35, 0.35],
                [0.35, 0.3, 0.25],
                [0.35, 0.25, 0.2],
            ],
        }
    }
}

// Person --------------------------------------------------------------------------------------------

#[derive(Hash, Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum HealthState {
    Susceptible,
    Exposed,
    Infected,
    Recovered,
    Vaccinated,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One individual. Created at population build time, advanced once per
/// simulated day, never destroyed mid-run.
#[derive(Debug, Clone)]
pub struct Person {
    pub id: usize,
    pub age: u32,
    pub role: Role,
    pub group_id: Option<usize>,
    pub is_group_lead: bool,
    pub state: HealthState,
    pub days_exposed: u32,
    pub days_infected: u32,
    pub days_since_recovery: u32,
    pub days_since_vaccination: u32,
    pub immunity: Immunity,
}

impl Person {
    pub fn new(
        id: usize,
        age: u32,
        role: Role,
        group_id: Option<usize>,
        is_group_lead: bool,
        immunity: Immunity,
    ) -> Person {
        Person {
            id,
            age,
            role,
            group_id,
            is_group_lead,
            state: HealthState::Susceptible,
            days_exposed: 0,
            days_infected: 0,
            days_since_recovery: 0,
            days_since_vaccination: 0,
            immunity,
        }
    }

    pub fn is_infectious(&self) -> bool {
        self.state == HealthState::Infected
    }

    /// Vaccination reduces but does not eliminate susceptibility.
    pub fn can_be_infected(&self) -> bool {
        self.state == HealthState::Susceptible || self.state == HealthState::Vaccinated
    }

    /// Attempt to expose this person; returns true if the state changed.
    pub fn expose(&mut self) -> bool {
        if self.can_be_infected() {
            self.state = HealthState::Exposed;
            self.days_exposed = 0;
            true
        } else {
            false
        }
    }

    pub fn vaccinate(&mut self) {
        self.state = HealthState::Vaccinated;
        self.days_since_vaccination = 0;
        self.immunity.boost(VACCINATION_BOOST.0, VACCINATION_BOOST.1);
    }

    // Strong innate immunity shortens the infectious course by a day,
    // weak innate immunity lengthens it by a day.
    fn effective_infectious_period(&self, virus: &VirusParms) -> u32 {
        let adjustment = if self.immunity.innate_strength >= 0.75 {
            -1
        } else if self.immunity.innate_strength < 0.25 {
            1
        } else {
            0
        };
        (virus.infectious_period as i64 + adjustment).max(1) as u32
    }

    /// Advance the health-state machine by one simulated day.
    pub fn advance_day(&mut self, virus: &VirusParms, parms: &AgentParms, rng: &mut StdRng) {
        let retention = if self.state == HealthState::Vaccinated {
            VACCINATED_ANTIBODY_RETENTION
        } else {
            ANTIBODY_RETENTION
        };
        self.immunity.decay(retention);

        match self.state {
            HealthState::Susceptible => {
                if parms.vaccination_probability > 0.0
                    && rng.gen::<f64>() < parms.vaccination_probability
                {
                    self.vaccinate();
                }
            }
            HealthState::Exposed => {
                self.days_exposed += 1;
                if self.days_exposed > self.immunity.adaptive_delay {
                    // anticipatory antibody production
                    self.immunity.boost(EXPOSED_BOOST.0, EXPOSED_BOOST.1);
                }
                if self.days_exposed >= virus.incubation_period {
                    self.state = HealthState::Infected;
                    self.days_infected = 0;
                }
            }
            HealthState::Infected => {
                self.days_infected += 1;
                self.immunity
                    .boost(INFECTED_DAILY_BOOST.0, INFECTED_DAILY_BOOST.1);
                if self.days_infected >= self.effective_infectious_period(virus) {
                    self.state = HealthState::Recovered;
                    self.days_since_recovery = 0;
                    self.immunity.boost(RECOVERY_BOOST.0, RECOVERY_BOOST.1);
                }
            }
            HealthState::Recovered => {
                self.days_since_recovery += 1;
                if self.immunity.antibody_level < parms.waning_threshold {
                    // acquired immunity lost; the reinfection loop closes here
                    self.state = HealthState::Susceptible;
                    self.days_exposed = 0;
                    self.days_infected = 0;
                }
            }
            HealthState::Vaccinated => {
                self.days_since_vaccination += 1;
                if self.days_since_vaccination > parms.vaccine_protection_days {
                    self.state = HealthState::Susceptible;
                    self.immunity.antibody_level *= VACCINE_WANE_ANTIBODY;
                    self.immunity.memory_strength *= VACCINE_WANE_MEMORY;
                }
            }
        }
    }
}

// Parameters ----------------------------------------------------------------------------------------

/// Daily contact budget of one infectious individual.
#[derive(Debug, Copy, Clone, Serialize)]
pub enum ContactPattern {
    Fixed(usize),
    Poisson(f64),
}

/// A named cohort (e.g. a school class) with its size and age range.
#[derive(Debug, Clone, Serialize)]
pub struct CohortSpec {
    pub name: String,
    pub size: usize,
    pub age_min: u32,
    pub age_max: u32,
}

/// All tunable constants of the agent-based engine for one run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentParms {
    /// Daily probability that a susceptible person gets vaccinated.
    pub vaccination_probability: f64,
    /// Daily infection chance outside the tracked contact network.
    pub ambient_infection_probability: f64,
    pub contact_pattern: ContactPattern,
    /// Guaranteed own-group contacts per infectious source, at most.
    pub own_group_cap: usize,
    pub cross_group_contacts: usize,
    pub lead_contacts: usize,
    /// Antibody level below which a recovered person turns susceptible again.
    pub waning_threshold: f64,
    pub vaccine_protection_days: u32,
    pub memory_decay_rate: f64,
    pub adaptive_delay: u32,
    pub immunocompromised_rate: f64,
    pub initial_exposed_fraction: f64,
    pub initial_infected_fraction: f64,
    pub initial_vaccinated_fraction: f64,
    /// Empty for unstructured random mixing.
    pub cohorts: Vec<CohortSpec>,
    /// Ungrouped teachers visiting several cohorts.
    pub specialist_teachers: usize,
}

impl Default for AgentParms {
    fn default() -> AgentParms {
        AgentParms {
            vaccination_probability: 0.002,
            ambient_infection_probability: 0.0015,
            contact_pattern: ContactPattern::Fixed(2),
            own_group_cap: 12,
            cross_group_contacts: 2,
            lead_contacts: 2,
            waning_threshold: 0.2,
            vaccine_protection_days: 180,
            memory_decay_rate: 0.01,
            adaptive_delay: 3,
            immunocompromised_rate: 0.02,
            initial_exposed_fraction: 0.05,
            initial_infected_fraction: 0.0,
            initial_vaccinated_fraction: 0.0,
            cohorts: Vec::new(),
            specialist_teachers: 0,
        }
    }
}

impl AgentParms {
    pub fn validate(&self) -> Result<(), SimError> {
        for &(name, value) in &[
            ("vaccination_probability", self.vaccination_probability),
            (
                "ambient_infection_probability",
                self.ambient_infection_probability,
            ),
            ("waning_threshold", self.waning_threshold),
            ("memory_decay_rate", self.memory_decay_rate),
            ("immunocompromised_rate", self.immunocompromised_rate),
            ("initial_exposed_fraction", self.initial_exposed_fraction),
            ("initial_infected_fraction", self.initial_infected_fraction),
            (
                "initial_vaccinated_fraction",
                self.initial_vaccinated_fraction,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SimError::InvalidConfig(format!(
                    "{} {} outside [0, 1]",
                    name, value
                )));
            }
        }
        let seeded = self.initial_exposed_fraction
            + self.initial_infected_fraction
            + self.initial_vaccinated_fraction;
        if seeded > 1.0 {
            return Err(SimError::InvalidConfig(format!(
                "initial state fractions sum to {} (> 1)",
                seeded
            )));
        }
        if let ContactPattern::Poisson(mean) = self.contact_pattern {
            if mean <= 0.0 {
                return Err(SimError::InvalidConfig(format!(
                    "poisson contact mean {} must be positive",
                    mean
                )));
            }
        }
        for cohort in &self.cohorts {
            if cohort.size == 0 {
                return Err(SimError::InvalidConfig(format!(
                    "cohort {} has zero size",
                    cohort.name
                )));
            }
            if cohort.age_min > cohort.age_max {
                return Err(SimError::InvalidConfig(format!(
                    "cohort {} has inverted age range",
                    cohort.name
                )));
            }
        }
        Ok(())
    }
}

// Population ----------------------------------------------------------------------------------------

/// The fixed collection of individuals for one run, optionally partitioned
/// into cohorts. Group membership never changes during a run.
#[derive(Debug)]
pub struct Population {
    pub people: Vec<Person>,
    groups: Vec<Vec<usize>>,
}

impl Population {
    /// Build either a flat population of `flat_size` generic individuals or,
    /// when cohorts are configured, the cohort composition (students plus one
    /// lead teacher per cohort, plus ungrouped specialist teachers).
    pub fn build(flat_size: usize, parms: &AgentParms, rng: &mut StdRng) -> Population {
        let mut people: Vec<Person> = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();

        if parms.cohorts.is_empty() {
            for id in 0..flat_size {
                let age = rng.gen_range(5, 81);
                let immunity = Population::draw_immunity(parms, rng);
                people.push(Person::new(id, age, Role::Generic, None, false, immunity));
            }
        } else {
            for (group_index, cohort) in parms.cohorts.iter().enumerate() {
                let mut members: Vec<usize> = Vec::with_capacity(cohort.size + 1);
                for _ in 0..cohort.size {
                    let id = people.len();
                    let age = if cohort.age_max > cohort.age_min {
                        rng.gen_range(cohort.age_min, cohort.age_max + 1)
                    } else {
                        cohort.age_min
                    };
                    let immunity = Population::draw_immunity(parms, rng);
                    members.push(id);
                    people.push(Person::new(
                        id,
                        age,
                        Role::Student,
                        Some(group_index),
                        false,
                        immunity,
                    ));
                }
                // each cohort gets one lead teacher
                let id = people.len();
                let immunity = Population::draw_immunity(parms, rng);
                members.push(id);
                people.push(Person::new(
                    id,
                    rng.gen_range(28, 61),
                    Role::Teacher,
                    Some(group_index),
                    true,
                    immunity,
                ));
                groups.push(members);
            }
            for _ in 0..parms.specialist_teachers {
                let id = people.len();
                let immunity = Population::draw_immunity(parms, rng);
                people.push(Person::new(
                    id,
                    rng.gen_range(28, 61),
                    Role::Teacher,
                    None,
                    false,
                    immunity,
                ));
            }
        }

        Population { people, groups }
    }

    fn draw_immunity(parms: &AgentParms, rng: &mut StdRng) -> Immunity {
        Immunity::new(
            rng.gen_range(0.1, 0.9),
            parms.memory_decay_rate,
            parms.adaptive_delay,
            rng.gen::<f64>() < parms.immunocompromised_rate,
        )
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }

    pub fn is_structured(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    /// Seed the initial exposed/infectious/vaccinated individuals.
    pub fn seed_initial_states(&mut self, parms: &AgentParms, rng: &mut StdRng) {
        let n = self.people.len() as f64;
        let exposed = (n * parms.initial_exposed_fraction).round() as usize;
        let infected = (n * parms.initial_infected_fraction).round() as usize;
        let vaccinated = (n * parms.initial_vaccinated_fraction).round() as usize;

        let ids: Vec<usize> = (0..self.people.len()).collect();
        let chosen: Vec<usize> = ids
            .choose_multiple(rng, exposed + infected + vaccinated)
            .cloned()
            .collect();

        for (k, &index) in chosen.iter().enumerate() {
            let person = &mut self.people[index];
            if k < exposed {
                person.state = HealthState::Exposed;
                person.days_exposed = 0;
            } else if k < exposed + infected {
                person.state = HealthState::Infected;
                person.days_infected = 0;
            } else {
                person.vaccinate();
            }
        }
    }

    pub fn counts(&self) -> DayCounts {
        let mut counts = DayCounts {
            healthy: 0,
            vaccinated: 0,
            exposed: 0,
            infected: 0,
            cured: 0,
        };
        for person in &self.people {
            match person.state {
                HealthState::Susceptible => counts.healthy += 1,
                HealthState::Vaccinated => counts.vaccinated += 1,
                HealthState::Exposed => counts.exposed += 1,
                HealthState::Infected => counts.infected += 1,
                HealthState::Recovered => counts.cured += 1,
            }
        }
        counts
    }

    /// Unmodeled exposure outside the tracked contact network, applied to
    /// every eligible individual independently.
    pub fn ambient_infection(&mut self, probability: f64, rng: &mut StdRng) -> usize {
        if probability <= 0.0 {
            return 0;
        }
        let mut new_infections = 0;
        for person in self.people.iter_mut() {
            if person.can_be_infected() && rng.gen::<f64>() < probability && person.expose() {
                new_infections += 1;
            }
        }
        new_infections
    }

    /// Resolve contacts for every infectious individual and attempt
    /// transmission on each. Returns the number of new exposures.
    pub fn spread_infection(
        &mut self,
        virus: &VirusParms,
        weights: &ContactWeights,
        parms: &AgentParms,
        rng: &mut StdRng,
    ) -> usize {
        if self.is_structured() {
            self.spread_structured(virus, weights, parms, rng)
        } else {
            self.spread_unstructured(virus, parms, rng)
        }
    }

    fn contact_budget(pattern: ContactPattern, rng: &mut StdRng) -> usize {
        match pattern {
            ContactPattern::Fixed(count) => count,
            // mean validated positive at the configuration boundary
            ContactPattern::Poisson(mean) => Poisson::new(mean)
                .map(|dist| {
                    let draw: u64 = dist.sample(rng);
                    draw as usize
                })
                .unwrap_or(0),
        }
    }

    // Random mixing: each infectious source draws its contact budget from a
    // shuffled pool of eligible individuals, without replacement across the
    // whole population.
    fn spread_unstructured(
        &mut self,
        virus: &VirusParms,
        parms: &AgentParms,
        rng: &mut StdRng,
    ) -> usize {
        let mut eligible: Vec<usize> = (0..self.people.len())
            .filter(|&i| self.people[i].can_be_infected())
            .collect();
        if eligible.is_empty() {
            return 0;
        }
        eligible.shuffle(rng);

        let infectious: Vec<usize> = (0..self.people.len())
            .filter(|&i| self.people[i].is_infectious())
            .collect();

        let mut new_infections = 0;
        for _source in infectious {
            let budget = Population::contact_budget(parms.contact_pattern, rng);
            for _ in 0..budget {
                // pool exhaustion is a no-op, not an error
                let target = match eligible.pop() {
                    Some(index) => index,
                    None => break,
                };
                let p = unstructured_probability(virus, &self.people[target], rng);
                if rng.gen::<f64>() < p && self.people[target].expose() {
                    new_infections += 1;
                }
            }
        }
        new_infections
    }

    // Cohort mixing: own-group mates up to a cap, a bounded cross-group
    // sample, and a bounded sample of group leads.
    fn spread_structured(
        &mut self,
        virus: &VirusParms,
        weights: &ContactWeights,
        parms: &AgentParms,
        rng: &mut StdRng,
    ) -> usize {
        let infectious: Vec<(usize, Role, Option<usize>)> = self
            .people
            .iter()
            .filter(|p| p.is_infectious())
            .map(|p| (p.id, p.role, p.group_id))
            .collect();

        let mut new_infections = 0;
        for (source, source_role, source_group) in infectious {
            // (target index, same-group contact)
            let mut contacts: Vec<(usize, bool)> = Vec::new();

            if let Some(group) = source_group {
                for &member in &self.groups[group] {
                    if member != source && self.people[member].can_be_infected() {
                        contacts.push((member, true));
                        if contacts.len() >= parms.own_group_cap {
                            break;
                        }
                    }
                }
            }

            let cross_pool: Vec<usize> = (0..self.people.len())
                .filter(|&i| {
                    i != source
                        && self.people[i].can_be_infected()
                        && (source_group.is_none() || self.people[i].group_id != source_group)
                })
                .collect();
            for &index in cross_pool.choose_multiple(rng, parms.cross_group_contacts) {
                if !contacts.iter().any(|&(c, _)| c == index) {
                    contacts.push((index, false));
                }
            }

            let lead_pool: Vec<usize> = (0..self.people.len())
                .filter(|&i| {
                    i != source
                        && self.people[i].is_group_lead
                        && self.people[i].can_be_infected()
                })
                .collect();
            for &index in lead_pool.choose_multiple(rng, parms.lead_contacts) {
                if !contacts.iter().any(|&(c, _)| c == index) {
                    let same_group =
                        source_group.is_some() && self.people[index].group_id == source_group;
                    contacts.push((index, same_group));
                }
            }

            for (target, same_group) in contacts {
                let p = structured_probability(
                    virus,
                    weights,
                    source_role,
                    same_group,
                    &self.people[target],
                    rng,
                );
                if rng.gen::<f64>() < p && self.people[target].expose() {
                    new_infections += 1;
                }
            }
        }
        new_infections
    }

    pub fn advance_day(&mut self, virus: &VirusParms, parms: &AgentParms, rng: &mut StdRng) {
        for person in self.people.iter_mut() {
            person.advance_day(virus, parms, rng);
        }
    }
}

// In the unstructured mode the per-pair probability reduces to the base
// transmission probability scaled by the target's immunity, plus noise.
fn unstructured_probability(virus: &VirusParms, target: &Person, rng: &mut StdRng) -> f64 {
    let immunity_factor = 1.0 - target.immunity.protection();
    let noise = rng.gen_range(0.7, 1.0);
    clamp_probability(virus.transmission_probability * immunity_factor * noise)
}

fn structured_probability(
    virus: &VirusParms,
    weights: &ContactWeights,
    source_role: Role,
    same_group: bool,
    target: &Person,
    rng: &mut StdRng,
) -> f64 {
    let p = virus.transmission_probability
        * weights.weight(source_role, target.role, same_group)
        * AgeGroup::from_age(target.age).susceptibility()
        * source_role.infectivity()
        * (1.0 - target.immunity.protection())
        * rng.gen_range(0.7, 1.0);
    clamp_probability(p)
}

// Agent engine --------------------------------------------------------------------------------------

/// The agent-based population engine: owns the individual collection,
/// advances it one day per `step_day` call and aggregates per-status counts.
pub struct AgentModel {
    population: Population,
    virus: VirusParms,
    parms: AgentParms,
    weights: ContactWeights,
    rng: StdRng,
    days: usize,
    day: usize,
    last_new_infections: usize,
}

impl AgentModel {
    pub fn new(
        population_size: usize,
        days: usize,
        virus: VirusParms,
        parms: AgentParms,
        seed: u64,
    ) -> Result<AgentModel, SimError> {
        if days == 0 {
            return Err(SimError::InvalidConfig(
                "day count must be positive".to_string(),
            ));
        }
        if parms.cohorts.is_empty() && population_size == 0 {
            return Err(SimError::InvalidConfig(
                "population size must be positive".to_string(),
            ));
        }
        if !parms.cohorts.is_empty() {
            // in cohort mode the composition dictates the head count; a
            // conflicting population_size is a caller mistake, not a hint
            let cohort_total: usize = parms.cohorts.iter().map(|c| c.size).sum::<usize>()
                + parms.cohorts.len()
                + parms.specialist_teachers;
            if population_size != 0 && population_size != cohort_total {
                return Err(SimError::InvalidConfig(format!(
                    "population_size {} conflicts with the cohort composition total {}",
                    population_size, cohort_total
                )));
            }
        }
        parms.validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut population = Population::build(population_size, &parms, &mut rng);
        if population.is_empty() {
            return Err(SimError::InvalidConfig(
                "cohort composition yields an empty population".to_string(),
            ));
        }
        population.seed_initial_states(&parms, &mut rng);
        info!(
            "agent population built: {} people in {} groups, seed {}",
            population.len(),
            population.groups().len(),
            seed
        );

        Ok(AgentModel {
            population,
            virus,
            parms,
            weights: ContactWeights::default(),
            rng,
            days,
            day: 0,
            last_new_infections: 0,
        })
    }

    /// Replace the default contact-weight tables for this run.
    pub fn with_weights(mut self, weights: ContactWeights) -> AgentModel {
        self.weights = weights;
        self
    }

    pub fn population(&self) -> &Population {
        &self.population
    }
}

impl Model for AgentModel {
    fn step_day(&mut self) -> DayCounts {
        self.day += 1;
        let ambient = self
            .population
            .ambient_infection(self.parms.ambient_infection_probability, &mut self.rng);
        let contact =
            self.population
                .spread_infection(&self.virus, &self.weights, &self.parms, &mut self.rng);
        self.population
            .advance_day(&self.virus, &self.parms, &mut self.rng);
        self.last_new_infections = ambient + contact;
        debug!(
            "day {}: {} ambient + {} contact exposures",
            self.day, ambient, contact
        );
        self.population.counts()
    }

    fn run(&mut self, log: &mut dyn FnMut(&str)) -> History {
        let mut history = History::new();
        for _ in 0..self.days {
            let counts = self.step_day();
            history.push(counts);
            log(&format!("--- Day {} ---", self.day));
            log(&counts.to_string());
            log(&format!("New infections: {}", self.last_new_infections));
            if counts.extinguished() {
                // epidemic extinguished - normal early termination
                log("Simulation finished.");
                break;
            }
        }
        history
    }

    fn population_size(&self) -> u64 {
        self.population.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_person(innate: f64) -> Person {
        Person::new(
            0,
            30,
            Role::Generic,
            None,
            false,
            Immunity::new(innate, 0.01, 3, false),
        )
    }

    fn quiet_parms() -> AgentParms {
        AgentParms {
            vaccination_probability: 0.0,
            ambient_infection_probability: 0.0,
            ..AgentParms::default()
        }
    }

    #[test]
    fn immunity_stays_in_bounds_under_random_sequences() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut immunity = Immunity::new(0.5, 0.02, 3, false);
        for _ in 0..1000 {
            if rng.gen::<bool>() {
                immunity.decay(rng.gen_range(0.9, 1.0));
            } else {
                immunity.boost(rng.gen_range(-0.5, 1.5), rng.gen_range(-0.5, 1.5));
            }
            assert!((0.0..=1.0).contains(&immunity.antibody_level));
            assert!((0.0..=1.0).contains(&immunity.memory_strength));
        }
    }

    #[test]
    fn immunocompromised_receive_half_boost() {
        let mut normal = Immunity::new(0.5, 0.01, 3, false);
        let mut compromised = Immunity::new(0.5, 0.01, 3, true);
        normal.boost(0.4, 0.2);
        compromised.boost(0.4, 0.2);
        assert!((normal.antibody_level - 0.4).abs() < 1e-12);
        assert!((compromised.antibody_level - 0.2).abs() < 1e-12);
    }

    #[test]
    fn exposed_becomes_infected_after_incubation() {
        let virus = VirusParms::default();
        let parms = quiet_parms();
        let mut rng = StdRng::seed_from_u64(1);
        let mut person = test_person(0.5);
        assert!(person.expose());
        person.advance_day(&virus, &parms, &mut rng);
        assert_eq!(person.state, HealthState::Exposed);
        person.advance_day(&virus, &parms, &mut rng);
        assert_eq!(person.state, HealthState::Infected);
    }

    #[test]
    fn infected_recovers_on_exact_day() {
        let virus = VirusParms::default();
        let parms = quiet_parms();
        let mut rng = StdRng::seed_from_u64(1);
        // innate 0.5 leaves the infectious period unadjusted
        let mut person = test_person(0.5);
        person.state = HealthState::Infected;
        for day in 1..virus.infectious_period {
            person.advance_day(&virus, &parms, &mut rng);
            assert_eq!(person.state, HealthState::Infected, "day {}", day);
        }
        person.advance_day(&virus, &parms, &mut rng);
        assert_eq!(person.state, HealthState::Recovered);
    }

    #[test]
    fn innate_strength_adjusts_infectious_period() {
        let virus = VirusParms::default();
        assert_eq!(
            test_person(0.9).effective_infectious_period(&virus),
            virus.infectious_period - 1
        );
        assert_eq!(
            test_person(0.1).effective_infectious_period(&virus),
            virus.infectious_period + 1
        );
        assert_eq!(
            test_person(0.5).effective_infectious_period(&virus),
            virus.infectious_period
        );
    }

    #[test]
    fn recovered_wanes_back_to_susceptible_and_is_reinfectable() {
        let virus = VirusParms::default();
        let parms = quiet_parms();
        let mut rng = StdRng::seed_from_u64(1);
        let mut person = test_person(0.5);
        assert!(person.expose());

        // full round trip in a bounded number of steps
        let mut steps = 0;
        while person.state != HealthState::Recovered {
            person.advance_day(&virus, &parms, &mut rng);
            steps += 1;
            assert!(steps < 100, "never reached Recovered");
        }
        while person.state == HealthState::Recovered {
            person.advance_day(&virus, &parms, &mut rng);
            steps += 1;
            assert!(steps < 1000, "immunity never waned");
        }
        assert_eq!(person.state, HealthState::Susceptible);
        assert!(person.immunity.antibody_level < parms.waning_threshold);
        assert!(person.can_be_infected());
        assert!(person.expose());
    }

    #[test]
    fn vaccinated_reverts_after_protection_horizon_with_penalty() {
        let virus = VirusParms::default();
        let parms = quiet_parms();
        let mut rng = StdRng::seed_from_u64(1);
        let mut person = test_person(0.5);
        person.vaccinate();
        assert_eq!(person.state, HealthState::Vaccinated);
        assert!(person.can_be_infected());

        for _ in 0..=parms.vaccine_protection_days {
            person.advance_day(&virus, &parms, &mut rng);
        }
        assert_eq!(person.state, HealthState::Susceptible);
        // partial penalty, not a reset to zero
        assert!(person.immunity.memory_strength > 0.0);
    }

    #[test]
    fn counts_sum_to_population_every_day() {
        let mut model = AgentModel::new(
            200,
            60,
            VirusParms::default(),
            AgentParms::default(),
            99,
        )
        .unwrap();
        let history = model.run(&mut |_| {});
        assert!(!history.is_empty());
        for counts in history.days() {
            assert_eq!(counts.total(), 200);
        }
    }

    #[test]
    fn zero_probability_means_no_contact_exposures() {
        let virus = VirusParms::new("SARI", 2, 6, 0.0).unwrap();
        let parms = AgentParms {
            vaccination_probability: 0.0,
            ambient_infection_probability: 0.0,
            initial_exposed_fraction: 0.0,
            initial_infected_fraction: 0.05, // 50 of 1000
            ..AgentParms::default()
        };
        let mut model = AgentModel::new(1000, 100, virus, parms, 5).unwrap();
        for _ in 0..100 {
            let counts = model.step_day();
            assert_eq!(counts.exposed, 0);
        }
    }

    #[test]
    fn cohort_population_assigns_each_member_to_one_group() {
        let parms = AgentParms {
            cohorts: vec![
                CohortSpec {
                    name: String::from("1a"),
                    size: 20,
                    age_min: 7,
                    age_max: 8,
                },
                CohortSpec {
                    name: String::from("5b"),
                    size: 25,
                    age_min: 11,
                    age_max: 12,
                },
            ],
            specialist_teachers: 2,
            ..AgentParms::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let population = Population::build(0, &parms, &mut rng);
        // 20 + 25 students, one lead per cohort, 2 specialists
        assert_eq!(population.len(), 49);
        assert_eq!(population.groups().len(), 2);

        let mut appearances = vec![0usize; population.len()];
        for group in population.groups() {
            for &member in group {
                appearances[member] += 1;
            }
        }
        for person in &population.people {
            match person.group_id {
                Some(_) => assert_eq!(appearances[person.id], 1),
                None => assert_eq!(appearances[person.id], 0),
            }
        }
        let leads = population.people.iter().filter(|p| p.is_group_lead).count();
        assert_eq!(leads, 2);
    }

    #[test]
    fn cohort_mode_rejects_conflicting_population_size() {
        let parms = AgentParms {
            cohorts: vec![
                CohortSpec {
                    name: String::from("1a"),
                    size: 20,
                    age_min: 7,
                    age_max: 8,
                },
                CohortSpec {
                    name: String::from("5b"),
                    size: 25,
                    age_min: 11,
                    age_max: 12,
                },
            ],
            specialist_teachers: 2,
            ..AgentParms::default()
        };
        // 45 students + 2 leads + 2 specialists = 49
        assert!(AgentModel::new(831, 10, VirusParms::default(), parms.clone(), 1).is_err());
        assert!(AgentModel::new(49, 10, VirusParms::default(), parms.clone(), 1).is_ok());
        assert!(AgentModel::new(0, 10, VirusParms::default(), parms, 1).is_ok());
    }

    #[test]
    fn structured_spread_reaches_other_cohorts() {
        let virus = VirusParms::new("SARI", 2, 6, 1.0).unwrap();
        let parms = AgentParms {
            vaccination_probability: 0.0,
            ambient_infection_probability: 0.0,
            initial_exposed_fraction: 0.0,
            initial_infected_fraction: 0.0,
            cohorts: vec![
                CohortSpec {
                    name: String::from("1a"),
                    size: 10,
                    age_min: 7,
                    age_max: 8,
                },
                CohortSpec {
                    name: String::from("1b"),
                    size: 10,
                    age_min: 7,
                    age_max: 8,
                },
            ],
            ..AgentParms::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let mut population = Population::build(0, &parms, &mut rng);
        population.people[0].state = HealthState::Infected;

        let weights = ContactWeights::default();
        let mut infected_other_cohort = false;
        for _ in 0..20 {
            population.spread_infection(&virus, &weights, &parms, &mut rng);
            population.advance_day(&virus, &parms, &mut rng);
            if population
                .people
                .iter()
                .any(|p| p.group_id == Some(1) && !p.can_be_infected())
            {
                infected_other_cohort = true;
                break;
            }
        }
        assert!(infected_other_cohort);
    }

    #[test]
    fn contact_sampling_caps_at_pool_size() {
        let virus = VirusParms::new("SARI", 2, 6, 1.0).unwrap();
        let parms = AgentParms {
            vaccination_probability: 0.0,
            ambient_infection_probability: 0.0,
            contact_pattern: ContactPattern::Fixed(50),
            initial_exposed_fraction: 0.0,
            initial_infected_fraction: 0.5,
            ..AgentParms::default()
        };
        // more contacts requested than eligible people exist
        let mut model = AgentModel::new(6, 10, virus, parms, 8).unwrap();
        let counts = model.step_day();
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn rejects_non_positive_configuration() {
        assert!(AgentModel::new(0, 10, VirusParms::default(), AgentParms::default(), 1).is_err());
        assert!(AgentModel::new(10, 0, VirusParms::default(), AgentParms::default(), 1).is_err());
    }
}
