/////////////////////////////////////////////////////////////////////////////////////
//
// SARI model
//
// data_management module
//
// reads the model parameter file and writes run outputs: the per-day
// history as CSV and the one-shot run record as JSON
//
////////////////////////////////////////////////////////////////////////////////////

extern crate yaml_rust;

use csv::WriterBuilder;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use yaml_rust::yaml::{Yaml, YamlLoader};

use crate::compartmental::{CampaignWindow, RateParms};
use crate::stats::History;
use crate::virus::VirusParms;
use crate::world::{AgentParms, CohortSpec, ContactPattern};
use crate::SimError;

// -------------------------------- File paths -------------------------------------------------------------

/// Handles all file inputs and outputs of one model directory.
pub struct ModelDataStore {
    parameter_file: PathBuf,
    output_dir: PathBuf,
}

impl ModelDataStore {
    /// Expects `<model_root>/parms.yaml`; creates `<model_root>/output/`.
    pub fn new(model_root: &str) -> Result<ModelDataStore, SimError> {
        let model_dir = PathBuf::from(model_root);
        if !model_dir.is_dir() {
            return Err(SimError::InvalidConfig(format!(
                "model directory {} does not exist",
                model_dir.display()
            )));
        }
        let parameter_file: PathBuf = [model_root, "parms.yaml"].iter().collect();
        let output_dir: PathBuf = [model_root, "output"].iter().collect();
        if !output_dir.exists() {
            fs::create_dir(&output_dir)?;
        }
        Ok(ModelDataStore {
            parameter_file,
            output_dir,
        })
    }

    pub fn load_config(&self) -> Result<SimConfig, SimError> {
        let mut parm_file = File::open(&self.parameter_file).map_err(|e| {
            SimError::ParameterFile(format!(
                "cannot open {} - {}",
                self.parameter_file.display(),
                e
            ))
        })?;
        let mut parm_string = String::new();
        parm_file.read_to_string(&mut parm_string)?;
        SimConfig::from_yaml_str(&parm_string)
    }

    /// One CSV row per simulated day actually executed.
    pub fn write_history(&self, history: &History) -> Result<PathBuf, SimError> {
        let path = self.output_dir.join("history.csv");
        let file = File::create(&path)?;
        let mut wtr = WriterBuilder::new().from_writer(file);
        for (index, counts) in history.days().iter().enumerate() {
            wtr.serialize(HistoryRow {
                day: index + 1,
                healthy: counts.healthy,
                vaccinated: counts.vaccinated,
                exposed: counts.exposed,
                infected: counts.infected,
                cured: counts.cured,
            })?;
        }
        wtr.flush()?;
        Ok(path)
    }

    /// Written once per run, for external inspection.
    pub fn write_run_record(&self, record: &RunRecord) -> Result<PathBuf, SimError> {
        let path = self.output_dir.join("run_record.json");
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, record)?;
        Ok(path)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[derive(Debug, Serialize)]
struct HistoryRow {
    day: usize,
    healthy: u64,
    vaccinated: u64,
    exposed: u64,
    infected: u64,
    cured: u64,
}

// ----------------------------- Configuration -------------------------------------------------------------

#[derive(Hash, Debug, Copy, Clone, Eq, PartialEq)]
pub enum EngineKind {
    Agent,
    Compartmental,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for EngineKind {
    type Err = ();

    fn from_str(s: &str) -> Result<EngineKind, ()> {
        match s {
            "agent" => Ok(EngineKind::Agent),
            "compartmental" => Ok(EngineKind::Compartmental),
            _ => Err(()),
        }
    }
}

/// Initial compartment overrides for the compartmental engine.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InitialCompartments {
    pub vaccinated: f64,
    pub exposed: f64,
    pub infected: f64,
}

/// One coherent parameter record per run; every varying constant lives here
/// rather than in per-variant code.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub model_name: String,
    pub model_description: String,
    pub engine: EngineKind,
    pub days: usize,
    pub population_size: usize,
    pub seed: Option<u64>,
    pub virus: VirusParms,
    pub agent: AgentParms,
    pub rates: RateParms,
    pub campaigns: Vec<CampaignWindow>,
    pub initial: Option<InitialCompartments>,
}

impl SimConfig {
    pub fn from_yaml_str(text: &str) -> Result<SimConfig, SimError> {
        let docs = YamlLoader::load_from_str(text)
            .map_err(|e| SimError::ParameterFile(format!("malformed YAML - {}", e)))?;
        let doc = docs
            .first()
            .ok_or_else(|| SimError::ParameterFile("empty parameter file".to_string()))?;

        let model_name = req_str(doc, "model_name")?;
        let model_description = opt_str(doc, "model_description", "");
        let engine_str = req_str(doc, "engine")?;
        let engine: EngineKind = engine_str.parse().map_err(|_| {
            SimError::InvalidConfig(format!("unknown engine '{}'", engine_str))
        })?;
        let days = req_usize(doc, "days")?;
        let population_size = req_usize(doc, "population_size")?;
        if days == 0 {
            return Err(SimError::InvalidConfig(
                "days must be positive".to_string(),
            ));
        }
        if population_size == 0 {
            return Err(SimError::InvalidConfig(
                "population_size must be positive".to_string(),
            ));
        }
        let seed = match &doc["seed"] {
            node if node.is_badvalue() => None,
            node => Some(
                node.as_i64()
                    .filter(|&v| v >= 0)
                    .ok_or_else(|| {
                        SimError::ParameterFile(
                            "'seed' must be a non-negative integer".to_string(),
                        )
                    })? as u64,
            ),
        };

        let virus = parse_virus(&doc["virus"])?;
        let agent = parse_agent_parms(&doc["agent_parms"])?;
        let (rates, campaigns, initial) = parse_compartmental_parms(&doc["compartmental_parms"])?;

        Ok(SimConfig {
            model_name,
            model_description,
            engine,
            days,
            population_size,
            seed,
            virus,
            agent,
            rates,
            campaigns,
            initial,
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "Model name {}\nModel description {}\nEngine {}\nPopulation {} for {} days",
            self.model_name, self.model_description, self.engine, self.population_size, self.days
        )
    }
}

// parse - virus parms ---------------------------------------------------

fn parse_virus(node: &Yaml) -> Result<VirusParms, SimError> {
    let defaults = VirusParms::default();
    if node.is_badvalue() {
        return Ok(defaults);
    }
    VirusParms::new(
        &opt_str(node, "kind", &defaults.kind),
        opt_u32(node, "incubation_period", defaults.incubation_period)?,
        opt_u32(node, "infectious_period", defaults.infectious_period)?,
        opt_f64(
            node,
            "transmission_probability",
            defaults.transmission_probability,
        )?,
    )
}

// parse - agent parms ---------------------------------------------------

fn parse_agent_parms(node: &Yaml) -> Result<AgentParms, SimError> {
    let defaults = AgentParms::default();
    if node.is_badvalue() {
        return Ok(defaults);
    }

    let contact_pattern = match &node["contacts"] {
        contacts if contacts.is_badvalue() => defaults.contact_pattern,
        contacts => {
            let pattern = req_str(contacts, "pattern")?;
            let value = req_f64(contacts, "value")?;
            match pattern.as_str() {
                "fixed" => ContactPattern::Fixed(value as usize),
                "poisson" => ContactPattern::Poisson(value),
                other => {
                    return Err(SimError::InvalidConfig(format!(
                        "unknown contact pattern '{}'",
                        other
                    )))
                }
            }
        }
    };

    let mut cohorts: Vec<CohortSpec> = Vec::new();
    if let Some(entries) = node["cohorts"].as_vec() {
        for entry in entries {
            cohorts.push(CohortSpec {
                name: req_str(entry, "name")?,
                size: req_usize(entry, "size")?,
                age_min: req_u32(entry, "age_min")?,
                age_max: req_u32(entry, "age_max")?,
            });
        }
    }

    Ok(AgentParms {
        vaccination_probability: opt_f64(
            node,
            "vaccination_probability",
            defaults.vaccination_probability,
        )?,
        ambient_infection_probability: opt_f64(
            node,
            "ambient_infection_probability",
            defaults.ambient_infection_probability,
        )?,
        contact_pattern,
        own_group_cap: opt_usize(node, "own_group_cap", defaults.own_group_cap)?,
        cross_group_contacts: opt_usize(
            node,
            "cross_group_contacts",
            defaults.cross_group_contacts,
        )?,
        lead_contacts: opt_usize(node, "lead_contacts", defaults.lead_contacts)?,
        waning_threshold: opt_f64(node, "waning_threshold", defaults.waning_threshold)?,
        vaccine_protection_days: opt_u32(
            node,
            "vaccine_protection_days",
            defaults.vaccine_protection_days,
        )?,
        memory_decay_rate: opt_f64(node, "memory_decay_rate", defaults.memory_decay_rate)?,
        adaptive_delay: opt_u32(node, "adaptive_delay", defaults.adaptive_delay)?,
        immunocompromised_rate: opt_f64(
            node,
            "immunocompromised_rate",
            defaults.immunocompromised_rate,
        )?,
        initial_exposed_fraction: opt_f64(
            node,
            "initial_exposed_fraction",
            defaults.initial_exposed_fraction,
        )?,
        initial_infected_fraction: opt_f64(
            node,
            "initial_infected_fraction",
            defaults.initial_infected_fraction,
        )?,
        initial_vaccinated_fraction: opt_f64(
            node,
            "initial_vaccinated_fraction",
            defaults.initial_vaccinated_fraction,
        )?,
        cohorts,
        specialist_teachers: opt_usize(
            node,
            "specialist_teachers",
            defaults.specialist_teachers,
        )?,
    })
}

// parse - compartmental parms -------------------------------------------

type CompartmentalConfig = (RateParms, Vec<CampaignWindow>, Option<InitialCompartments>);

fn parse_compartmental_parms(node: &Yaml) -> Result<CompartmentalConfig, SimError> {
    let defaults = RateParms::default();
    if node.is_badvalue() {
        return Ok((defaults, Vec::new(), None));
    }

    let rates = RateParms {
        beta: opt_f64(node, "beta", defaults.beta)?,
        sigma: opt_f64(node, "sigma", defaults.sigma)?,
        gamma: opt_f64(node, "gamma", defaults.gamma)?,
        delta: opt_f64(node, "delta", defaults.delta)?,
        omega_v: opt_f64(node, "omega_v", defaults.omega_v)?,
        epsilon: opt_f64(node, "epsilon", defaults.epsilon)?,
        vaccination_rate: opt_f64(node, "vaccination_rate", defaults.vaccination_rate)?,
    };

    let mut campaigns: Vec<CampaignWindow> = Vec::new();
    if let Some(entries) = node["campaigns"].as_vec() {
        for entry in entries {
            campaigns.push(CampaignWindow {
                start_day: req_usize(entry, "start_day")?,
                end_day: req_usize(entry, "end_day")?,
                rate: req_f64(entry, "rate")?,
            });
        }
    }

    let initial = match &node["initial"] {
        entry if entry.is_badvalue() => None,
        entry => Some(InitialCompartments {
            vaccinated: opt_f64(entry, "vaccinated", 0.0)?,
            exposed: opt_f64(entry, "exposed", 0.0)?,
            infected: opt_f64(entry, "infected", 0.0)?,
        }),
    };

    Ok((rates, campaigns, initial))
}

// parse - scalar helpers ------------------------------------------------

// YAML integers do not answer as_f64; accept either representation
fn yaml_to_f64(node: &Yaml) -> Option<f64> {
    node.as_f64().or_else(|| node.as_i64().map(|v| v as f64))
}

fn req_str(node: &Yaml, key: &str) -> Result<String, SimError> {
    node[key]
        .as_str()
        .map(String::from)
        .ok_or_else(|| SimError::ParameterFile(format!("missing or invalid '{}'", key)))
}

fn opt_str(node: &Yaml, key: &str, default: &str) -> String {
    node[key].as_str().unwrap_or(default).to_string()
}

fn req_f64(node: &Yaml, key: &str) -> Result<f64, SimError> {
    yaml_to_f64(&node[key])
        .ok_or_else(|| SimError::ParameterFile(format!("missing or invalid '{}'", key)))
}

fn opt_f64(node: &Yaml, key: &str, default: f64) -> Result<f64, SimError> {
    let value = &node[key];
    if value.is_badvalue() {
        return Ok(default);
    }
    yaml_to_f64(value)
        .ok_or_else(|| SimError::ParameterFile(format!("'{}' must be numeric", key)))
}

fn req_usize(node: &Yaml, key: &str) -> Result<usize, SimError> {
    node[key]
        .as_i64()
        .filter(|&v| v >= 0)
        .map(|v| v as usize)
        .ok_or_else(|| {
            SimError::ParameterFile(format!("missing or invalid integer '{}'", key))
        })
}

fn opt_usize(node: &Yaml, key: &str, default: usize) -> Result<usize, SimError> {
    let value = &node[key];
    if value.is_badvalue() {
        return Ok(default);
    }
    value
        .as_i64()
        .filter(|&v| v >= 0)
        .map(|v| v as usize)
        .ok_or_else(|| SimError::ParameterFile(format!("'{}' must be a non-negative integer", key)))
}

fn req_u32(node: &Yaml, key: &str) -> Result<u32, SimError> {
    req_usize(node, key).map(|v| v as u32)
}

fn opt_u32(node: &Yaml, key: &str, default: u32) -> Result<u32, SimError> {
    opt_usize(node, key, default as usize).map(|v| v as u32)
}

// ----------------------------- Output model results ------------------------------------------------------

/// Per-category series, the shape external tooling reads back.
#[derive(Debug, Default, Serialize)]
pub struct HistorySeries {
    pub healthy: Vec<u64>,
    pub vaccinated: Vec<u64>,
    pub exposed: Vec<u64>,
    pub infected: Vec<u64>,
    pub cured: Vec<u64>,
}

impl HistorySeries {
    pub fn from_history(history: &History) -> HistorySeries {
        let mut series = HistorySeries::default();
        for counts in history.days() {
            series.healthy.push(counts.healthy);
            series.vaccinated.push(counts.vaccinated);
            series.exposed.push(counts.exposed);
            series.infected.push(counts.infected);
            series.cured.push(counts.cured);
        }
        series
    }
}

#[derive(Debug, Serialize)]
pub struct ParameterEcho {
    pub virus: VirusParms,
    pub agent: AgentParms,
    pub rates: RateParms,
}

/// Full structured record of one run: metadata, the parameter set used and
/// the complete history.
#[derive(Debug, Serialize)]
pub struct RunRecord {
    pub model_name: String,
    pub engine: String,
    pub population_size: u64,
    pub days_requested: usize,
    pub days_run: usize,
    pub peak_day: usize,
    pub peak_infected: u64,
    pub seed: u64,
    pub parameters: ParameterEcho,
    pub history: HistorySeries,
}

impl RunRecord {
    pub fn new(
        config: &SimConfig,
        seed: u64,
        population_size: u64,
        history: &History,
    ) -> RunRecord {
        RunRecord {
            model_name: config.model_name.clone(),
            engine: config.engine.to_string(),
            population_size,
            days_requested: config.days,
            days_run: history.len(),
            peak_day: history.peak_day,
            peak_infected: history.peak_infected,
            seed,
            parameters: ParameterEcho {
                virus: config.virus.clone(),
                agent: config.agent.clone(),
                rates: config.rates.clone(),
            },
            history: HistorySeries::from_history(history),
        }
    }
}
