/////////////////////////////////////////////////////////////////////////////////////
//
// SARI model
//
// main module
//
// command line driver: reads the parameter file from a model directory,
// runs the selected engine and writes the outputs
//
////////////////////////////////////////////////////////////////////////////////////

use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use std::env;
use std::process;

use sari::compartmental::CompartmentalModel;
use sari::data_management::{EngineKind, ModelDataStore, RunRecord, SimConfig};
use sari::stats::Model;
use sari::world::AgentModel;
use sari::SimError;

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <model-directory>", args[0]);
        process::exit(2);
    }

    if let Err(e) = run(&args[1]) {
        error!("{}", e);
        process::exit(1);
    }
}

fn init_logging() {
    let stdout = ConsoleAppender::builder().build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info));
    if let Ok(config) = config {
        let _ = log4rs::init_config(config);
    }
}

fn run(model_root: &str) -> Result<(), SimError> {
    let store = ModelDataStore::new(model_root)?;
    let config = store.load_config()?;
    info!("{}", config.summary());

    // a missing seed means a fresh one per run, still recorded for replay
    let seed = match config.seed {
        Some(seed) => seed,
        None => rand::random::<u64>(),
    };
    info!("Random seed {}", seed);

    let mut model = build_model(&config, seed)?;
    let population_size = model.population_size();
    let history = model.run(&mut |line| info!("{}", line));

    let csv_path = store.write_history(&history)?;
    let record = RunRecord::new(&config, seed, population_size, &history);
    let json_path = store.write_run_record(&record)?;

    info!(
        "Peak of {} infected on day {}; {} of {} days simulated",
        history.peak_infected,
        history.peak_day,
        history.len(),
        config.days
    );
    info!("History written to {}", csv_path.display());
    info!("Run record written to {}", json_path.display());
    Ok(())
}

fn build_model(config: &SimConfig, seed: u64) -> Result<Box<dyn Model>, SimError> {
    match config.engine {
        EngineKind::Agent => {
            let model = AgentModel::new(
                config.population_size,
                config.days,
                config.virus.clone(),
                config.agent.clone(),
                seed,
            )?;
            Ok(Box::new(model))
        }
        EngineKind::Compartmental => {
            let mut model =
                CompartmentalModel::new(config.population_size, config.days, config.rates.clone())?
                    .with_campaigns(config.campaigns.clone());
            if let Some(initial) = config.initial {
                model.seed_compartments(initial.vaccinated, initial.exposed, initial.infected)?;
            }
            Ok(Box::new(model))
        }
    }
}
