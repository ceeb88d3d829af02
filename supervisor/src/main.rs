//! # Supervisor binary
//!
//! Runs a built-in script on the simulated host and prints the run summary.

use core_types::Duration;
use std::cell::RefCell;
use std::env;
use std::fs;
use std::process;
use std::rc::Rc;
use supervisor::scripts::{sample_analog, sleep_then_count};
use supervisor::{Blink, ProviderChoice, Runtime, RuntimeConfig, SupervisorError, Tally};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Demo {
    Blink,
    Counter,
    Analog,
}

struct Options {
    config: RuntimeConfig,
    demo: Demo,
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("supervisor");

    let options = parse_args(&args).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        print_usage(program);
        process::exit(1);
    });

    if let Err(e) = run(options) {
        eprintln!("Runtime error: {}", e);
        process::exit(1);
    }
}

fn run(options: Options) -> Result<(), SupervisorError> {
    let mut runtime = Runtime::new(options.config)?;
    let hal = runtime.hal().clone();
    let supervisor = runtime.supervisor_mut();

    match options.demo {
        Demo::Blink => {
            supervisor.spawn(
                "blink",
                Blink::toggles(&hal, "LED", 6, Duration::from_millis(500)),
            )?;
        }
        Demo::Counter => {
            let tally = Rc::new(RefCell::new(Tally::default()));
            supervisor.spawn_fn(
                "slow",
                sleep_then_count("slow", Duration::from_millis(20), Rc::clone(&tally)),
            )?;
            supervisor.spawn_fn(
                "fast",
                sleep_then_count("fast", Duration::from_millis(10), tally),
            )?;
        }
        Demo::Analog => {
            let readings = Rc::new(RefCell::new(Vec::new()));
            supervisor.spawn_fn(
                "sample",
                sample_analog(&hal, "A0", 5, Duration::from_millis(100), readings),
            )?;
        }
    }

    let summary = runtime.run()?;
    let stats = runtime.supervisor().bridge_stats();
    println!("quanta:    {}", summary.quanta);
    println!("steps:     {}", summary.steps);
    println!("completed: {}", summary.completed.len());
    for failure in &summary.failures {
        println!("failed:    {} ({})", failure.name, failure.message);
    }
    println!("host time: {} ms", runtime.controller().now().as_millis());
    println!(
        "bridge:    {}",
        stats
            .to_json()
            .map_err(|e| SupervisorError::Config(e.to_string()))?
    );
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        config: RuntimeConfig::default(),
        demo: Demo::Blink,
    };
    let mut provider = None;
    let mut max_quanta = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).ok_or("Missing value for --config")?;
                let text = fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read config file: {}", e))?;
                options.config = RuntimeConfig::from_json(&text).map_err(|e| e.to_string())?;
            }
            "--provider" | "-p" => {
                i += 1;
                let name = args.get(i).ok_or("Missing value for --provider")?;
                provider = Some(
                    ProviderChoice::parse(name)
                        .ok_or_else(|| format!("Invalid provider: {}", name))?,
                );
            }
            "--demo" | "-d" => {
                i += 1;
                options.demo = match args.get(i).map(String::as_str) {
                    Some("blink") => Demo::Blink,
                    Some("counter") => Demo::Counter,
                    Some("analog") => Demo::Analog,
                    Some(other) => return Err(format!("Invalid demo: {}", other)),
                    None => return Err("Missing value for --demo".to_string()),
                };
            }
            "--max-quanta" => {
                i += 1;
                let value = args.get(i).ok_or("Missing value for --max-quanta")?;
                max_quanta = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid max-quanta value: {}", value))?,
                );
            }
            "--help" | "-h" => {
                print_usage(args.first().map(String::as_str).unwrap_or("supervisor"));
                process::exit(0);
            }
            other => {
                return Err(format!("Unknown option: {}", other));
            }
        }
        i += 1;
    }

    // flags override the config file
    if let Some(provider) = provider {
        options.config.provider = provider;
    }
    if let Some(max_quanta) = max_quanta {
        options.config.supervisor.max_quanta = max_quanta;
    }
    Ok(options)
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} [OPTIONS]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <FILE>      JSON runtime configuration");
    eprintln!("  -p, --provider <NAME>    HAL provider: native (default), host or null");
    eprintln!("  -d, --demo <NAME>        Script: blink (default), counter or analog");
    eprintln!("  --max-quanta <N>         Maximum quanta to run (0 = unlimited)");
    eprintln!("  -h, --help               Show this help message");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} --provider host --demo blink", program);
    eprintln!("  {} --config runtime.json --demo counter", program);
}
