use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchyard::{Config, InstanceConfigStore, ModuleRegistry};

/// Switchyard - manage modules and backend instances
#[derive(Parser)]
#[command(name = "switchyard", version, about)]
struct Cli {
    /// Working directory (instances file, local modules)
    #[arg(short, long, env = "SWITCHYARD_WORKDIR")]
    workdir: Option<std::path::PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List modules found in the module directories
    Modules,
    /// Manage configured backend instances
    #[command(subcommand)]
    Instances(InstancesCommand),
}

#[derive(Subcommand)]
enum InstancesCommand {
    /// List configured instances
    List,
    /// Add an instance of a module
    Add {
        /// Instance name
        name: String,
        /// Module the instance is created from
        module: String,
        /// Parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Change an instance's module or parameters
    Edit {
        /// Instance name
        name: String,
        /// Module the instance is created from
        module: String,
        /// Parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Remove an instance
    Remove {
        /// Instance name
        name: String,
    },
    /// Enable an instance
    Enable {
        /// Instance name
        name: String,
    },
    /// Disable an instance
    Disable {
        /// Instance name
        name: String,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,switchyard=info",
        1 => "info,switchyard=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match cli.workdir {
        Some(workdir) => Config::for_workdir(workdir),
        None => Config::load()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Modules => {
            list_modules(&config);
            Ok(())
        }
        Command::Instances(cmd) => {
            let store = InstanceConfigStore::open(&config.instances_file).with_context(|| {
                format!("opening instances file {}", config.instances_file.display())
            })?;
            instances(&store, cmd)
        }
    }
}

fn list_modules(config: &Config) {
    let registry = ModuleRegistry::new(config.framework_version.clone(), config.module_dirs.clone());
    let manifests = registry.available();

    if manifests.is_empty() {
        println!("No modules found in:");
        for dir in registry.module_dirs() {
            println!("  {}", dir.display());
        }
        return;
    }

    for manifest in manifests {
        println!(
            "{:<20} {:<10} {}",
            manifest.name,
            manifest.version,
            manifest.capabilities.join(", ")
        );
        if let Some(description) = &manifest.description {
            println!("{:<20} {description}", "");
        }
    }
}

fn instances(store: &InstanceConfigStore, cmd: InstancesCommand) -> anyhow::Result<()> {
    match cmd {
        InstancesCommand::List => {
            for entry in store.list_entries()? {
                let state = if entry.enabled { "" } else { " (disabled)" };
                println!("[{}] {}{state}", entry.name, entry.module);
                for key in entry.params.keys() {
                    println!("    {key}");
                }
            }
        }
        InstancesCommand::Add {
            name,
            module,
            params,
        } => {
            store.add(&name, &module, &params.into_iter().collect::<BTreeMap<_, _>>())?;
            println!("Added {name}");
        }
        InstancesCommand::Edit {
            name,
            module,
            params,
        } => {
            store.edit(&name, &module, &params.into_iter().collect::<BTreeMap<_, _>>())?;
            println!("Updated {name}");
        }
        InstancesCommand::Remove { name } => {
            if store.remove(&name)? {
                println!("Removed {name}");
            } else {
                anyhow::bail!("no instance named {name}");
            }
        }
        InstancesCommand::Enable { name } => {
            store.set_enabled(&name, true)?;
            println!("Enabled {name}");
        }
        InstancesCommand::Disable { name } => {
            store.set_enabled(&name, false)?;
            println!("Disabled {name}");
        }
    }
    Ok(())
}
