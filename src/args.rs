use crate::config::Config;
use clap::{ArgAction, Args};
use std::path::PathBuf;

// Global flags shared across every subcommand.
//
//   -c / --config      Path to a config.toml file
//   --api-url          Task service API root
//   --working-dir …    Per-run settings forwarded with each task
//   --no-color         Disable coloured terminal output
#[derive(Debug, Clone, Default, Args)]
pub struct CommonArgs {
    /// Path to a config.toml file
    #[arg(
        short = 'c',
        long,
        value_name = "PATH",
        env = "TASKSTREAM_CONFIG",
        global = true
    )]
    pub config: Option<PathBuf>,

    /// Task service API root (e.g. http://localhost:5000/api)
    #[arg(long, value_name = "URL", env = "TASKSTREAM_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Working directory the agent runs in
    #[arg(long, value_name = "DIR", global = true)]
    pub working_dir: Option<String>,

    /// Model provider
    #[arg(long, value_name = "NAME", global = true)]
    pub provider: Option<String>,

    /// Model name
    #[arg(long, value_name = "NAME", global = true)]
    pub model: Option<String>,

    /// Step limit for the agent
    #[arg(long, value_name = "N", global = true)]
    pub max_steps: Option<u32>,

    /// Agent-side configuration file
    #[arg(long, value_name = "FILE", global = true)]
    pub config_file: Option<String>,

    /// Disable coloured terminal output (`NO_COLOR` is honoured separately)
    #[arg(long = "no-color", action = ArgAction::SetTrue, global = true)]
    pub no_color: bool,
}

impl CommonArgs {
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone()
    }

    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(api_url) = &self.api_url {
            config.api_url = api_url.clone();
        }

        if let Some(working_dir) = &self.working_dir {
            config.run.working_dir = working_dir.clone();
        }

        if let Some(provider) = &self.provider {
            config.run.provider = provider.clone();
        }

        if let Some(model) = &self.model {
            config.run.model = model.clone();
        }

        if let Some(max_steps) = self.max_steps {
            config.run.max_steps = max_steps;
        }

        if let Some(config_file) = &self.config_file {
            config.run.config_file = config_file.clone();
        }
    }
}
