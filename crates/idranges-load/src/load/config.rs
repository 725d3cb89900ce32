use anyhow::bail;
use clap::Parser;
use idranges::{
    AllocatorConfig, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_BUFFER,
    DEFAULT_START_ID,
};

/// Command line and environment settings for the `idranges-load` binary.
///
/// Every flag can also be supplied through the environment variable named
/// next to it, or through a `.env` file in the working directory.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "idranges-load",
    version,
    about = "Drive many ID allocators against one shared backend and verify that no ID is issued twice"
)]
pub struct CliArgs {
    /// Number of allocators, each standing in for one process.
    ///
    /// Environment variable: `WORKERS`
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// IDs each allocator takes from each category.
    ///
    /// Environment variable: `TAKES`
    #[arg(long, env = "TAKES", default_value_t = 1_000)]
    pub takes: u64,

    /// Comma separated categories to draw from.
    ///
    /// Environment variable: `CATEGORIES`
    #[arg(
        long,
        env = "CATEGORIES",
        value_delimiter = ',',
        default_value = "orders,users"
    )]
    pub categories: Vec<String>,

    /// IDs withdrawn from the backend per batch.
    ///
    /// Environment variable: `BATCH_SIZE`
    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: u64,

    /// Retries allowed after the first attempt of a withdraw or push.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// First ID of every category.
    ///
    /// Environment variable: `START_ID`
    #[arg(long, env = "START_ID", default_value_t = DEFAULT_START_ID)]
    pub start_id: u64,

    /// Capacity of each allocator's request channel.
    ///
    /// Environment variable: `REQUEST_BUFFER`
    #[arg(long, env = "REQUEST_BUFFER", default_value_t = DEFAULT_REQUEST_BUFFER)]
    pub request_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub workers: usize,
    pub takes: u64,
    pub categories: Vec<String>,
    pub start_id: u64,
    pub allocator: AllocatorConfig,
}

impl LoadConfig {
    /// IDs the run is expected to issue per category.
    pub fn expected_per_category(&self) -> u64 {
        self.takes.saturating_mul(self.workers as u64)
    }
}

impl TryFrom<CliArgs> for LoadConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.workers == 0 {
            bail!("WORKERS must be greater than 0");
        }
        if args.takes == 0 {
            bail!("TAKES must be greater than 0");
        }

        let mut categories: Vec<String> = args
            .categories
            .into_iter()
            .map(|category| category.trim().to_string())
            .collect();
        if categories.iter().any(String::is_empty) {
            bail!("CATEGORIES must not contain empty names");
        }
        categories.sort_unstable();
        categories.dedup();
        if categories.is_empty() {
            bail!("CATEGORIES must name at least one category");
        }

        let available = (u64::MAX - args.start_id).saturating_add(1);
        let wanted = args.takes.checked_mul(args.workers as u64);
        if wanted.is_none_or(|wanted| wanted > available) {
            bail!(
                "WORKERS ({}) x TAKES ({}) exceeds the {} IDs available from START_ID ({})",
                args.workers,
                args.takes,
                available,
                args.start_id
            );
        }

        let allocator = AllocatorConfig::default()
            .with_batch_size(args.batch_size)
            .with_max_attempts(args.max_attempts)
            .with_start_id(args.start_id)
            .with_request_buffer(args.request_buffer);
        allocator.validate()?;

        Ok(Self {
            workers: args.workers,
            takes: args.takes,
            categories,
            start_id: args.start_id,
            allocator,
        })
    }
}
