use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sheet-sim",
    about = "Simulate several clients editing one sheet and check that they converge"
)]
pub struct Cli {
    #[arg(long, env = "SHEET_SIM_CLIENTS", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub clients: u32,

    #[arg(long, env = "SHEET_SIM_EDITS", default_value_t = 200)]
    pub edits: u32,

    #[arg(long, default_value_t = 12, value_parser = clap::value_parser!(u32).range(1..))]
    pub rows: u32,

    #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(1..))]
    pub cols: u32,

    #[arg(long, env = "SHEET_SIM_REJECT_RATE", default_value_t = 0.1, value_parser = parse_rate)]
    pub reject_rate: f64,

    /// Upper bound of the random per-commit latency.
    #[arg(long, env = "SHEET_SIM_LATENCY_MS", default_value_t = 25)]
    pub latency_ms: u64,

    #[arg(long, env = "SHEET_SIM_SEED", default_value_t = 7)]
    pub seed: u64,

    #[arg(long, default_value = "sim")]
    pub sheet: String,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[arg(long, help = "Skip printing the metrics exposition")]
    pub quiet_metrics: bool,
}

fn parse_rate(raw: &str) -> Result<f64, String> {
    let rate: f64 = raw
        .trim()
        .parse()
        .map_err(|err| format!("invalid rate {raw:?}: {err}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("rate must be between 0 and 1, got {rate}"))
    }
}
