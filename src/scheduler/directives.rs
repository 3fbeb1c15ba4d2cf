//! Parses `#SHEPHERD` directive comment lines embedded in a submission
//! script into typed overrides, plus the ranked partition list and raw
//! `sbatch` argument string.
//!
//! Directive syntax, one per line:
//! ```text
//! #SHEPHERD --partitions=gpu-a,gpu-b,cpu
//! #SHEPHERD --max-retries=5
//! #SHEPHERD --sbatch-args="--mem=64G --gpus=4"
//! ```

use crate::model::ConfigOverrides;

/// Everything a directive block can express about one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDirectives {
    pub partitions: Vec<String>,
    pub gpus: Option<u32>,
    pub run_mode: Option<String>,
    pub run_id: Option<String>,
    /// GPU-discovery inputs; consumed by the external partition/GPU
    /// discovery collaborator, not by the core state machine.
    pub min_vram: Option<u64>,
    pub max_vram: Option<u64>,
    pub prefer: Option<String>,
    pub overrides: ConfigOverrides,
}

/// Scan `script` line by line for `#SHEPHERD ...` comments and parse their
/// long-option tokens. Unrecognized options are ignored rather than
/// rejected, since a script may carry directives from a newer or older
/// Shepherd version.
#[must_use]
pub fn parse_directives(script: &str) -> ParsedDirectives {
    let mut parsed = ParsedDirectives::default();
    for line in script.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("#SHEPHERD") else { continue };
        let Some(tokens) = shlex::split(rest) else { continue };
        for token in tokens {
            let Some((key, value)) = token.split_once('=') else { continue };
            apply_option(&mut parsed, key, value);
        }
    }
    parsed
}

fn apply_option(parsed: &mut ParsedDirectives, key: &str, value: &str) {
    match key {
        "--partitions" => {
            parsed.partitions = value.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect();
        }
        "--gpus" => parsed.gpus = value.parse().ok(),
        "--mode" => parsed.run_mode = Some(value.to_string()),
        "--run-id" => parsed.run_id = Some(value.to_string()),
        "--min-vram" => parsed.min_vram = value.parse().ok(),
        "--max-vram" => parsed.max_vram = value.parse().ok(),
        "--prefer" => parsed.prefer = Some(value.to_string()),
        "--max-retries" => parsed.overrides.max_retries = value.parse().ok(),
        "--backoff-base-sec" => parsed.overrides.backoff_base_sec = value.parse().ok(),
        "--backoff-max-sec" => parsed.overrides.backoff_max_sec = value.parse().ok(),
        "--heartbeat-interval-sec" => parsed.overrides.heartbeat_interval_sec = value.parse().ok(),
        "--heartbeat-grace-sec" => parsed.overrides.heartbeat_grace_sec = value.parse().ok(),
        "--blacklist-ttl-sec" => parsed.overrides.blacklist_ttl_sec = value.parse().ok(),
        "--blacklist-limit" => parsed.overrides.blacklist_limit = value.parse().ok(),
        "--keep-alive-sec" => parsed.overrides.keep_alive_sec = value.parse().ok(),
        "--sbatch-args" => parsed.overrides.sbatch_args = Some(value.to_string()),
        "--sbatch-script" => parsed.overrides.sbatch_script = Some(value.to_string()),
        "--progress-stall-sec" => parsed.overrides.progress_stall_sec = value.parse().ok(),
        _ => {}
    }
}
