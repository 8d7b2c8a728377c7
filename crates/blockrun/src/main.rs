use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use block_core::io::catalog::Catalog;
use block_core::io::trace::TraceWriter;
use block_core::puzzle::builtin_levels;
use block_core::{replay_level, replay_puzzle, Config, Pacing, PuzzleCommand, Slot};
use clap::Parser;
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "blockrun",
    about = "Headless runner that replays a block program and writes its event trace as NDJSON"
)]
struct Args {
    /// Level catalog JSON; the built-in catalog when omitted.
    #[arg(long, value_name = "PATH")]
    levels: Option<PathBuf>,

    /// Block-coding level to run the program on.
    #[arg(long, default_value_t = 1)]
    level: u32,

    /// JSON array of program slots (`null` for an empty slot).
    #[arg(long, value_name = "PATH", conflicts_with = "puzzle", required_unless_present = "puzzle")]
    program: Option<PathBuf>,

    /// Built-in grid-puzzle level to run instead of a block level.
    #[arg(long, value_name = "ID", requires = "commands")]
    puzzle: Option<u32>,

    /// Comma-separated puzzle commands: up, down, left, right, wait.
    #[arg(long, value_delimiter = ',', value_parser = parse_command)]
    commands: Vec<PuzzleCommand>,

    /// Output NDJSON trace path.
    #[arg(long)]
    out: PathBuf,

    /// Runtime configuration JSON.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Sleep between steps as configured instead of replaying instantly.
    #[arg(long)]
    paced: bool,
}

fn parse_command(raw: &str) -> Result<PuzzleCommand, String> {
    serde_json::from_value(json!(raw.trim().to_ascii_lowercase()))
        .map_err(|_| format!("unknown command {raw:?}"))
}

fn load_program(path: &Path) -> Result<Vec<Slot>> {
    let file = File::open(path).with_context(|| format!("failed to open program {:?}", path))?;
    serde_json::from_reader(BufReader::new(file)).context("invalid program json")
}

fn pacing(config: &Config, paced: bool) -> Pacing {
    if paced {
        config.pacing
    } else {
        Pacing {
            hazard_tick: config.pacing.hazard_tick,
            ..Pacing::instant()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::default(),
    };
    let pacing = pacing(&config, args.paced);

    let (report, events) = match (args.puzzle, &args.program) {
        (Some(id), _) => {
            let levels = builtin_levels()?;
            let Some(level) = levels.iter().find(|level| level.id == id) else {
                bail!("no puzzle level {id}");
            };
            replay_puzzle(level, &args.commands, pacing).await?
        }
        (None, Some(path)) => {
            let catalog = match &args.levels {
                Some(levels) => Catalog::load_from_path(levels)?,
                None => Catalog::builtin()?,
            };
            let level = catalog
                .get(args.level)
                .with_context(|| format!("no level {} in catalog", args.level))?;
            let program = load_program(path)?;
            replay_level(level, &program, pacing).await?
        }
        (None, None) => bail!("either --program or --puzzle is required"),
    };

    let file = File::create(&args.out).with_context(|| format!("failed to create {:?}", args.out))?;
    let mut trace = TraceWriter::new(BufWriter::new(file));
    trace.record_all(&events)?;
    let lines = trace.lines_written();
    trace.into_inner()?;

    info!(lines, outcome = %report.outcome.message(), "run finished");
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{load_program, parse_command, Args};
    use block_core::strategy;
    use block_core::{replay_level, Catalog, Pacing};
    use clap::{error::ErrorKind, Parser};
    use proptest::prelude::*;

    #[test]
    fn requires_program_or_puzzle() {
        let err = Args::try_parse_from(["blockrun", "--out", "trace.ndjson"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn rejects_program_with_puzzle() {
        let err = Args::try_parse_from([
            "blockrun",
            "--program",
            "program.json",
            "--puzzle",
            "1",
            "--commands",
            "right",
            "--out",
            "trace.ndjson",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_comma_separated_commands() {
        let args = Args::try_parse_from([
            "blockrun",
            "--puzzle",
            "1",
            "--commands",
            "Right,down,wait",
            "--out",
            "trace.ndjson",
        ])
        .expect("args parse");
        assert_eq!(args.commands.len(), 3);
        assert!(parse_command("sideways").is_err());
    }

    #[test]
    fn puzzle_requires_commands() {
        let err = Args::try_parse_from(["blockrun", "--puzzle", "2", "--out", "t.ndjson"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn loads_program_with_empty_slots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("program.json");
        let json = r#"[
            {"blockId": "block-a-0", "blockType": "move", "icon": "➡️", "label": "forward"},
            null,
            {"blockId": "block-b-2", "blockType": "turn", "blockDirection": "left", "icon": "↩️", "label": "left"}
        ]"#;
        std::fs::write(&path, json).expect("write program");
        let program = load_program(&path).expect("program loads");
        assert_eq!(program.len(), 3);
        assert!(program[1].is_none());
        assert!(load_program(&dir.path().join("missing.json")).is_err());
    }

    fn replay_lines(program: &[block_core::Slot]) -> Vec<String> {
        let catalog = Catalog::builtin().expect("catalog");
        let level = catalog.get(5).expect("level 5").clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        match runtime.block_on(replay_level(&level, program, Pacing::instant())) {
            Ok((_, events)) => events
                .iter()
                .map(|event| serde_json::to_string(event).expect("event serializes"))
                .collect(),
            Err(err) => vec![err.to_string()],
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn paired_replays_are_identical(program in strategy::program(8)) {
            let first = replay_lines(&program);
            let second = replay_lines(&program);
            prop_assert_eq!(first, second);
        }
    }
}
