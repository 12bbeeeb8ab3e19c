use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use stat_import_core::{Decision, TargetIdentityIndex, UnresolvedEntity};
use stat_import_store_sqlite::{
    import_statistics, DecisionProvider, ImportOptions, SkipAllDecider, StatsDb,
};

#[derive(Debug, Parser)]
#[command(name = "import-statistics")]
#[command(about = "Import long-term statistics from a source database into a target database")]
struct Cli {
    /// Path to the source database file
    source_db: PathBuf,

    /// Path to the target database file
    target_db: PathBuf,

    /// Number of rows to process in each batch
    #[arg(long, default_value_t = 1000)]
    batch_size: u64,

    /// Perform a dry run without modifying the target database
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

/// Blocking stdin/stdout decision protocol: a three-way menu per unresolved
/// name, with a narrower retry loop for entering a replacement name.
struct InteractiveDecider;

impl DecisionProvider for InteractiveDecider {
    fn decide(
        &mut self,
        entity: &UnresolvedEntity,
        example_value: &str,
        target: &TargetIdentityIndex,
    ) -> Result<Decision> {
        println!();
        println!("Missing metadata in target for: {}", entity.name);
        println!("Most recent value: {example_value}");

        loop {
            let choice = prompt_line(
                "Choose action [1-3] where 1=Skip  2=Skip all  3=Provide new statistic id: ",
            )?;
            match choice.as_str() {
                "1" => return Ok(Decision::SkipOnce),
                "2" => return Ok(Decision::SkipAll),
                "3" => return Ok(Decision::Remap(prompt_replacement(target)?)),
                _ => println!("Invalid action. Please try again."),
            }
        }
    }
}

/// Replacement names are validated here, so the engine never sees an
/// unknown replacement. Invalid names re-prompt for a name only; they do
/// not return to the three-way menu.
fn prompt_replacement(target: &TargetIdentityIndex) -> Result<String> {
    loop {
        let name = prompt_line("Enter new statistic id: ")?;
        if target.contains(&name) {
            return Ok(name);
        }
        println!("`{name}` not found in target database. Please try again.");
    }
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush().context("failed to flush stdout")?;

    let mut line = String::new();
    let read =
        io::stdin().lock().read_line(&mut line).context("failed to read operator input")?;
    if read == 0 {
        return Err(anyhow!("stdin closed while waiting for operator input"));
    }
    Ok(line.trim().to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    println!("Importing from {} to {}", cli.source_db.display(), cli.target_db.display());

    let source = StatsDb::open(&cli.source_db)?;
    let mut target = StatsDb::open(&cli.target_db)?;
    let options = ImportOptions { batch_size: cli.batch_size, dry_run: cli.dry_run };

    let report = if cli.dry_run {
        import_statistics(&source, &mut target, &options, &mut SkipAllDecider)?
    } else {
        import_statistics(&source, &mut target, &options, &mut InteractiveDecider)?
    };

    if cli.dry_run {
        println!();
        println!("This was a dry run. No changes were made to the target database.");
        if !report.unresolved.is_empty() {
            println!("The following entities were not found in the target database:");
            for entry in &report.unresolved {
                println!("{} ({})", entry.name, entry.example_value);
            }
        }
    }

    println!("Import completed.");
    Ok(())
}
