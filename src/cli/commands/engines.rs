//! Engine availability report.

use console::style;

use docsift::config::Settings;
use docsift::jobs::Orchestrator;
use docsift::ocr::check_binary;

/// List configured engines and the external tools they depend on.
pub async fn cmd_engines(settings: Settings) -> anyhow::Result<()> {
    println!("\n{}", style("OCR Engines").bold());
    println!("{}", "-".repeat(50));

    let orchestrator = Orchestrator::new(settings);
    let engines = orchestrator.engine_status();
    let mut available = 0;

    for engine in &engines {
        let status = if engine.available {
            available += 1;
            style("✓ available").green()
        } else {
            style("✗ not available").red()
        };
        println!("  {:<20} {}", engine.name, status);
        if !engine.available {
            println!("  {:<20} {}", "", style(&engine.hint).dim());
        }
    }

    println!("\n{}", style("Tools:").cyan());
    let pdftoppm = if check_binary("pdftoppm") {
        style("✓ found").green()
    } else {
        style("✗ not found (PDF input disabled)").red()
    };
    println!("  {:<20} {}", "pdftoppm", pdftoppm);

    println!(
        "\n  Merge policy: {}",
        style(orchestrator.settings().ocr.merge_policy.as_str()).cyan()
    );

    println!();
    if available == engines.len() {
        println!("{} All {} engine(s) available", style("✓").green(), available);
    } else if available > 0 {
        println!(
            "{} {} of {} engine(s) available; documents will be read by the rest",
            style("!").yellow(),
            available,
            engines.len()
        );
    } else {
        println!("{} No OCR engine available", style("✗").red());
    }
    Ok(())
}
