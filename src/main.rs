use anyhow::Result;
use clap::Parser;

use shellcache::{
    cli::{Cli, Command},
    logging,
    manifest::PrecacheManifest,
    run,
    settings::Settings,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::GenerateManifest { dir, output }) = &cli.command {
        let skip: Vec<&str> = output
            .file_name()
            .and_then(|n| n.to_str())
            .into_iter()
            .collect();
        let manifest = PrecacheManifest::generate(dir, &skip)?;
        manifest.save(output)?;
        println!(
            "wrote {} entries to {}",
            manifest.len(),
            output.display()
        );
        return Ok(());
    }

    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log)?;
    run(settings).await
}
