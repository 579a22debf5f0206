use anyhow::Result;

use caat::{init_logging, train::Trainer, Args};
use clap::Parser;

async fn run(args: Args) -> Result<()> {
    let trainer = Trainer::new(args)?;
    trainer.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logging(args.tracing);
    run(args).await?;
    tracing::info!("done");
    Ok(())
}
