use anyhow::Context;
use contaflix::contaflix::Contaflix;
use contaflix::options::ContaflixOptions;
use contaflix::runtime::async_runtime;
use log::info;

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let options = ContaflixOptions::load().context("loading options")?;
    info!(options:?; "Starting ContaFlix server");

    let runtime = async_runtime(None)?;
    runtime.block_on(Contaflix::new(options).run())?;

    info!("ContaFlix server stopped");
    Ok(())
}
