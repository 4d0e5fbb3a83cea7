pub mod common;
pub mod config;
pub mod dataset;
pub mod logging;
pub mod message;
pub mod model;
pub mod train;

pub(crate) const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

use crate::common::*;

pub async fn start(config: config::Config) -> Result<()> {
    // data logging
    let start_time = Local::now();
    let log_dir = config
        .logging
        .log_dir
        .join(format!("{}", start_time.format(FILE_STRFTIME)));
    tokio::fs::create_dir_all(&log_dir).await?;

    // keep a copy of the config next to the logs
    tokio::fs::write(log_dir.join("config.json5"), json5::to_string(&config)?).await?;

    let config = Arc::new(config);
    let (log_tx, log_rx) = mpsc::channel(2);

    // training worker
    let train_fut = {
        let config = config.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            train::training_worker(config, log_tx)
        })
        .map(|result| Fallible::Ok(result??))
    };

    let log_fut = {
        let log_dir = log_dir.clone();

        tokio::task::spawn(logging::logging_worker(log_dir, log_rx))
            .map(|result| Fallible::Ok(result??))
    };

    // run all tasks
    futures::try_join!(train_fut, log_fut)?;

    Ok(())
}
