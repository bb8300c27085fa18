use smlreader::{console, get_unix_ts, Config, LogPublisher, PublishCycle, SmlManager};
use tokio::task::JoinHandle;
use std::{env, path::PathBuf, process::ExitCode, time::Duration};
use log::{error, info};


#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging, everything goes through the console writer
    console::init_logging();
    let mut threads: Vec<JoinHandle<()>> = Vec::new();
    if let Some(writer) = console::start_writer() {
        threads.push(writer);
    }

    let config_path = env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return shutdown(threads).await;
        }
    };

    let sml = match SmlManager::new(&config.sml) {
        Ok(m) => m,
        Err(e) => {
            error!("Unable to set up the read heads: {}", e);
            return shutdown(threads).await;
        }
    };
    let handles = sml.handles();
    threads.extend(sml.start_threads());

    /* Periodic publishing of all heads */
    let cycle = PublishCycle::new(config.publish.clone(), Box::new(LogPublisher), get_unix_ts());
    threads.push(tokio::spawn(async move {
        cycle.start_thread(handles).await;
    }));

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut kill_all_tasks = false;
        for task in threads.iter() {
            if task.is_finished() {
                kill_all_tasks = true;
            }
        }

        if kill_all_tasks == true {
            error!("A task stopped, shutting down");
            break;
        }
    }
    shutdown(threads).await
}

/// Gives the console writer a moment to flush, then stops every task.
async fn shutdown(threads: Vec<JoinHandle<()>>) -> ExitCode {
    tokio::time::sleep(Duration::from_millis(200)).await;
    for task in threads.iter() {
        task.abort();
    }
    ExitCode::FAILURE
}
