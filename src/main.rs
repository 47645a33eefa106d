use std::process::exit;

use anyhow::Context;
use clap::Parser;
use tokio::{signal, task::LocalSet};
use tpm2_proxy::{
    driver::{ActiveEndpoint, CommandLauncher, EndpointDriver, PassiveEndpoint},
    pcap::CaptureWriter,
    proxy::Proxy,
    utils::since_epoch,
};
use tracing::{error, info, warn};

use args::StartupArguments;

mod args;
mod logging;

fn main() {
    let startup_args = StartupArguments::parse();
    logging::init(&startup_args.log_level);

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!("Program finished with error: {error:#}");
        exit(1);
    }
}

async fn async_main(startup_args: StartupArguments) -> anyhow::Result<()> {
    let capture = match startup_args.capture_path(since_epoch().as_millis()) {
        Some(path) => {
            let capture = CaptureWriter::create(&path)
                .await
                .with_context(|| format!("Could not create capture file {}", path.display()))?;
            info!("Capturing traffic to {}", path.display());
            Some(capture)
        }
        None => None,
    };

    let upstream = ActiveEndpoint::new();
    tokio::select! {
        result = upstream.connect(&startup_args.upstream_control, &startup_args.upstream_data) => {
            result.context("Could not connect to the simulator")?;
        }
        _ = signal::ctrl_c() => {
            upstream.close().await;
            return Ok(());
        }
    }

    let launcher = CommandLauncher::new(&startup_args.helper).args(&startup_args.helper_args);
    let downstream = PassiveEndpoint::new(launcher);
    let passive_config = startup_args.passive_config();
    tokio::select! {
        result = downstream.listen_and_wait(&passive_config) => {
            if let Err(error) = result {
                upstream.close().await;
                downstream.close().await;
                return Err(error).context("Waiting for the bridging helper failed");
            }
        }
        _ = signal::ctrl_c() => {
            info!("Interrupted while waiting for the bridging helper");
            upstream.close().await;
            downstream.close().await;
            return Ok(());
        }
    }

    let mut proxy = Proxy::new(upstream, downstream);
    if let Some(capture) = capture {
        proxy = proxy.capture(capture);
    }

    let shutdown = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!("Could not listen for interrupts: {error}");
            std::future::pending::<()>().await;
        }
    };

    let exit = proxy
        .run_until(
            |handle, packet| async move { handle.send_to_downstream(&packet).await },
            |handle, packet| async move { handle.send_to_upstream(&packet).await },
            shutdown,
        )
        .await?;

    info!("Proxy stopped: {exit:?}");
    Ok(())
}
