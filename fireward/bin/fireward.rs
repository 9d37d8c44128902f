use std::net::SocketAddr;

use clap::Parser;
use fireward::{
    cli::{FirewardArgs, FirewardSubcommand},
    config::FirewardConfig,
    init_logging,
    management::VmmManager,
    runtime::{stop_vmm, StopRequest},
    server::{serve, shutdown_signal},
    FirewardError, FirewardResult,
};
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> FirewardResult<()> {
    dotenvy::dotenv().ok();

    let args = FirewardArgs::parse();
    let mut config = FirewardConfig::load(args.config.as_deref())?;
    if args.verbose {
        config.log.level = Some("debug".to_string());
    }

    init_logging(&config.log)?;

    match args.subcommand {
        FirewardSubcommand::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }

            if let Some(port) = port {
                config.server.port = port;
            }

            let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
                .parse()
                .map_err(FirewardError::custom)?;

            let manager = VmmManager::new(config)?;
            serve(manager, addr, shutdown_signal()).await?;
        }
        FirewardSubcommand::Stop {
            id,
            arch,
            pid,
            chroot_base,
        } => {
            let request = StopRequest::builder()
                .id(id)
                .arch(arch)
                .pid(pid)
                .chroot_base(chroot_base)
                .shutdown_timeout(config.machine.shutdown_timeout())
                .preserve_sandbox_on_failure(config.machine.preserve_sandbox_on_failure)
                .build();

            let cancel = CancellationToken::new();
            let stop = stop_vmm(&request, &config.jailer, &cancel);
            tokio::pin!(stop);

            let result = tokio::select! {
                result = &mut stop => result,
                _ = shutdown_signal() => {
                    cancel.cancel();
                    stop.await
                }
            };

            match result {
                Ok(message) => println!("{}", message),
                Err(e) => {
                    eprintln!("{}", e);
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}
