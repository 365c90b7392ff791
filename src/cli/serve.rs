//! Memory service command.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use super::parsers::{parse_vm, VmSpec};
use vmmem::balloon::{BlockerFactory, CrosvmBalloon, TimedBalloonBlocker};
use vmmem::broker::boot_time_ms;
use vmmem::config::VmmemConfig;
use vmmem::error::Error;
use vmmem::service::{LocalGenerationWatcher, ServiceHandle, ServiceParts};
use vmmem::transport::bind_vsock;
use vmmem::{mglru, Result};

/// Run the memory service.
#[derive(Parser, Debug)]
#[command(about = "Run the memory balancing service for the host and its VMs")]
#[command(after_long_help = "\
The service listens on vsock for kill decision clients (port 7070 by default)
and MGLRU telemetry clients (port 7071 by default). Only the host and the VMs
given with --vm may connect.

EXAMPLES:
  vmmem serve --vm 5:/run/vm5.sock                  Manage one VM
  vmmem serve --vm 5:/a.sock --vm 6:/b.sock         Manage two VMs
  RUST_LOG=vmmem=debug vmmem serve --vm 5:/a.sock   Log every decision")]
pub struct ServeCmd {
    /// VM to manage, as CID and crosvm control socket
    #[arg(long = "vm", value_name = "CID:CONTROL_SOCKET", value_parser = parse_vm)]
    vms: Vec<VmSpec>,

    /// Largest balloon allowed per VM
    #[arg(long, default_value_t = 4096, value_name = "MIB")]
    max_balloon_mib: u64,

    /// crosvm binary used to resize balloons
    #[arg(long, value_name = "PATH")]
    crosvm: Option<PathBuf>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self, config: &VmmemConfig) -> Result<()> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Io)?;

        let timeouts = config.socket_timeouts();
        let kills_listener = bind_vsock(config.kills_port, timeouts)?;
        let telemetry_listener = bind_vsock(config.telemetry_port, timeouts)?;

        let page_size = mglru::page_size();
        let stats_path = config.local_mglru_path.clone();

        let parts = ServiceParts {
            kills_listener,
            telemetry_listener,
            max_connections: config.max_connections,
            blocker_factory: self.blocker_factory(config),
            local_stats: Box::new(move || match mglru::read_stats(&stats_path, page_size) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::debug!(error = %e, "host mglru stats unavailable");
                    None
                }
            }),
            clock: Box::new(boot_time_ms),
            broker: config.broker_settings(),
            reclaim: config.reclaim_settings(),
            reclaim_period: config.reclaim_period(),
        };

        let service = ServiceHandle::spawn(parts, runtime.handle().clone())?;
        for vm in &self.vms {
            service.register_vm(vm.cid, vm.control_socket.to_string_lossy())?;
        }

        let _watcher = LocalGenerationWatcher::start(
            runtime.handle(),
            config.local_mglru_path.clone(),
            page_size,
            config.local_poll_interval(),
            service.local_telemetry_notifier(),
        );

        tracing::info!(
            kills_port = config.kills_port,
            telemetry_port = config.telemetry_port,
            vms = self.vms.len(),
            "memory service listening"
        );

        runtime.block_on(shutdown_signal());
        service.shutdown();
        Ok(())
    }

    fn blocker_factory(&self, config: &VmmemConfig) -> BlockerFactory {
        let max_bytes = self.max_balloon_mib * 1024 * 1024;
        let block_duration = config.block_duration();
        let crosvm = self.crosvm.clone();

        Box::new(move |cid, target: &str, worker| {
            let mut balloon = CrosvmBalloon::new(target);
            if let Some(crosvm) = &crosvm {
                balloon = balloon.with_binary(crosvm.clone());
            }
            Box::new(TimedBalloonBlocker::new(
                cid,
                Arc::new(balloon),
                worker,
                max_bytes,
                block_duration,
            ))
        })
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
